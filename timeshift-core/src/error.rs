use thiserror::Error;

use crate::models::{ChannelId, SessionState};
use crate::renderer::RendererStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Seekable handle could not be established")]
    SetupFailed,

    #[error("Command '{command}' rejected in state '{state}'")]
    CommandRejected { command: String, state: SessionState },

    #[error("Remote stream failure: {0}")]
    Remote(RendererStatus),

    #[error("Timed out waiting for the stream to become ready")]
    Timeout,

    #[error("No retries remaining")]
    RetriesExhausted,

    #[error("Channel already registered: {0}")]
    DuplicateChannel(ChannelId),

    #[error("Channel not registered: {0}")]
    UnknownChannel(ChannelId),

    #[error("Session has been disposed")]
    Disposed,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
