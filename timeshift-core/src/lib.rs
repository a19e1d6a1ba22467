//! Time-shifted replay control for live video channels.
//!
//! Builds a seekable replay lifecycle on top of an external media SDK:
//! per-channel session state machines with bounded retry and timeout
//! handling, debounced seeking, throttled head reporting, and a coordinator
//! that folds a channel set into one aggregate state with synchronized group
//! playback.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod renderer;
pub mod service;
pub mod timing;

#[cfg(test)]
pub mod test_helpers;

pub use config::{Config, ReplayWindow, SessionConfig};
pub use error::{Error, Result};
pub use models::{AggregateState, AnchorPoint, ChannelId, SeekOrigin, SessionState};
pub use service::{PlaybackClock, ReplayCoordinator, SessionEvent, TimeShiftSession};
