//! Boundary traits for the underlying media SDK.
//!
//! The transport, decoding, and rendering layers are external. This module
//! models the one capability the replay engine builds on: given a point in
//! time, produce a seekable playback handle over a live stream's recent
//! buffer, with observable readiness/failure/head-position/ended events.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

use crate::models::{AnchorPoint, SeekOrigin};

/// Status codes reported by the renderer's failure stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendererStatus {
    Ok,
    Unavailable,
    NetworkError,
    InternalError,
}

impl RendererStatus {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for RendererStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::NetworkError => write!(f, "network_error"),
            Self::InternalError => write!(f, "internal_error"),
        }
    }
}

/// Events delivered by a seekable handle.
///
/// Delivery happens on an arbitrary background context; consumers must
/// re-dispatch onto their own serialized context before touching state.
#[derive(Debug, Clone)]
pub enum RendererEvent {
    ReadyForPlayback(bool),
    Failure(RendererStatus),
    PlaybackHead(DateTime<Utc>),
    Ended(bool),
}

/// One-shot result of an asynchronous relative seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    Completed,
    Failed(RendererStatus),
}

/// Opaque guard for an active bandwidth limitation.
///
/// Dropping the handle removes the limit.
pub trait BandwidthLimitHandle: Send {}

/// A renderer for one live channel, as exposed by the media SDK.
#[cfg_attr(test, mockall::automock)]
pub trait SeekableRenderer: Send + Sync {
    /// Whether the stream currently offers a seekable buffer at all.
    fn is_seekable(&self) -> bool;

    /// Establish a seekable handle anchored at `point`.
    ///
    /// Returns `None` when no handle can be produced. This is a valid
    /// terminal outcome of the call, not an exceptional condition.
    fn seek(&self, point: &AnchorPoint) -> Option<Arc<dyn SeekHandle>>;
}

/// An established seekable playback handle.
///
/// Commands are fire-and-forget; their effects surface asynchronously on the
/// subscribed event stream. The relative seek is the one operation with an
/// explicit async completion.
#[cfg_attr(test, mockall::automock)]
pub trait SeekHandle: Send + Sync {
    fn play(&self);

    fn pause(&self);

    fn stop(&self);

    /// Play a loop of `window` starting at the current head.
    fn play_looped(&self, window: Duration);

    /// Move the head by `offset` measured from `origin`.
    fn seek_by(
        &self,
        offset: chrono::Duration,
        origin: SeekOrigin,
    ) -> oneshot::Receiver<SeekOutcome>;

    /// Best-effort bandwidth cap; drop the returned handle to lift it.
    fn limit_bandwidth(&self, bits_per_second: u64) -> Box<dyn BandwidthLimitHandle>;

    /// Subscribe to readiness/failure/head/ended events.
    fn subscribe(&self) -> broadcast::Receiver<RendererEvent>;
}
