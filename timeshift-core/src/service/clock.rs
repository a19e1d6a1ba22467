//! Exclusive-ownership wrapper around one seekable playback handle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot};

use crate::models::{AnchorPoint, SeekOrigin};
use crate::renderer::{
    BandwidthLimitHandle, RendererEvent, SeekHandle, SeekOutcome, SeekableRenderer,
};

/// One established replay clock.
///
/// A session owns exactly one clock at a time; replacing it (on retry) drops
/// the old handle and its event subscription before the new one exists, so
/// ghost events from a stale handle can never reach the session.
pub struct PlaybackClock {
    handle: Arc<dyn SeekHandle>,
    events: Option<broadcast::Receiver<RendererEvent>>,
    anchor_instant: DateTime<Utc>,
    bandwidth_guard: Option<Box<dyn BandwidthLimitHandle>>,
}

impl PlaybackClock {
    /// Establish a seekable handle anchored at `point`.
    ///
    /// Returns `None` when the renderer is not seekable or yields no handle.
    /// Both are valid terminal outcomes of the attempt, not errors; the
    /// caller converts them into its failure path.
    #[must_use]
    pub fn establish(renderer: &dyn SeekableRenderer, point: &AnchorPoint) -> Option<Self> {
        if !renderer.is_seekable() {
            return None;
        }
        let handle = renderer.seek(point)?;
        let events = handle.subscribe();
        Some(Self {
            handle,
            events: Some(events),
            anchor_instant: point.resolve(Utc::now()),
            bandwidth_guard: None,
        })
    }

    pub fn play(&self) {
        self.handle.play();
    }

    pub fn pause(&self) {
        self.handle.pause();
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn play_looped(&self, window: Duration) {
        self.handle.play_looped(window);
    }

    /// Request a relative seek; completion arrives on the returned receiver.
    pub fn seek_by(
        &self,
        offset: chrono::Duration,
        origin: SeekOrigin,
    ) -> oneshot::Receiver<SeekOutcome> {
        self.handle.seek_by(offset, origin)
    }

    /// Apply a best-effort bandwidth cap, replacing any existing one.
    pub fn limit_bandwidth(&mut self, bits_per_second: u64) {
        self.bandwidth_guard = Some(self.handle.limit_bandwidth(bits_per_second));
    }

    /// Lift the bandwidth cap by dropping its guard.
    pub fn remove_bandwidth_limit(&mut self) {
        self.bandwidth_guard = None;
    }

    /// The UTC instant this clock's anchor resolved to.
    #[must_use]
    pub fn anchor_instant(&self) -> DateTime<Utc> {
        self.anchor_instant
    }

    /// Elapsed duration from the anchor to `head`, clamped at zero.
    #[must_use]
    pub fn elapsed_since_anchor(&self, head: DateTime<Utc>) -> Duration {
        (head - self.anchor_instant).to_std().unwrap_or(Duration::ZERO)
    }

    /// Await the next renderer event.
    ///
    /// Lagged deliveries are skipped with a warning. Once the underlying
    /// stream closes this future never resolves again; the owning session
    /// notices silence through its own timeout machinery.
    pub async fn next_event(&mut self) -> RendererEvent {
        loop {
            match self.events.as_mut() {
                None => std::future::pending::<()>().await,
                Some(rx) => match rx.recv().await {
                    Ok(event) => return event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Renderer event stream lagged, skipping ahead");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Renderer event stream closed");
                        self.events = None;
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for PlaybackClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackClock")
            .field("anchor_instant", &self.anchor_instant)
            .field("limited", &self.bandwidth_guard.is_some())
            .finish()
    }
}
