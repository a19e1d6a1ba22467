//! Scripted fakes for exercising the replay engine without a real SDK.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch};

use crate::models::{AnchorPoint, SeekOrigin, SessionState};
use crate::renderer::{
    BandwidthLimitHandle, RendererEvent, SeekHandle, SeekOutcome, SeekableRenderer,
};

/// Upper bound for any single awaited expectation in virtual-time tests.
pub const WAIT_BUDGET: Duration = Duration::from_secs(600);

/// Wait until the renderer has produced at least one handle.
pub async fn wait_for_handle(renderer: &FakeRenderer) -> Arc<FakeHandle> {
    for _ in 0..100 {
        if let Some(handle) = renderer.latest_handle() {
            return handle;
        }
        tokio::task::yield_now().await;
    }
    panic!("renderer handle was never requested");
}

/// Wait until the watched session state equals `want`.
pub async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    let waited = tokio::time::timeout(WAIT_BUDGET, async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            if rx.changed().await.is_err() {
                assert_eq!(*rx.borrow(), want, "state stream closed early");
                return;
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for state {want}");
}

/// Calls recorded by a [`FakeHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleCall {
    Play,
    PlayLooped(Duration),
    Pause,
    Stop,
    LimitBandwidth(u64),
}

/// A scripted renderer: optionally non-seekable, optionally failing the
/// first N establishment attempts, recording every handle it produced.
pub struct FakeRenderer {
    seekable: bool,
    failing_attempts: AtomicU32,
    seek_calls: AtomicU32,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
}

impl FakeRenderer {
    #[must_use]
    pub fn seekable() -> Self {
        Self {
            seekable: true,
            failing_attempts: AtomicU32::new(0),
            seek_calls: AtomicU32::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn not_seekable() -> Self {
        Self {
            seekable: false,
            ..Self::seekable()
        }
    }

    /// Fail the first `attempts` establishment calls with an absent handle.
    #[must_use]
    pub fn failing_attempts(attempts: u32) -> Self {
        Self {
            failing_attempts: AtomicU32::new(attempts),
            ..Self::seekable()
        }
    }

    #[must_use]
    pub fn always_failing() -> Self {
        Self::failing_attempts(u32::MAX)
    }

    /// How many times `seek` was invoked, successful or not.
    pub fn seek_calls(&self) -> u32 {
        self.seek_calls.load(Ordering::SeqCst)
    }

    /// The most recently produced handle, if any.
    pub fn latest_handle(&self) -> Option<Arc<FakeHandle>> {
        self.handles.lock().last().cloned()
    }
}

impl SeekableRenderer for FakeRenderer {
    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn seek(&self, _point: &AnchorPoint) -> Option<Arc<dyn SeekHandle>> {
        self.seek_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_attempts.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.failing_attempts.store(remaining - 1, Ordering::SeqCst);
            }
            return None;
        }
        let handle = Arc::new(FakeHandle::new());
        self.handles.lock().push(handle.clone());
        Some(handle)
    }
}

/// A scripted seekable handle: records commands, lets tests emit renderer
/// events and resolve pending seek completions.
pub struct FakeHandle {
    events: broadcast::Sender<RendererEvent>,
    calls: Mutex<Vec<HandleCall>>,
    seek_requests: Mutex<Vec<(chrono::Duration, SeekOrigin)>>,
    pending_seeks: Mutex<Vec<oneshot::Sender<SeekOutcome>>>,
    limit_drops: Arc<AtomicU32>,
}

impl FakeHandle {
    fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            calls: Mutex::new(Vec::new()),
            seek_requests: Mutex::new(Vec::new()),
            pending_seeks: Mutex::new(Vec::new()),
            limit_drops: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Deliver a renderer event to all subscribers.
    pub fn emit(&self, event: RendererEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<HandleCall> {
        self.calls.lock().clone()
    }

    pub fn seek_requests(&self) -> Vec<(chrono::Duration, SeekOrigin)> {
        self.seek_requests.lock().clone()
    }

    /// Resolve the oldest pending seek. Returns false when none is pending
    /// or the session abandoned the completion.
    pub fn resolve_seek(&self, outcome: SeekOutcome) -> bool {
        let Some(tx) = self.pending_seeks.lock().pop() else {
            return false;
        };
        tx.send(outcome).is_ok()
    }

    pub fn play_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, HandleCall::Play | HandleCall::PlayLooped(_)))
            .count()
    }

    /// How many bandwidth-limit guards have been dropped.
    pub fn limit_drops(&self) -> u32 {
        self.limit_drops.load(Ordering::SeqCst)
    }
}

impl SeekHandle for FakeHandle {
    fn play(&self) {
        self.calls.lock().push(HandleCall::Play);
    }

    fn pause(&self) {
        self.calls.lock().push(HandleCall::Pause);
    }

    fn stop(&self) {
        self.calls.lock().push(HandleCall::Stop);
    }

    fn play_looped(&self, window: Duration) {
        self.calls.lock().push(HandleCall::PlayLooped(window));
    }

    fn seek_by(
        &self,
        offset: chrono::Duration,
        origin: SeekOrigin,
    ) -> oneshot::Receiver<SeekOutcome> {
        let (tx, rx) = oneshot::channel();
        self.seek_requests.lock().push((offset, origin));
        self.pending_seeks.lock().push(tx);
        rx
    }

    fn limit_bandwidth(&self, bits_per_second: u64) -> Box<dyn BandwidthLimitHandle> {
        self.calls
            .lock()
            .push(HandleCall::LimitBandwidth(bits_per_second));
        Box::new(FakeLimitGuard {
            drops: self.limit_drops.clone(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<RendererEvent> {
        self.events.subscribe()
    }
}

struct FakeLimitGuard {
    drops: Arc<AtomicU32>,
}

impl BandwidthLimitHandle for FakeLimitGuard {}

impl Drop for FakeLimitGuard {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
