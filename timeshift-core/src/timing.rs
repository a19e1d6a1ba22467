//! Cancellable scheduled-task primitives.
//!
//! Replay sessions lean on three time-windowed building blocks: a one-shot
//! timer for retry delays and connection timeouts, a debouncer that coalesces
//! bursts of seek requests, and a throttler that rate-limits playback-head
//! updates. All three are private per-session instances; none are shared
//! across sessions.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A one-shot cancellable delay.
///
/// At most one arming is outstanding at a time: arming again replaces the
/// previous one. Every arm/disarm bumps a generation counter, so a fire that
/// raced a cancellation can be recognized as stale by checking
/// [`is_current`](Self::is_current) with the generation the callback
/// received.
#[derive(Debug)]
pub struct OneShotTimer {
    token: CancellationToken,
    generation: u64,
}

impl OneShotTimer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            generation: 0,
        }
    }

    /// Arm the timer, replacing any previous arming.
    ///
    /// Returns the generation that will be handed to `on_fire`.
    pub fn arm<F>(&mut self, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.token.cancel();
        self.token = CancellationToken::new();
        self.generation += 1;

        let generation = self.generation;
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => on_fire(generation),
            }
        });
        generation
    }

    /// Cancel any pending fire and invalidate its generation.
    pub fn disarm(&mut self) {
        self.token.cancel();
        self.generation += 1;
    }

    /// Whether `generation` belongs to the latest arming.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Default for OneShotTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// A value delivered by a [`Debouncer`] after its quiet window elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debounced<T> {
    pub value: T,
    pub generation: u64,
}

/// Quiet-window coalescing onto a channel.
///
/// Each [`submit`](Self::submit) restarts the window; once no submission has
/// arrived for a full window, the LAST submitted value is delivered to the
/// channel. Consumers should validate the generation against
/// [`is_current`](Self::is_current) before acting.
#[derive(Debug)]
pub struct Debouncer<T> {
    window: Duration,
    timer: OneShotTimer,
    tx: mpsc::UnboundedSender<Debounced<T>>,
}

impl<T: Send + 'static> Debouncer<T> {
    #[must_use]
    pub fn new(window: Duration, tx: mpsc::UnboundedSender<Debounced<T>>) -> Self {
        Self {
            window,
            timer: OneShotTimer::new(),
            tx,
        }
    }

    /// Submit a value, restarting the quiet window.
    pub fn submit(&mut self, value: T) -> u64 {
        let tx = self.tx.clone();
        self.timer.arm(self.window, move |generation| {
            let _ = tx.send(Debounced { value, generation });
        })
    }

    /// Drop whatever is pending without delivering it.
    pub fn cancel(&mut self) {
        self.timer.disarm();
    }

    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.timer.is_current(generation)
    }
}

struct ThrottleWindow<T> {
    last_emit: Option<tokio::time::Instant>,
    pending: Option<T>,
    trailing_armed: bool,
}

/// Rate-limiter that emits at most once per window, latest value wins.
///
/// The first value after an idle period is emitted immediately; values
/// arriving inside an open window are stashed, and the most recent of them
/// is flushed when the window closes. Values are coalesced, never averaged.
pub struct Throttler<T> {
    window: Duration,
    emit: Arc<dyn Fn(T) + Send + Sync>,
    shared: Arc<Mutex<ThrottleWindow<T>>>,
    timer: OneShotTimer,
}

impl<T: Send + 'static> Throttler<T> {
    pub fn new<F>(window: Duration, emit: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            window,
            emit: Arc::new(emit),
            shared: Arc::new(Mutex::new(ThrottleWindow {
                last_emit: None,
                pending: None,
                trailing_armed: false,
            })),
            timer: OneShotTimer::new(),
        }
    }

    /// Offer a value; emits now or schedules a trailing flush.
    pub fn submit(&mut self, value: T) {
        let now = tokio::time::Instant::now();
        let mut shared = self.shared.lock();

        let open_window = shared
            .last_emit
            .map(|at| now.duration_since(at) < self.window);
        match open_window {
            Some(true) => {
                shared.pending = Some(value);
                if !shared.trailing_armed {
                    shared.trailing_armed = true;
                    let elapsed = shared
                        .last_emit
                        .map_or(Duration::ZERO, |at| now.duration_since(at));
                    let remaining = self.window.saturating_sub(elapsed);
                    let emit = Arc::clone(&self.emit);
                    let state = Arc::clone(&self.shared);
                    drop(shared);
                    self.timer.arm(remaining, move |_generation| {
                        let flushed = {
                            let mut state = state.lock();
                            state.trailing_armed = false;
                            state.last_emit = Some(tokio::time::Instant::now());
                            state.pending.take()
                        };
                        if let Some(value) = flushed {
                            emit(value);
                        }
                    });
                }
            }
            _ => {
                shared.last_emit = Some(now);
                shared.pending = None;
                drop(shared);
                (self.emit)(value);
            }
        }
    }

    /// Forget the open window and anything pending in it.
    pub fn reset(&mut self) {
        self.timer.disarm();
        let mut shared = self.shared.lock();
        shared.last_emit = None;
        shared.pending = None;
        shared.trailing_armed = false;
    }
}

impl<T> std::fmt::Debug for Throttler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("window", &self.window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = OneShotTimer::new();
        timer.arm(Duration::from_millis(100), move |generation| {
            let _ = tx.send(generation);
        });

        let generation = rx.recv().await.expect("timer fired");
        assert!(timer.is_current(generation));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_disarm_cancels() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let mut timer = OneShotTimer::new();
        timer.arm(Duration::from_millis(100), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.disarm();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_rearm_replaces() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = OneShotTimer::new();

        let tx1 = tx.clone();
        let first = timer.arm(Duration::from_millis(100), move |g| {
            let _ = tx1.send(("first", g));
        });
        let second = timer.arm(Duration::from_millis(100), move |g| {
            let _ = tx.send(("second", g));
        });

        let (label, generation) = rx.recv().await.expect("replacement fired");
        assert_eq!(label, "second");
        assert_eq!(generation, second);
        assert!(!timer.is_current(first));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_delivers_last_value() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(Duration::from_millis(500), tx);

        for offset in 1..=5u64 {
            debouncer.submit(offset);
        }

        let delivered = rx.recv().await.expect("debounced value");
        assert_eq!(delivered.value, 5);
        assert!(debouncer.is_current(delivered.generation));

        // No further deliveries for the earlier submissions.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_cancel_drops_pending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(Duration::from_millis(500), tx);

        debouncer.submit(42u64);
        debouncer.cancel();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());

        drop(debouncer);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttler_emits_latest_per_window() {
        let emitted: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let mut throttler = Throttler::new(Duration::from_millis(500), move |v| {
            sink.lock().push(v);
        });

        throttler.submit(1);
        throttler.submit(2);
        throttler.submit(3);

        // Leading edge fires immediately; the burst collapses to its latest.
        assert_eq!(*emitted.lock(), vec![1]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*emitted.lock(), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttler_reset_discards_pending() {
        let emitted: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let mut throttler = Throttler::new(Duration::from_millis(500), move |v| {
            sink.lock().push(v);
        });

        throttler.submit(1);
        throttler.submit(2);
        throttler.reset();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*emitted.lock(), vec![1]);
    }
}
