//! Replay session lifecycle state machine.
//!
//! One `TimeShiftSession` drives the seekable-playback lifecycle for a single
//! channel: establishing the clock, bounded retry on failure, connection
//! timeouts, play/pause/loop/seek transitions, debounced seeking, and
//! throttled head-position reporting.
//!
//! All mutable state lives inside a spawned actor task; the public handle
//! only sends commands and observes watch/broadcast channels. Renderer events
//! arrive on an arbitrary background context and are re-dispatched onto the
//! actor before touching any state.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::models::{AnchorPoint, ChannelId, SeekOrigin, SessionState};
use crate::renderer::{RendererEvent, RendererStatus, SeekOutcome, SeekableRenderer};
use crate::service::clock::PlaybackClock;
use crate::timing::{Debounced, Debouncer, OneShotTimer, Throttler};
use crate::{Error, Result};

/// Discrete session events, published alongside the state stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    /// A pending relative seek resolved.
    SeekCompleted { ok: bool },
    /// A command was refused in the current state.
    CommandRejected {
        command: String,
        state: SessionState,
    },
    /// A setup retry was scheduled after a failure.
    RetryScheduled { attempt: u32, delay_ms: u64 },
    /// The retry budget is spent; the failure is terminal until a new anchor
    /// is configured.
    RetriesExhausted,
}

enum Command {
    Play { loop_window: Option<Duration> },
    Pause,
    Stop,
    Seek {
        offset: chrono::Duration,
        origin: SeekOrigin,
    },
    PreventFurtherRetries,
    LimitBandwidth { bits_per_second: u64 },
    ClearBandwidthLimit,
}

enum TimerFire {
    Retry(u64),
    ConnectionTimeout(u64),
}

/// Handle to one channel's replay session.
///
/// Commands are fire-and-forget; outcomes surface on the state and event
/// streams. Dropping the handle (or calling [`dispose`](Self::dispose))
/// tears the session down.
pub struct TimeShiftSession {
    identity: ChannelId,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
    head_rx: watch::Receiver<Duration>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl TimeShiftSession {
    const EVENT_CHANNEL_CAPACITY: usize = 64;

    /// Spawn a session for `identity`, anchored at `anchor`.
    ///
    /// The session starts in `Starting` and attempts clock establishment
    /// immediately; a failed attempt surfaces as a `Failed` state, never as
    /// a constructor error.
    #[must_use]
    pub fn spawn(
        identity: ChannelId,
        renderer: Arc<dyn SeekableRenderer>,
        anchor: AnchorPoint,
        config: SessionConfig,
    ) -> Self {
        let (commands, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let (head_tx, head_rx) = watch::channel(Duration::ZERO);
        let (events, _) = broadcast::channel(Self::EVENT_CHANNEL_CAPACITY);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (debounce_tx, debounce_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let throttle_sink = head_tx.clone();
        let actor = SessionActor {
            identity: identity.clone(),
            renderer,
            anchor,
            state: SessionState::Starting,
            retries_remaining: config.max_retries,
            clock: None,
            seek_succeeded: false,
            pending_seek: None,
            state_tx,
            head_tx,
            head_throttle: Throttler::new(config.parse_head_throttle(), move |elapsed| {
                let _ = throttle_sink.send(elapsed);
            }),
            events: events.clone(),
            cancel: cancel.clone(),
            retry_timer: OneShotTimer::new(),
            timeout_timer: OneShotTimer::new(),
            timer_tx,
            seek_debounce: Debouncer::new(config.parse_seek_debounce(), debounce_tx),
            config,
        };
        tokio::spawn(actor.run(cmd_rx, timer_rx, debounce_rx));

        Self {
            identity,
            commands,
            state_rx,
            head_rx,
            events,
            cancel,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &ChannelId {
        &self.identity
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Last throttled head position, as elapsed time since the anchor.
    #[must_use]
    pub fn playback_head(&self) -> Duration {
        *self.head_rx.borrow()
    }

    /// Observe state transitions in the order they occurred.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Observe throttled head-position updates.
    #[must_use]
    pub fn watch_head(&self) -> watch::Receiver<Duration> {
        self.head_rx.clone()
    }

    /// Subscribe to discrete session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn play(&self) -> Result<()> {
        self.send(Command::Play { loop_window: None })
    }

    /// Play a loop of `window` from the current position.
    pub fn play_looped(&self, window: Duration) -> Result<()> {
        if window.is_zero() {
            return Err(Error::InvalidInput(
                "Loop window must be non-zero".to_string(),
            ));
        }
        self.send(Command::Play {
            loop_window: Some(window),
        })
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Request a debounced seek by `offset` from `origin`.
    pub fn seek(&self, offset: chrono::Duration, origin: SeekOrigin) -> Result<()> {
        self.send(Command::Seek { offset, origin })
    }

    /// Zero the retry budget and cancel any mid-countdown retry, effective
    /// immediately. Used when the upstream live stream itself goes away.
    pub fn prevent_further_retries(&self) -> Result<()> {
        self.send(Command::PreventFurtherRetries)
    }

    pub fn limit_bandwidth(&self, bits_per_second: u64) -> Result<()> {
        self.send(Command::LimitBandwidth { bits_per_second })
    }

    pub fn clear_bandwidth_limit(&self) -> Result<()> {
        self.send(Command::ClearBandwidthLimit)
    }

    /// Tear the session down: timers cancelled, subscriptions released,
    /// state reset to idle. Safe to call any number of times.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Disposed);
        }
        self.commands.send(command).map_err(|_| Error::Disposed)
    }
}

impl Drop for TimeShiftSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TimeShiftSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeShiftSession")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

struct SessionActor {
    identity: ChannelId,
    renderer: Arc<dyn SeekableRenderer>,
    anchor: AnchorPoint,
    state: SessionState,
    retries_remaining: u32,
    clock: Option<PlaybackClock>,
    seek_succeeded: bool,
    pending_seek: Option<oneshot::Receiver<SeekOutcome>>,
    state_tx: watch::Sender<SessionState>,
    head_tx: watch::Sender<Duration>,
    head_throttle: Throttler<Duration>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    retry_timer: OneShotTimer,
    timeout_timer: OneShotTimer,
    timer_tx: mpsc::UnboundedSender<TimerFire>,
    seek_debounce: Debouncer<(chrono::Duration, SeekOrigin)>,
    config: SessionConfig,
}

impl SessionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerFire>,
        mut debounce_rx: mpsc::UnboundedReceiver<Debounced<(chrono::Duration, SeekOrigin)>>,
    ) {
        tracing::debug!(channel_id = %self.identity, anchor = ?self.anchor, "Replay session starting");
        self.arm_connection_timeout();
        self.establish_clock();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.shutdown();
                    return;
                }
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                Some(fire) = timer_rx.recv() => self.handle_timer(fire),
                Some(seek) = debounce_rx.recv() => self.handle_debounced_seek(seek),
                event = Self::clock_event(&mut self.clock) => self.handle_renderer_event(event),
                outcome = Self::seek_completion(&mut self.pending_seek) => {
                    self.handle_seek_outcome(outcome);
                }
            }
        }
    }

    async fn clock_event(clock: &mut Option<PlaybackClock>) -> RendererEvent {
        match clock.as_mut() {
            Some(clock) => clock.next_event().await,
            None => std::future::pending().await,
        }
    }

    async fn seek_completion(
        pending: &mut Option<oneshot::Receiver<SeekOutcome>>,
    ) -> SeekOutcome {
        match pending.as_mut() {
            Some(rx) => match rx.await {
                Ok(outcome) => outcome,
                // A handle that dropped the completion without resolving it
                // counts as a failed seek.
                Err(_) => SeekOutcome::Failed(RendererStatus::InternalError),
            },
            None => std::future::pending().await,
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Play { loop_window } => self.try_play(loop_window),
            Command::Pause => self.try_pause(),
            Command::Stop => self.try_stop(),
            Command::Seek { offset, origin } => self.try_seek(offset, origin),
            Command::PreventFurtherRetries => self.prevent_further_retries(),
            Command::LimitBandwidth { bits_per_second } => {
                if let Some(clock) = self.clock.as_mut() {
                    clock.limit_bandwidth(bits_per_second);
                }
            }
            Command::ClearBandwidthLimit => {
                if let Some(clock) = self.clock.as_mut() {
                    clock.remove_bandwidth_limit();
                }
            }
        }
    }

    fn try_play(&mut self, loop_window: Option<Duration>) {
        let allowed =
            self.state.allows_play() || (self.state == SessionState::Seeking && self.seek_succeeded);
        if !allowed {
            self.reject("play");
            return;
        }
        let Some(clock) = self.clock.as_ref() else {
            self.reject("play");
            return;
        };
        match loop_window {
            Some(window) => clock.play_looped(window),
            None => clock.play(),
        }
        self.set_state(SessionState::Playing);
    }

    fn try_pause(&mut self) {
        if self.state != SessionState::Playing {
            self.reject("pause");
            return;
        }
        if let Some(clock) = self.clock.as_ref() {
            clock.pause();
        }
        self.set_state(SessionState::Paused);
    }

    fn try_stop(&mut self) {
        if !self.state.allows_seek() {
            self.reject("stop");
            return;
        }
        self.clear_pending_seek();
        if let Some(clock) = self.clock.as_ref() {
            clock.stop();
        }
        self.set_state(SessionState::ReadyToPlay);
    }

    fn try_seek(&mut self, offset: chrono::Duration, origin: SeekOrigin) {
        if !self.state.allows_seek() {
            self.reject("seek");
            return;
        }
        // Pause before moving the head; the pending completion of a previous
        // seek is abandoned so only the newest request can resolve.
        if let Some(clock) = self.clock.as_ref() {
            clock.pause();
        }
        self.pending_seek = None;
        self.seek_succeeded = false;
        self.set_state(SessionState::Seeking);
        self.arm_connection_timeout();
        self.seek_debounce.submit((offset, origin));
    }

    fn handle_debounced_seek(&mut self, seek: Debounced<(chrono::Duration, SeekOrigin)>) {
        if !self.seek_debounce.is_current(seek.generation) {
            return;
        }
        if self.state != SessionState::Seeking {
            return;
        }
        let Some(clock) = self.clock.as_ref() else {
            return;
        };
        let (offset, origin) = seek.value;
        tracing::debug!(
            channel_id = %self.identity,
            offset_ms = offset.num_milliseconds(),
            origin = ?origin,
            "Issuing debounced seek"
        );
        self.pending_seek = Some(clock.seek_by(offset, origin));
    }

    fn handle_seek_outcome(&mut self, outcome: SeekOutcome) {
        self.pending_seek = None;
        match outcome {
            SeekOutcome::Completed => {
                self.seek_succeeded = true;
                // The in-flight phase is over; whether to play is the
                // caller's decision, so the countdown stops here.
                self.timeout_timer.disarm();
                let _ = self.events.send(SessionEvent::SeekCompleted { ok: true });
            }
            SeekOutcome::Failed(status) => {
                tracing::warn!(channel_id = %self.identity, status = %status, "Relative seek failed");
                let _ = self.events.send(SessionEvent::SeekCompleted { ok: false });
                self.fail();
            }
        }
    }

    fn handle_timer(&mut self, fire: TimerFire) {
        match fire {
            TimerFire::Retry(generation) => {
                if !self.retry_timer.is_current(generation) {
                    return;
                }
                if self.state != SessionState::Starting {
                    return;
                }
                self.establish_clock();
            }
            TimerFire::ConnectionTimeout(generation) => {
                if !self.timeout_timer.is_current(generation) {
                    return;
                }
                if !self.state.counts_down() {
                    return;
                }
                self.force_fail();
            }
        }
    }

    fn handle_renderer_event(&mut self, event: RendererEvent) {
        match event {
            RendererEvent::ReadyForPlayback(true) => {
                // Re-affirmations while playing or seeking are not
                // transitions.
                if self.state == SessionState::Starting {
                    self.set_state(SessionState::ReadyToPlay);
                }
            }
            RendererEvent::ReadyForPlayback(false) => {}
            RendererEvent::Failure(status) if !status.is_ok() => {
                if matches!(self.state, SessionState::Playing | SessionState::Seeking) {
                    tracing::debug!(
                        channel_id = %self.identity,
                        status = %status,
                        state = %self.state,
                        "Ignoring failure signal outside the setup phase"
                    );
                } else {
                    tracing::warn!(
                        channel_id = %self.identity,
                        error = %Error::Remote(status),
                        "Remote stream failure"
                    );
                    self.fail();
                }
            }
            RendererEvent::Failure(_) => {}
            RendererEvent::PlaybackHead(head) => {
                if let Some(clock) = self.clock.as_ref() {
                    let elapsed = clock.elapsed_since_anchor(head);
                    self.head_throttle.submit(elapsed);
                }
            }
            RendererEvent::Ended(true) => {
                if self.state == SessionState::Playing {
                    self.set_state(SessionState::Ended);
                }
            }
            RendererEvent::Ended(false) => {}
        }
    }

    /// Attempt clock establishment; always drops any previous clock first so
    /// two live clocks never coexist for one session.
    fn establish_clock(&mut self) {
        self.clock = None;
        match PlaybackClock::establish(self.renderer.as_ref(), &self.anchor) {
            Some(clock) => {
                tracing::debug!(channel_id = %self.identity, "Seekable handle established");
                self.clock = Some(clock);
            }
            None => {
                tracing::warn!(
                    channel_id = %self.identity,
                    error = %Error::SetupFailed,
                    "Could not establish seekable handle"
                );
                self.fail();
            }
        }
    }

    /// Non-forced failure path: publish the failure, then consume a retry if
    /// any remain.
    fn fail(&mut self) {
        self.clear_pending_seek();
        self.clock = None;
        self.set_state(SessionState::Failed { forced: false });
        self.schedule_retry();
    }

    /// Timeout-induced failure: terminal, never auto-retried.
    fn force_fail(&mut self) {
        tracing::warn!(
            channel_id = %self.identity,
            state = %self.state,
            error = %Error::Timeout,
            "Replay timed out, forcing failure"
        );
        self.clear_pending_seek();
        if let Some(clock) = self.clock.as_ref() {
            clock.stop();
        }
        self.clock = None;
        self.retries_remaining = 0;
        self.retry_timer.disarm();
        self.set_state(SessionState::Failed { forced: true });
    }

    fn schedule_retry(&mut self) {
        if self.retries_remaining == 0 {
            tracing::warn!(
                channel_id = %self.identity,
                error = %Error::RetriesExhausted,
                "Replay failed with no retries remaining"
            );
            let _ = self.events.send(SessionEvent::RetriesExhausted);
            return;
        }
        self.retries_remaining -= 1;
        let attempt = self.config.max_retries - self.retries_remaining;
        let delay = self.config.parse_retry_delay();

        self.set_state(SessionState::Starting);
        let tx = self.timer_tx.clone();
        self.retry_timer.arm(delay, move |generation| {
            let _ = tx.send(TimerFire::Retry(generation));
        });
        tracing::info!(
            channel_id = %self.identity,
            attempt,
            remaining = self.retries_remaining,
            delay_ms = delay.as_millis() as u64,
            "Scheduled replay setup retry"
        );
        let _ = self.events.send(SessionEvent::RetryScheduled {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
    }

    fn prevent_further_retries(&mut self) {
        self.retries_remaining = 0;
        let retry_pending = self.state == SessionState::Starting && self.clock.is_none();
        self.retry_timer.disarm();
        tracing::info!(channel_id = %self.identity, "Further replay retries prevented");
        if retry_pending {
            // Nothing will ever complete this attempt; make that visible.
            self.set_state(SessionState::Failed { forced: false });
            let _ = self.events.send(SessionEvent::RetriesExhausted);
        }
    }

    fn reject(&mut self, command: &str) {
        let error = Error::CommandRejected {
            command: command.to_string(),
            state: self.state,
        };
        tracing::debug!(channel_id = %self.identity, error = %error, "Command rejected");
        let _ = self.events.send(SessionEvent::CommandRejected {
            command: command.to_string(),
            state: self.state,
        });
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        tracing::debug!(
            channel_id = %self.identity,
            from = %self.state,
            to = %next,
            "Replay state transition"
        );
        if !matches!(next, SessionState::Seeking) {
            self.seek_succeeded = false;
        }
        self.state = next;
        let _ = self.state_tx.send(next);
        if next.counts_down() {
            self.arm_connection_timeout();
        } else {
            self.timeout_timer.disarm();
        }
    }

    fn arm_connection_timeout(&mut self) {
        let tx = self.timer_tx.clone();
        self.timeout_timer
            .arm(self.config.parse_connection_timeout(), move |generation| {
                let _ = tx.send(TimerFire::ConnectionTimeout(generation));
            });
    }

    fn clear_pending_seek(&mut self) {
        self.pending_seek = None;
        self.seek_succeeded = false;
        self.seek_debounce.cancel();
    }

    fn shutdown(&mut self) {
        self.retry_timer.disarm();
        self.timeout_timer.disarm();
        self.clear_pending_seek();
        self.head_throttle.reset();
        self.clock = None;
        self.state = SessionState::Idle;
        let _ = self.state_tx.send(SessionState::Idle);
        let _ = self.head_tx.send(Duration::ZERO);
        self.cancel.cancel();
        tracing::debug!(channel_id = %self.identity, "Replay session disposed");
    }
}
