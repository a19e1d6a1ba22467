//! Multi-channel replay coordination.
//!
//! A `ReplayCoordinator` owns one session per channel (think multi-angle
//! views of the same event), folds their states into a single aggregate, and
//! drives group actions: start everything, stop everything, scrub everything,
//! and re-seek everything to a common point with a synchronized start.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::models::{AggregateState, AnchorPoint, ChannelId, SeekOrigin, SessionState};
use crate::renderer::SeekableRenderer;
use crate::service::session::{SessionEvent, TimeShiftSession};
use crate::{Error, Result};

struct Member {
    renderer: Arc<dyn SeekableRenderer>,
    session: Arc<TimeShiftSession>,
}

enum CoordCommand {
    Watch {
        id: ChannelId,
        session: Arc<TimeShiftSession>,
    },
    Unwatch {
        id: ChannelId,
    },
    SeekAllTo {
        elapsed: chrono::Duration,
        loop_window: Option<Duration>,
    },
}

/// Coordinates the replay sessions of a channel set.
///
/// The coordinator never retries on a member's behalf; each session owns its
/// own retry policy. It only derives aggregate state and fans group intents
/// out to the members whose current state permits them.
pub struct ReplayCoordinator {
    members: Arc<DashMap<ChannelId, Member>>,
    commands: mpsc::UnboundedSender<CoordCommand>,
    aggregate_rx: watch::Receiver<AggregateState>,
    config: SessionConfig,
    cancel: CancellationToken,
}

impl ReplayCoordinator {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let members: Arc<DashMap<ChannelId, Member>> = Arc::new(DashMap::new());
        let (commands, cmd_rx) = mpsc::unbounded_channel();
        let (aggregate_tx, aggregate_rx) = watch::channel(AggregateState::Idle);
        let cancel = CancellationToken::new();

        let actor = CoordinatorActor {
            members: members.clone(),
            aggregate_tx,
            states: StreamMap::new(),
            events: StreamMap::new(),
            current: HashMap::new(),
            barrier: None,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            members,
            commands,
            aggregate_rx,
            config,
            cancel,
        }
    }

    /// Create and adopt a replay session for `id`.
    ///
    /// Channel identities are unique within a coordinator.
    pub fn register_channel(
        &self,
        id: ChannelId,
        renderer: Arc<dyn SeekableRenderer>,
        anchor: AnchorPoint,
    ) -> Result<Arc<TimeShiftSession>> {
        match self.members.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::DuplicateChannel(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let session = Arc::new(TimeShiftSession::spawn(
                    id.clone(),
                    renderer.clone(),
                    anchor,
                    self.config.clone(),
                ));
                slot.insert(Member {
                    renderer,
                    session: session.clone(),
                });
                let _ = self.commands.send(CoordCommand::Watch {
                    id: id.clone(),
                    session: session.clone(),
                });
                tracing::info!(channel_id = %id, "Channel registered for replay");
                Ok(session)
            }
        }
    }

    /// Dispose and forget the session for `id`.
    pub fn remove_channel(&self, id: &ChannelId) -> Result<()> {
        let Some((_, member)) = self.members.remove(id) else {
            return Err(Error::UnknownChannel(id.clone()));
        };
        member.session.dispose();
        let _ = self.commands.send(CoordCommand::Unwatch { id: id.clone() });
        tracing::info!(channel_id = %id, "Channel removed from replay");
        Ok(())
    }

    /// The session currently owned for `id`, if any.
    #[must_use]
    pub fn session(&self, id: &ChannelId) -> Option<Arc<TimeShiftSession>> {
        self.members.get(id).map(|member| member.session.clone())
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.members.len()
    }

    /// Current aggregate replay state.
    #[must_use]
    pub fn aggregate(&self) -> AggregateState {
        *self.aggregate_rx.borrow()
    }

    /// Observe aggregate state changes.
    #[must_use]
    pub fn watch_aggregate(&self) -> watch::Receiver<AggregateState> {
        self.aggregate_rx.clone()
    }

    /// Start playback on every member that is ready; others are untouched.
    pub fn play_all(&self, loop_window: Option<Duration>) {
        for entry in self.members.iter() {
            let session = &entry.value().session;
            if session.state() == SessionState::ReadyToPlay {
                let result = match loop_window {
                    Some(window) => session.play_looped(window),
                    None => session.play(),
                };
                if result.is_err() {
                    tracing::warn!(channel_id = %entry.key(), "Member disposed during play_all");
                }
            }
        }
    }

    /// Stop every member that is seeking or playing.
    pub fn stop_all(&self) {
        for entry in self.members.iter() {
            let session = &entry.value().session;
            if matches!(
                session.state(),
                SessionState::Seeking | SessionState::Playing
            ) {
                let _ = session.stop();
            }
        }
    }

    /// Scrub every playing member by `offset` from its current head.
    pub fn move_playback_all(&self, offset: chrono::Duration) {
        for entry in self.members.iter() {
            let session = &entry.value().session;
            if session.state() == SessionState::Playing {
                let _ = session.seek(offset, SeekOrigin::Current);
            }
        }
    }

    /// Re-seek every eligible member to a common elapsed offset from the
    /// anchor, deferring playback until all of them have completed the seek,
    /// so the channels start in lockstep rather than staggered.
    pub fn seek_all_to(&self, elapsed: chrono::Duration, loop_window: Option<Duration>) {
        let _ = self.commands.send(CoordCommand::SeekAllTo {
            elapsed,
            loop_window,
        });
    }

    /// Discard every member session and recreate it against a fresh anchor.
    pub fn configure_playback(&self, anchor: AnchorPoint) {
        let ids: Vec<ChannelId> = self.members.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            let Some(mut member) = self.members.get_mut(&id) else {
                continue;
            };
            member.session.dispose();
            let session = Arc::new(TimeShiftSession::spawn(
                id.clone(),
                member.renderer.clone(),
                anchor,
                self.config.clone(),
            ));
            member.session = session.clone();
            let _ = self.commands.send(CoordCommand::Watch { id, session });
        }
        tracing::info!("Replay reconfigured with a fresh anchor");
    }

    /// Dispose all members and stop aggregating. Safe to call repeatedly.
    pub fn dispose(&self) {
        for entry in self.members.iter() {
            entry.value().session.dispose();
        }
        self.members.clear();
        self.cancel.cancel();
    }
}

impl Drop for ReplayCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ReplayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCoordinator")
            .field("channels", &self.members.len())
            .field("aggregate", &self.aggregate())
            .finish()
    }
}

/// Outstanding synchronized re-seek: which members still owe a completion,
/// and what to start once none do.
struct SeekBarrier {
    waiting: HashSet<ChannelId>,
    participants: HashSet<ChannelId>,
    loop_window: Option<Duration>,
}

struct CoordinatorActor {
    members: Arc<DashMap<ChannelId, Member>>,
    aggregate_tx: watch::Sender<AggregateState>,
    states: StreamMap<ChannelId, WatchStream<SessionState>>,
    events: StreamMap<ChannelId, BroadcastStream<SessionEvent>>,
    current: HashMap<ChannelId, SessionState>,
    barrier: Option<SeekBarrier>,
    cancel: CancellationToken,
}

impl CoordinatorActor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<CoordCommand>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => return,
                },
                Some((id, state)) = self.states.next(), if !self.states.is_empty() => {
                    self.current.insert(id, state);
                    self.recompute();
                }
                Some((id, event)) = self.events.next(), if !self.events.is_empty() => {
                    self.handle_member_event(id, event);
                }
            }
        }
    }

    fn handle_command(&mut self, command: CoordCommand) {
        match command {
            CoordCommand::Watch { id, session } => {
                // A replaced session (configure_playback) drops out of any
                // outstanding barrier; its completions belong to the old one.
                if let Some(barrier) = self.barrier.as_mut() {
                    barrier.waiting.remove(&id);
                    barrier.participants.remove(&id);
                }
                self.current.insert(id.clone(), session.state());
                self.states
                    .insert(id.clone(), WatchStream::new(session.watch_state()));
                self.events
                    .insert(id, BroadcastStream::new(session.subscribe()));
                self.maybe_release_barrier();
                self.recompute();
            }
            CoordCommand::Unwatch { id } => {
                self.states.remove(&id);
                self.events.remove(&id);
                self.current.remove(&id);
                if let Some(barrier) = self.barrier.as_mut() {
                    barrier.waiting.remove(&id);
                    barrier.participants.remove(&id);
                }
                self.maybe_release_barrier();
                self.recompute();
            }
            CoordCommand::SeekAllTo {
                elapsed,
                loop_window,
            } => {
                let mut participants = HashSet::new();
                for entry in self.members.iter() {
                    let session = &entry.value().session;
                    if session.state().allows_seek()
                        && session.seek(elapsed, SeekOrigin::Anchor).is_ok()
                    {
                        participants.insert(entry.key().clone());
                    }
                }
                if participants.is_empty() {
                    tracing::debug!("Bulk re-seek requested with no eligible members");
                    self.barrier = None;
                } else {
                    tracing::info!(
                        members = participants.len(),
                        elapsed_ms = elapsed.num_milliseconds(),
                        "Bulk re-seek started, playback deferred until all complete"
                    );
                    self.barrier = Some(SeekBarrier {
                        waiting: participants.clone(),
                        participants,
                        loop_window,
                    });
                }
            }
        }
    }

    fn handle_member_event(
        &mut self,
        id: ChannelId,
        event: std::result::Result<SessionEvent, BroadcastStreamRecvError>,
    ) {
        let event = match event {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(channel_id = %id, skipped, "Member event stream lagged");
                return;
            }
        };
        if let SessionEvent::SeekCompleted { ok } = event {
            let Some(barrier) = self.barrier.as_mut() else {
                return;
            };
            if !barrier.waiting.remove(&id) {
                return;
            }
            if !ok {
                // A member whose seek failed will never report success; it
                // leaves the barrier so the others still start together.
                tracing::warn!(channel_id = %id, "Member dropped out of synchronized re-seek");
                barrier.participants.remove(&id);
            }
            self.maybe_release_barrier();
        }
    }

    fn maybe_release_barrier(&mut self) {
        let complete = self
            .barrier
            .as_ref()
            .is_some_and(|barrier| barrier.waiting.is_empty());
        if !complete {
            return;
        }
        let Some(barrier) = self.barrier.take() else {
            return;
        };
        if barrier.participants.is_empty() {
            tracing::warn!("Synchronized re-seek finished with no members left to start");
            return;
        }
        tracing::info!(
            members = barrier.participants.len(),
            "All members completed seeking, starting playback together"
        );
        for id in &barrier.participants {
            let Some(member) = self.members.get(id) else {
                continue;
            };
            let result = match barrier.loop_window {
                Some(window) => member.session.play_looped(window),
                None => member.session.play(),
            };
            if result.is_err() {
                tracing::warn!(channel_id = %id, "Member disposed before synchronized start");
            }
        }
    }

    fn recompute(&mut self) {
        let next = AggregateState::derive(self.current.values().copied());
        self.aggregate_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                tracing::debug!(aggregate = ?next, "Aggregate replay state changed");
                *current = next;
                true
            }
        });
    }
}
