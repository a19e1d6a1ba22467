//! Replay session and aggregate state types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The point in the live buffer a replay session is anchored to.
///
/// Immutable for the life of a session; changing the anchor means disposing
/// the session and creating a new one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AnchorPoint {
    /// An absolute UTC timestamp inside the buffered window.
    Absolute(DateTime<Utc>),
    /// An offset backwards from the live edge.
    BeforeLive(Duration),
}

impl AnchorPoint {
    /// Resolve the anchor to a concrete UTC instant.
    ///
    /// `BeforeLive` resolves against `now`, so the result is only stable once
    /// a seekable handle has been established for it.
    #[must_use]
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Absolute(ts) => *ts,
            Self::BeforeLive(offset) => {
                now - chrono::Duration::from_std(*offset).unwrap_or_else(|_| chrono::Duration::zero())
            }
        }
    }
}

/// Origin a relative seek is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekOrigin {
    /// The session's resolved anchor instant.
    Anchor,
    /// The current playback head.
    Current,
}

/// Lifecycle state of one replay session.
///
/// `Failed { forced: true }` means the failure was induced locally (timeout
/// or abort) rather than signalled by the remote stream; forced failures are
/// never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    ReadyToPlay,
    Playing,
    Seeking,
    Paused,
    Ended,
    Failed { forced: bool },
}

impl SessionState {
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// States from which `play` is accepted. A completed seek widens this set
    /// to include `Seeking`; the session tracks that separately.
    #[must_use]
    pub const fn allows_play(&self) -> bool {
        matches!(self, Self::ReadyToPlay | Self::Paused | Self::Ended)
    }

    /// States from which `seek` and `stop` are accepted.
    #[must_use]
    pub const fn allows_seek(&self) -> bool {
        matches!(
            self,
            Self::Playing | Self::Paused | Self::Seeking | Self::Ended
        )
    }

    /// The connection-timeout countdown runs only while the session is
    /// establishing a handle or waiting on a seek.
    #[must_use]
    pub const fn counts_down(&self) -> bool {
        matches!(self, Self::Starting | Self::Seeking)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::ReadyToPlay => write!(f, "ready_to_play"),
            Self::Playing => write!(f, "playing"),
            Self::Seeking => write!(f, "seeking"),
            Self::Paused => write!(f, "paused"),
            Self::Ended => write!(f, "ended"),
            Self::Failed { forced: true } => write!(f, "failed(forced)"),
            Self::Failed { forced: false } => write!(f, "failed"),
        }
    }
}

/// Coordinator-level state derived from a set of member sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    /// No members registered.
    Idle,
    Loading,
    Seeking,
    ReadyToPlay,
    Playing,
    Ended,
    Failure,
}

impl AggregateState {
    /// Derive the aggregate from member states.
    ///
    /// Precedence, first match wins:
    /// 1. all members failed -> `Failure`
    /// 2. failed members are dropped from consideration
    /// 3. all remaining playing -> `Playing`
    /// 4. any remaining starting (or idle) -> `Loading`
    /// 5. any remaining seeking -> `Seeking`
    /// 6. any remaining ready-to-play -> `ReadyToPlay`
    /// 7. otherwise -> `Ended`
    #[must_use]
    pub fn derive<I>(states: I) -> Self
    where
        I: IntoIterator<Item = SessionState>,
    {
        let states: Vec<SessionState> = states.into_iter().collect();
        if states.is_empty() {
            return Self::Idle;
        }
        if states.iter().all(SessionState::is_failed) {
            return Self::Failure;
        }

        let live: Vec<&SessionState> =
            states.iter().filter(|s| !s.is_failed()).collect();

        if live.iter().all(|s| matches!(s, SessionState::Playing)) {
            Self::Playing
        } else if live
            .iter()
            .any(|s| matches!(s, SessionState::Starting | SessionState::Idle))
        {
            Self::Loading
        } else if live.iter().any(|s| matches!(s, SessionState::Seeking)) {
            Self::Seeking
        } else if live.iter().any(|s| matches!(s, SessionState::ReadyToPlay)) {
            Self::ReadyToPlay
        } else {
            Self::Ended
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_resolution() {
        let now = Utc::now();
        let absolute = AnchorPoint::Absolute(now);
        assert_eq!(absolute.resolve(Utc::now()), now);

        let relative = AnchorPoint::BeforeLive(Duration::from_secs(80));
        assert_eq!(relative.resolve(now), now - chrono::Duration::seconds(80));
    }

    #[test]
    fn test_play_guard_set() {
        assert!(SessionState::ReadyToPlay.allows_play());
        assert!(SessionState::Paused.allows_play());
        assert!(SessionState::Ended.allows_play());
        assert!(!SessionState::Starting.allows_play());
        assert!(!SessionState::Seeking.allows_play());
        assert!(!SessionState::Failed { forced: false }.allows_play());
    }

    #[test]
    fn test_aggregate_mixed_members() {
        // playing + failed + ready: failed is dropped, not all playing,
        // no loading or seeking, so ready wins over failure.
        let aggregate = AggregateState::derive([
            SessionState::Playing,
            SessionState::Failed { forced: false },
            SessionState::ReadyToPlay,
        ]);
        assert_eq!(aggregate, AggregateState::ReadyToPlay);
    }

    #[test]
    fn test_aggregate_all_failed() {
        let aggregate = AggregateState::derive([
            SessionState::Failed { forced: false },
            SessionState::Failed { forced: true },
        ]);
        assert_eq!(aggregate, AggregateState::Failure);
    }

    #[test]
    fn test_aggregate_all_playing() {
        let aggregate = AggregateState::derive([
            SessionState::Playing,
            SessionState::Playing,
        ]);
        assert_eq!(aggregate, AggregateState::Playing);
    }

    #[test]
    fn test_aggregate_loading_beats_seeking() {
        let aggregate = AggregateState::derive([
            SessionState::Seeking,
            SessionState::Starting,
        ]);
        assert_eq!(aggregate, AggregateState::Loading);
    }

    #[test]
    fn test_aggregate_empty() {
        let aggregate = AggregateState::derive(std::iter::empty());
        assert_eq!(aggregate, AggregateState::Idle);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&SessionState::Failed { forced: true })
            .expect("serializable");
        assert!(json.contains("failed"));
        assert!(json.contains("forced"));
    }
}
