//! Forward lifecycle states and the event stream delivered to the presentation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{ErrorKind, TunnelError};

/// Lifecycle state of a single forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardState {
    Idle,
    Connecting,
    Active,
    Stopped,
    Error,
}

impl ForwardState {
    /// Whether a forward in this state holds a session reference
    pub fn holds_session(&self) -> bool {
        matches!(self, ForwardState::Connecting | ForwardState::Active)
    }

    /// Transitions allowed within and between run cycles
    pub fn can_transition_to(&self, next: ForwardState) -> bool {
        use ForwardState::*;
        matches!(
            (self, next),
            (Idle | Stopped | Error, Connecting)
                | (Connecting, Active | Error | Stopped)
                | (Active, Stopped | Error)
        )
    }
}

/// Aggregate state of a tunnel group, derived from its members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    /// Every forward is active
    Running,
    /// Some forwards active, some stopped or failed
    Degraded,
    /// At least one forward is still connecting
    Starting,
    /// Nothing active and at least one forward failed
    Failed,
    /// Every forward is stopped or was never started
    Stopped,
}

impl GroupState {
    pub fn derive<I>(states: I) -> GroupState
    where
        I: IntoIterator<Item = ForwardState>,
    {
        let (mut active, mut connecting, mut error, mut total) = (0usize, 0usize, 0usize, 0usize);
        for state in states {
            total += 1;
            match state {
                ForwardState::Active => active += 1,
                ForwardState::Connecting => connecting += 1,
                ForwardState::Error => error += 1,
                ForwardState::Idle | ForwardState::Stopped => {}
            }
        }

        if connecting > 0 {
            GroupState::Starting
        } else if total > 0 && active == total {
            GroupState::Running
        } else if active > 0 {
            GroupState::Degraded
        } else if error > 0 {
            GroupState::Failed
        } else {
            GroupState::Stopped
        }
    }
}

/// Error attached to a state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TunnelError> for ErrorDetail {
    fn from(err: &TunnelError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message(),
        }
    }
}

impl From<&ErrorDetail> for TunnelError {
    fn from(detail: &ErrorDetail) -> Self {
        TunnelError::with_kind(detail.kind, detail.message.clone())
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A single state-change record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelEvent {
    pub timestamp: DateTime<Utc>,
    pub group: String,
    pub forward: String,
    pub old_state: ForwardState,
    pub new_state: ForwardState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Fan-out of events to any number of subscribers.
///
/// Publishing never blocks; slow subscribers observe `Lagged` instead of
/// stalling forwards.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TunnelEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
