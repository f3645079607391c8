use ulid::Ulid;

use crate::model::{LifecycleEvent, ReservationState, Span};

#[derive(Debug)]
pub enum EngineError {
    /// Zero-length, inverted or out-of-range window.
    InvalidWindow(Span),
    /// Lost a race for the given computer.
    SlotConflict(Ulid),
    /// Could not take every allocation lock within the configured bound.
    LockTimeout,
    InvalidTransition {
        id: Ulid,
        from: ReservationState,
        event: LifecycleEvent,
    },
    InvalidState {
        id: Ulid,
        state: ReservationState,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    NotPermitted {
        user_id: u32,
        image_id: Ulid,
    },
    StalePrivileges,
    /// The reservation was cancelled while its allocation was in flight.
    Cancelled(Ulid),
    BlockSize {
        requested: usize,
        min: usize,
        max: usize,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Errors a client should retry right away against a fresh resolution.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::SlotConflict(_) | EngineError::LockTimeout)
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidWindow(_) => "invalid_window",
            EngineError::SlotConflict(_) => "slot_conflict",
            EngineError::LockTimeout => "lock_timeout",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::NotPermitted { .. } => "not_permitted",
            EngineError::StalePrivileges => "stale_privileges",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::BlockSize { .. } => "block_size",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow(span) => {
                write!(f, "invalid window [{}, {})", span.start, span.end)
            }
            EngineError::SlotConflict(id) => write!(f, "slot conflict on computer: {id}"),
            EngineError::LockTimeout => write!(f, "timed out waiting for allocation locks"),
            EngineError::InvalidTransition { id, from, event } => write!(
                f,
                "reservation {id}: transition '{}' not allowed from '{}'",
                event.as_str(),
                from.as_str()
            ),
            EngineError::InvalidState { id, state } => {
                write!(f, "reservation {id} is {}", state.as_str())
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NotPermitted { user_id, image_id } => {
                write!(f, "user {user_id} may not reserve image {image_id}")
            }
            EngineError::StalePrivileges => write!(f, "privilege snapshot expired"),
            EngineError::Cancelled(id) => write!(f, "reservation {id} cancelled during allocation"),
            EngineError::BlockSize { requested, min, max } => {
                write!(f, "block of {requested} computers outside [{min}, {max}]")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
