use ulid::Ulid;

use crate::model::{JobState, Qty, ReservationState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Double-booking attempt; carries the first busy resource.
    Conflict(Ulid),
    InsufficientStock {
        part_id: Ulid,
        requested: Qty,
        available: Qty,
    },
    WouldUnderflow {
        part_id: Ulid,
        on_hand: Qty,
        reserved: Qty,
        delta: i64,
    },
    IllegalTransition {
        from: JobState,
        to: JobState,
    },
    ReservationsIncomplete(Ulid),
    InvalidState {
        reservation_id: Ulid,
        state: ReservationState,
    },
    MissingCapability(String),
    InvalidRequest(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Lost races on time or stock; the caller may retry with the same or
    /// different inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict(_) | EngineError::InsufficientStock { .. }
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "resource {id} is already booked in that interval"),
            EngineError::InsufficientStock {
                part_id,
                requested,
                available,
            } => write!(
                f,
                "insufficient stock for part {part_id}: requested {requested}, available {available}"
            ),
            EngineError::WouldUnderflow {
                part_id,
                on_hand,
                reserved,
                delta,
            } => write!(
                f,
                "adjusting part {part_id} by {delta} would leave on-hand {on_hand} below reserved {reserved}"
            ),
            EngineError::IllegalTransition { from, to } => {
                write!(f, "illegal job transition: {from} -> {to}")
            }
            EngineError::ReservationsIncomplete(id) => {
                write!(f, "job {id} has reservations that are not committed")
            }
            EngineError::InvalidState {
                reservation_id,
                state,
            } => write!(f, "reservation {reservation_id} is {state}"),
            EngineError::MissingCapability(tag) => {
                write!(f, "no assigned resource provides capability: {tag}")
            }
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
