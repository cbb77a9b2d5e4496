use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::Span;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Wrong actor for the current stage, or an action the lifecycle does not allow.
    InvalidTransition {
        status: &'static str,
        detail: String,
    },
    MissingRemarks,
    /// Authoritative conflict at final approval. Status is left unchanged.
    SlotNoLongerAvailable {
        lab_id: Ulid,
        date: NaiveDate,
        requested: Span,
        conflicting: Vec<Span>,
        blocked_by: Option<Ulid>,
    },
    InsufficientInventory {
        component_id: Ulid,
        requested: u32,
        available: u32,
    },
    AlreadyTerminal(Ulid),
    InvalidSpan(Span),
    CapacityExceeded {
        lab_id: Ulid,
        capacity: u32,
    },
    NotRequester(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code, used on the wire and as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::MissingRemarks => "missing_remarks",
            EngineError::SlotNoLongerAvailable { .. } => "slot_no_longer_available",
            EngineError::InsufficientInventory { .. } => "insufficient_inventory",
            EngineError::AlreadyTerminal(_) => "already_terminal",
            EngineError::InvalidSpan(_) => "invalid_span",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::NotRequester(_) => "not_requester",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition { status, detail } => {
                write!(f, "invalid transition from {status}: {detail}")
            }
            EngineError::MissingRemarks => write!(f, "a rejection must carry remarks"),
            EngineError::SlotNoLongerAvailable {
                lab_id,
                date,
                requested,
                conflicting,
                ..
            } => {
                let taken: Vec<String> = conflicting.iter().map(|s| s.to_string()).collect();
                write!(
                    f,
                    "slot {requested} on {date} is no longer available in lab {lab_id}; taken: [{}]",
                    taken.join(", ")
                )
            }
            EngineError::InsufficientInventory {
                component_id,
                requested,
                available,
            } => write!(
                f,
                "insufficient inventory for component {component_id}: requested {requested}, available {available}"
            ),
            EngineError::AlreadyTerminal(id) => write!(f, "request {id} is already closed"),
            EngineError::InvalidSpan(span) => write!(
                f,
                "invalid interval [{}, {}): start must precede end within one day",
                span.start, span.end
            ),
            EngineError::CapacityExceeded { lab_id, capacity } => {
                write!(f, "lab {lab_id} holds at most {capacity} participants")
            }
            EngineError::NotRequester(id) => {
                write!(f, "only the original requester may do this to {id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
