use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::TimeOfDay;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    CapacityViolation,
    Busy,
    Storage,
}

#[derive(Debug)]
pub enum EngineError {
    /// Unknown resource, template or slot, or a slot that belongs to another resource.
    NotFound(Ulid),
    AlreadyExists(Ulid),
    TemplateExists {
        resource_id: Ulid,
        day_of_week: u8,
    },
    InvalidHours {
        open: TimeOfDay,
        close: TimeOfDay,
    },
    InvertedRange {
        from: NaiveDate,
        to: NaiveDate,
    },
    DateMismatch {
        slot_id: Ulid,
        expected: NaiveDate,
        actual: NaiveDate,
    },
    IdentityChange(Ulid),
    ResourceInUse(Ulid),
    Validation(String),
    CapacityViolation {
        slot_id: Ulid,
        booked: u32,
        delta: i32,
        max_capacity: u32,
    },
    /// Slot lock not acquired within the retry budget.
    Busy(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::TemplateExists { .. }
            | EngineError::InvalidHours { .. }
            | EngineError::InvertedRange { .. }
            | EngineError::DateMismatch { .. }
            | EngineError::IdentityChange(_)
            | EngineError::ResourceInUse(_) => ErrorKind::Conflict,
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::CapacityViolation { .. } => ErrorKind::CapacityViolation,
            EngineError::Busy(_) => ErrorKind::Busy,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::TemplateExists {
                resource_id,
                day_of_week,
            } => write!(
                f,
                "resource {resource_id} already has a template for day {day_of_week}"
            ),
            EngineError::InvalidHours { open, close } => {
                write!(f, "open time {open} must be earlier than close time {close}")
            }
            EngineError::InvertedRange { from, to } => {
                write!(f, "date range start {from} is after end {to}")
            }
            EngineError::DateMismatch {
                slot_id,
                expected,
                actual,
            } => write!(
                f,
                "slot {slot_id} is on {actual}, not the requested date {expected}"
            ),
            EngineError::IdentityChange(id) => write!(
                f,
                "template {id}: resource_id and day_of_week cannot be changed"
            ),
            EngineError::ResourceInUse(id) => {
                write!(f, "cannot delete resource {id}: templates or slots still reference it")
            }
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::CapacityViolation {
                slot_id,
                booked,
                delta,
                max_capacity,
            } => write!(
                f,
                "capacity violation on slot {slot_id}: booked {booked} {delta:+} outside [0, {max_capacity}]"
            ),
            EngineError::Busy(id) => write!(f, "slot {id} is busy, retry later"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
