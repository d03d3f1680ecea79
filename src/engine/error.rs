use chrono::{NaiveDate, Weekday};
use thiserror::Error;
use ulid::Ulid;

use crate::calendar::weekday_name;
use crate::model::{BookingStatus, ConflictDetail, Decision, Requester};

/// Machine-checkable error kind, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidDate,
    PastDate,
    NotTrained,
    ClosedDay,
    Duplicate,
    Conflict,
    Full,
    NotFound,
    AlreadyResolved,
    InvalidTransition,
    InvalidInput,
    AlreadyExists,
    LimitExceeded,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidDate => "INVALID_DATE",
            ErrorKind::PastDate => "PAST_DATE",
            ErrorKind::NotTrained => "NOT_TRAINED",
            ErrorKind::ClosedDay => "CLOSED_DAY",
            ErrorKind::Duplicate => "DUPLICATE",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Full => "FULL",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyResolved => "ALREADY_RESOLVED",
            ErrorKind::InvalidTransition => "INVALID_TRANSITION",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::LimitExceeded => "LIMIT_EXCEEDED",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// SQLSTATE reported on the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ErrorKind::InvalidDate => "22007",
            ErrorKind::PastDate => "22008",
            ErrorKind::NotTrained => "42501",
            ErrorKind::ClosedDay => "55000",
            ErrorKind::Duplicate => "23505",
            ErrorKind::Conflict => "23P01",
            ErrorKind::Full => "53000",
            ErrorKind::NotFound => "42704",
            ErrorKind::AlreadyResolved => "40001",
            ErrorKind::InvalidTransition | ErrorKind::InvalidInput => "22023",
            ErrorKind::AlreadyExists => "42710",
            ErrorKind::LimitExceeded => "54000",
            ErrorKind::Internal => "58030",
        }
    }
}

/// Why a date is closed for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    HolidayOrWeekend,
    WrongWeekday(Weekday),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error("date {0} is in the past")]
    PastDate(NaiveDate),
    #[error("{requester} is not eligible for role {role}")]
    NotTrained { requester: Requester, role: String },
    #[error("{}", closure_message(.0))]
    ClosedDay(Closure),
    #[error("already booked for this slot and date (booking {0})")]
    Duplicate(Ulid),
    #[error("{}", conflict_message(.0))]
    Conflict(Box<ConflictDetail>),
    #[error("slot is full (capacity {capacity})")]
    Full { slot_id: Ulid, capacity: u32 },
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
    #[error("slot {0} is inactive")]
    SlotInactive(Ulid),
    #[error("booking {0} was already resolved")]
    AlreadyResolved(Ulid),
    #[error("cannot {} a {from} booking", .decision.as_str())]
    InvalidTransition {
        from: BookingStatus,
        decision: Decision,
    },
    #[error("{0}")]
    InvalidInput(String),
    #[error("window overlaps active slot {0} of the same role")]
    SlotOverlap(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

fn closure_message(closure: &Closure) -> String {
    match closure {
        Closure::HolidayOrWeekend => "Role not bookable on holidays or weekends".to_string(),
        Closure::WrongWeekday(day) => format!("Slot only bookable on {}", weekday_name(*day)),
    }
}

fn conflict_message(detail: &ConflictDetail) -> String {
    let existing = &detail.existing;
    format!(
        "overlaps existing booking: {} {}-{} on {}",
        existing.role_name,
        existing.start_time.format("%H:%M"),
        existing.end_time.format("%H:%M"),
        existing.date
    )
}

impl EngineError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidDate(_) => ErrorKind::InvalidDate,
            EngineError::PastDate(_) => ErrorKind::PastDate,
            EngineError::NotTrained { .. } => ErrorKind::NotTrained,
            EngineError::ClosedDay(_) => ErrorKind::ClosedDay,
            EngineError::Duplicate(_) => ErrorKind::Duplicate,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Full { .. } => ErrorKind::Full,
            EngineError::NotFound { .. } | EngineError::SlotInactive(_) => ErrorKind::NotFound,
            EngineError::AlreadyResolved(_) => ErrorKind::AlreadyResolved,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::InvalidInput(_) | EngineError::SlotOverlap(_) => ErrorKind::InvalidInput,
            EngineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// Per-date failures a recurring series records as skipped instead of aborting.
    pub fn is_skippable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Internal)
    }
}
