use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Failure to parse one of the closed string enums below.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct UnknownValue {
    pub what: &'static str,
    pub value: String,
}

impl UnknownValue {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

// ── Requesters ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequesterKind {
    Client,
    Volunteer,
}

impl RequesterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequesterKind::Client => "client",
            RequesterKind::Volunteer => "volunteer",
        }
    }
}

impl FromStr for RequesterKind {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(RequesterKind::Client),
            "volunteer" => Ok(RequesterKind::Volunteer),
            _ => Err(UnknownValue::new("requester kind", s)),
        }
    }
}

/// The party a booking is held for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requester {
    pub kind: RequesterKind,
    pub id: Ulid,
}

impl Requester {
    pub fn client(id: Ulid) -> Self {
        Self {
            kind: RequesterKind::Client,
            id,
        }
    }

    pub fn volunteer(id: Ulid) -> Self {
        Self {
            kind: RequesterKind::Volunteer,
            id,
        }
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.id)
    }
}

// ── Catalog ──────────────────────────────────────────────────────

/// Half-open wall-clock window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Ulid,
    pub name: String,
    /// Which kind of requester may book this role.
    pub audience: RequesterKind,
    /// Bookable on Saturdays and Sundays.
    pub weekends: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub role_id: Ulid,
    pub window: TimeWindow,
    pub max_capacity: u32,
    pub is_active: bool,
    /// Only bookable on this weekday (e.g. Wednesday-only evening slots).
    pub weekday: Option<Weekday>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holiday {
    pub date: NaiveDate,
    pub reason: Option<String>,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Approved,
    Completed,
    NoShow,
    Cancelled,
    Rejected,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Rejected => "rejected",
        }
    }

    /// Statuses that hold a seat in the slot.
    pub fn is_counted(&self) -> bool {
        match self {
            BookingStatus::Pending | BookingStatus::Approved => true,
            BookingStatus::Completed
            | BookingStatus::NoShow
            | BookingStatus::Cancelled
            | BookingStatus::Rejected => false,
        }
    }

    /// Status reached by applying `decision`, or `None` if the transition is not allowed.
    pub fn apply(&self, decision: Decision) -> Option<BookingStatus> {
        use BookingStatus::*;
        match (self, decision) {
            (Pending, Decision::Approve) => Some(Approved),
            (Pending | Approved, Decision::Reject) => Some(Rejected),
            (Pending | Approved, Decision::Cancel) => Some(Cancelled),
            (Approved, Decision::Complete) => Some(Completed),
            (Approved, Decision::NoShow) => Some(NoShow),
            (Pending, Decision::Complete | Decision::NoShow)
            | (Approved, Decision::Approve)
            | (Completed | NoShow | Cancelled | Rejected, _) => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Staff decision on an existing booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
    Cancel,
    Complete,
    NoShow,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::Cancel => "cancel",
            Decision::Complete => "complete",
            Decision::NoShow => "no_show",
        }
    }
}

impl FromStr for Decision {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Decision::Approve),
            "reject" | "rejected" => Ok(Decision::Reject),
            "cancel" | "cancelled" => Ok(Decision::Cancel),
            "complete" | "completed" | "visited" => Ok(Decision::Complete),
            "no_show" => Ok(Decision::NoShow),
            _ => Err(UnknownValue::new("decision", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub requester: Requester,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub status: BookingStatus,
    pub note: Option<String>,
    pub recurring_id: Option<Ulid>,
    /// Lets an unauthenticated holder of the link cancel or reschedule.
    pub reschedule_token: String,
    /// Why the booking was cancelled or rejected.
    pub reason: Option<String>,
    pub created_on: NaiveDate,
}

/// How a booking request entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    SelfService,
    Staff { force: bool, allow_past: bool },
}

impl Origin {
    pub fn force(&self) -> bool {
        matches!(self, Origin::Staff { force: true, .. })
    }

    pub fn allows_past(&self) -> bool {
        matches!(self, Origin::Staff { allow_past: true, .. })
    }

    /// Status a freshly admitted booking starts in.
    pub fn initial_status(&self, kind: RequesterKind) -> BookingStatus {
        match (self, kind) {
            (Origin::Staff { .. }, _) => BookingStatus::Approved,
            (Origin::SelfService, RequesterKind::Volunteer) => BookingStatus::Approved,
            (Origin::SelfService, RequesterKind::Client) => BookingStatus::Pending,
        }
    }
}

/// Human-readable description of a booking, used in conflict reports and notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSummary {
    pub booking_id: Option<Ulid>,
    pub slot_id: Ulid,
    pub role_name: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetail {
    pub attempted: BookingSummary,
    pub existing: BookingSummary,
}

/// Which side of a conflict the caller keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    New,
    Existing,
}

impl Keep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Keep::New => "new",
            Keep::Existing => "existing",
        }
    }
}

impl FromStr for Keep {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(Keep::New),
            "existing" => Ok(Keep::Existing),
            _ => Err(UnknownValue::new("keep directive", s)),
        }
    }
}

// ── Recurring series ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    Daily,
    Weekly { days: Vec<Weekday> },
}

impl Pattern {
    pub fn includes(&self, date: NaiveDate) -> bool {
        match self {
            Pattern::Daily => true,
            Pattern::Weekly { days } => days.contains(&date.weekday()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSeries {
    pub id: Ulid,
    pub requester: Requester,
    pub slot_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub pattern: Pattern,
    pub created_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDate {
    pub date: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesOutcome {
    pub recurring_id: Ulid,
    pub successes: Vec<NaiveDate>,
    pub skipped: Vec<SkippedDate>,
}

// ── WAL record ───────────────────────────────────────────────────

/// The event types. One committed transaction is a `Vec<Event>` in the WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoleCreated {
        role: Role,
    },
    SlotCreated {
        slot: Slot,
    },
    SlotUpdated {
        slot: Slot,
    },
    SlotCapacityGrown {
        slot_id: Ulid,
        max_capacity: u32,
    },
    TrainingGranted {
        volunteer_id: Ulid,
        role_id: Ulid,
    },
    TrainingRevoked {
        volunteer_id: Ulid,
        role_id: Ulid,
    },
    HolidayAdded {
        holiday: Holiday,
    },
    HolidayRemoved {
        date: NaiveDate,
    },
    SeriesCreated {
        series: RecurringSeries,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
        status: BookingStatus,
        reason: Option<String>,
    },
}

impl Event {
    /// Slot whose state this event mutates, if any.
    pub fn slot_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotCreated { slot } | Event::SlotUpdated { slot } => Some(slot.id),
            Event::SlotCapacityGrown { slot_id, .. }
            | Event::BookingStatusChanged { slot_id, .. } => Some(*slot_id),
            Event::BookingCreated { booking } => Some(booking.slot_id),
            Event::RoleCreated { .. }
            | Event::TrainingGranted { .. }
            | Event::TrainingRevoked { .. }
            | Event::HolidayAdded { .. }
            | Event::HolidayRemoved { .. }
            | Event::SeriesCreated { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAvailability {
    pub slot: Slot,
    pub role_name: String,
    pub counted: u32,
    pub available: u32,
    /// Holiday, weekend or weekday restriction closes the slot on this date.
    pub closed: bool,
}
