// Hard limits that keep a single request from growing state without bound.

pub const MAX_ROLES: usize = 1_000;
pub const MAX_SLOTS: usize = 10_000;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_NOTE_LEN: usize = 500;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_BOOKINGS_PER_SLOT_DATE: usize = 10_000;
pub const MAX_SLOT_CAPACITY: u32 = 10_000;
/// Longest recurring series, in days from start to end inclusive.
pub const MAX_SERIES_DAYS: i64 = 366;
pub const RESCHEDULE_TOKEN_LEN: usize = 32;
