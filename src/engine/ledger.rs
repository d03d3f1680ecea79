//! Capacity ledger: how many bookings hold a seat in a slot on a date.
//!
//! The counted set is `BookingStatus::is_counted` and nothing else. Admission,
//! availability listings and this read all go through [`count_counted`], so
//! they can never disagree about what "full" means.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::Booking;

use super::{Engine, EngineError, SlotState};

pub fn count_counted<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> u32 {
    bookings.into_iter().filter(|b| b.status.is_counted()).count() as u32
}

impl SlotState {
    pub fn counted(&self, date: NaiveDate) -> u32 {
        count_counted(self.bookings_on(date))
    }

    pub fn available(&self, date: NaiveDate) -> u32 {
        self.slot.max_capacity.saturating_sub(self.counted(date))
    }
}

impl Engine {
    /// Counted reservations for (slot, date), read fresh under the slot's lock.
    /// Inside a transaction use `Transaction::counted`, which sees staged writes.
    pub async fn counted_reservations(&self, slot_id: Ulid, date: NaiveDate) -> Result<u32, EngineError> {
        let state = self
            .store
            .get_slot(&slot_id)
            .ok_or_else(|| EngineError::not_found("slot", slot_id))?;
        let guard = state.read().await;
        Ok(guard.counted(date))
    }
}
