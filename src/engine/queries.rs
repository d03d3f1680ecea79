use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::outbox::{Notice, NoticeKind};

use super::{Engine, EngineError};

impl Engine {
    /// Describe a booking (or an attempted one, with no id) for conflict reports and notices.
    pub fn summarize(&self, booking_id: Option<Ulid>, slot: &Slot, date: NaiveDate) -> BookingSummary {
        BookingSummary {
            booking_id,
            slot_id: slot.id,
            role_name: self.store.role_name(&slot.role_id),
            date,
            start_time: slot.window.start,
            end_time: slot.window.end,
        }
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let (slot_id, date) = self.store.locate(&id)?;
        let state = self.store.get_slot(&slot_id)?;
        let guard = state.read().await;
        guard.booking(date, id).cloned()
    }

    /// Bookings held by a client or volunteer id, ordered by date then start time.
    pub async fn bookings_for_requester(&self, requester_id: Ulid) -> Vec<Booking> {
        let mut rows = Vec::new();
        for requester in [Requester::client(requester_id), Requester::volunteer(requester_id)] {
            for id in self.store.bookings_of(&requester) {
                let Some((slot_id, date)) = self.store.locate(&id) else {
                    continue;
                };
                let Some(state) = self.store.get_slot(&slot_id) else {
                    continue;
                };
                let guard = state.read().await;
                if let Some(b) = guard.booking(date, id) {
                    rows.push((b.clone(), guard.slot.window.start));
                }
            }
        }
        rows.sort_by(|(a, a_start), (b, b_start)| (a.date, a_start, a.id).cmp(&(b.date, b_start, b.id)));
        rows.into_iter().map(|(b, _)| b).collect()
    }

    pub async fn bookings_for_slot(&self, slot_id: Ulid, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let state = self
            .store
            .get_slot(&slot_id)
            .ok_or_else(|| EngineError::not_found("slot", slot_id))?;
        let guard = state.read().await;
        Ok(guard.bookings_on(date).to_vec())
    }

    /// Active slots on `date`, optionally for one role, with their remaining capacity.
    pub async fn slot_availability(&self, date: NaiveDate, role_id: Option<Ulid>) -> Vec<SlotAvailability> {
        let mut rows = Vec::new();
        for slot_id in self.store.slot_ids() {
            let Some(state) = self.store.get_slot(&slot_id) else {
                continue;
            };
            let guard = state.read().await;
            let slot = &guard.slot;
            if !slot.is_active || role_id.is_some_and(|r| r != slot.role_id) {
                continue;
            }
            let Some(role) = self.store.role(&slot.role_id) else {
                continue;
            };
            let closed = self.check_closure(slot, &role, date).is_err();
            rows.push(SlotAvailability {
                slot: slot.clone(),
                role_name: role.name,
                counted: guard.counted(date),
                available: guard.available(date),
                closed,
            });
        }
        rows.sort_by(|a, b| {
            (a.slot.window.start, &a.role_name, a.slot.id).cmp(&(b.slot.window.start, &b.role_name, b.slot.id))
        });
        rows
    }

    pub fn list_roles(&self) -> Vec<Role> {
        self.store.roles()
    }

    pub async fn list_slots(&self) -> Vec<Slot> {
        let mut slots = Vec::new();
        for slot_id in self.store.slot_ids() {
            if let Some(state) = self.store.get_slot(&slot_id) {
                slots.push(state.read().await.slot.clone());
            }
        }
        slots.sort_by(|a, b| (a.role_id, a.window.start, a.id).cmp(&(b.role_id, b.window.start, b.id)));
        slots
    }

    pub fn list_holidays(&self) -> Vec<Holiday> {
        self.store.holidays()
    }

    pub fn get_series(&self, id: Ulid) -> Option<RecurringSeries> {
        self.store.series(&id)
    }

    /// Every occurrence booked for a series, ordered by date.
    pub async fn series_bookings(&self, id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if self.store.series(&id).is_none() {
            return Err(EngineError::not_found("recurring series", id));
        }
        let mut rows = Vec::new();
        for booking_id in self.store.series_bookings(&id) {
            if let Some(b) = self.get_booking(booking_id).await {
                rows.push(b);
            }
        }
        rows.sort_by_key(|b| (b.date, b.id));
        Ok(rows)
    }

    /// Reminder notices for every approved booking on `date`.
    pub async fn due_reminders(&self, date: NaiveDate) -> Vec<Notice> {
        let mut notices = Vec::new();
        for slot_id in self.store.slot_ids() {
            let Some(state) = self.store.get_slot(&slot_id) else {
                continue;
            };
            let guard = state.read().await;
            for booking in guard.bookings_on(date) {
                if booking.status != BookingStatus::Approved {
                    continue;
                }
                notices.push(Notice {
                    kind: NoticeKind::Reminder,
                    requester: booking.requester,
                    booking: self.summarize(Some(booking.id), &guard.slot, date),
                    reschedule_token: booking.reschedule_token.clone(),
                    reason: None,
                });
            }
        }
        notices
    }
}
