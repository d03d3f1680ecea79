use chrono::NaiveDate;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::outbox::{Notice, NoticeKind};

use super::ledger::count_counted;
use super::{Engine, EngineError, SlotState};

/// Write transaction over one or more slots.
///
/// Holds each slot's write lock from `Engine::begin` until the transaction is
/// dropped. Writes are staged as events; reads through the transaction see
/// committed state plus everything staged so far. `commit` writes all staged
/// events as a single WAL record and only then applies them. Dropping without
/// committing discards the staged events and leaves state untouched.
pub struct Transaction<'a> {
    pub(super) engine: &'a Engine,
    guards: Vec<(Ulid, OwnedRwLockWriteGuard<SlotState>)>,
    staged: Vec<Event>,
}

impl Engine {
    /// Lock `slot_ids` for writing, in ascending id order so that two
    /// transactions over overlapping slot sets never deadlock.
    pub async fn begin(&self, slot_ids: &[Ulid]) -> Result<Transaction<'_>, EngineError> {
        let mut ids = slot_ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let state = self
                .store
                .get_slot(&id)
                .ok_or_else(|| EngineError::not_found("slot", id))?;
            guards.push((id, state.write_owned().await));
        }
        Ok(Transaction {
            engine: self,
            guards,
            staged: Vec::new(),
        })
    }
}

impl Transaction<'_> {
    fn state(&self, slot_id: Ulid) -> Option<&SlotState> {
        self.guards
            .iter()
            .find(|(id, _)| *id == slot_id)
            .map(|(_, guard)| &**guard)
    }

    pub fn holds_lock(&self, slot_id: Ulid) -> bool {
        self.state(slot_id).is_some()
    }

    /// The slot as it will look after commit.
    pub fn slot(&self, slot_id: Ulid) -> Option<Slot> {
        let mut slot = self.state(slot_id)?.slot.clone();
        for event in &self.staged {
            match event {
                Event::SlotUpdated { slot: updated } if updated.id == slot_id => slot = updated.clone(),
                Event::SlotCapacityGrown {
                    slot_id: id,
                    max_capacity,
                } if *id == slot_id => slot.max_capacity = slot.max_capacity.max(*max_capacity),
                _ => {}
            }
        }
        Some(slot)
    }

    /// Bookings for (slot, date) as they will look after commit.
    pub fn bookings(&self, slot_id: Ulid, date: NaiveDate) -> Vec<Booking> {
        let mut rows = self
            .state(slot_id)
            .map(|s| s.bookings_on(date).to_vec())
            .unwrap_or_default();
        for event in &self.staged {
            match event {
                Event::BookingCreated { booking } if booking.slot_id == slot_id && booking.date == date => {
                    rows.push(booking.clone());
                }
                Event::BookingStatusChanged {
                    id,
                    slot_id: sid,
                    date: d,
                    status,
                    reason,
                } if *sid == slot_id && *d == date => {
                    if let Some(row) = rows.iter_mut().find(|b| b.id == *id) {
                        row.status = *status;
                        row.reason = reason.clone();
                    }
                }
                _ => {}
            }
        }
        rows
    }

    pub fn booking(&self, slot_id: Ulid, date: NaiveDate, id: Ulid) -> Option<Booking> {
        self.bookings(slot_id, date).into_iter().find(|b| b.id == id)
    }

    /// Counted reservations, staged creates and cancellations included.
    pub fn counted(&self, slot_id: Ulid, date: NaiveDate) -> u32 {
        count_counted(&self.bookings(slot_id, date))
    }

    /// The requester's counted booking for (slot, date), if any.
    pub fn holding(&self, slot_id: Ulid, date: NaiveDate, requester: Requester) -> Option<Booking> {
        self.bookings(slot_id, date)
            .into_iter()
            .find(|b| b.requester == requester && b.status.is_counted())
    }

    pub fn stage(&mut self, event: Event) {
        debug_assert!(
            event.slot_id().is_none_or(|id| self.holds_lock(id)),
            "staged event for a slot this transaction does not lock"
        );
        self.staged.push(event);
    }

    pub fn staged(&self) -> &[Event] {
        &self.staged
    }

    /// Persist the staged events as one WAL record, apply them, then fan out
    /// LISTEN notifications and outbox notices. A WAL failure leaves memory untouched.
    pub async fn commit(mut self) -> Result<(), EngineError> {
        let events = std::mem::take(&mut self.staged);
        if events.is_empty() {
            return Ok(());
        }
        let engine = self.engine;
        engine.wal_append(&events).await?;

        for event in &events {
            match event.slot_id() {
                Some(slot_id) => {
                    if let Some((_, guard)) = self.guards.iter_mut().find(|(id, _)| *id == slot_id) {
                        engine.store.apply_event(guard, event);
                    }
                }
                None => engine.store.apply_catalog(event),
            }
        }

        for event in &events {
            if let Some(slot_id) = event.slot_id() {
                engine.notify.send(slot_id, event);
            }
            if let Some(notice) = self.notice_for(event) {
                engine.outbox.enqueue(notice);
            }
        }
        Ok(())
    }

    /// Notice owed to the requester for a committed event.
    fn notice_for(&self, event: &Event) -> Option<Notice> {
        let (booking, kind) = match event {
            Event::BookingCreated { booking } => {
                let kind = match booking.status {
                    BookingStatus::Pending => NoticeKind::Requested,
                    BookingStatus::Approved => NoticeKind::Confirmed,
                    BookingStatus::Completed
                    | BookingStatus::NoShow
                    | BookingStatus::Cancelled
                    | BookingStatus::Rejected => return None,
                };
                (booking.clone(), kind)
            }
            Event::BookingStatusChanged {
                id,
                slot_id,
                date,
                status,
                ..
            } => {
                let kind = match status {
                    BookingStatus::Approved => NoticeKind::Approved,
                    BookingStatus::Rejected => NoticeKind::Rejected,
                    BookingStatus::Cancelled => NoticeKind::Cancelled,
                    BookingStatus::Pending | BookingStatus::Completed | BookingStatus::NoShow => return None,
                };
                (self.state(*slot_id)?.booking(*date, *id)?.clone(), kind)
            }
            _ => return None,
        };
        let slot = &self.state(booking.slot_id)?.slot;
        Some(Notice {
            kind,
            requester: booking.requester,
            booking: self.engine.summarize(Some(booking.id), slot, booking.date),
            reschedule_token: booking.reschedule_token,
            reason: booking.reason,
        })
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            debug!(discarded = self.staged.len(), "transaction rolled back");
        }
    }
}
