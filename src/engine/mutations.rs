use std::collections::BTreeMap;

use chrono::NaiveDate;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admission::{parse_request_date, Admission};
use super::{Engine, EngineError, WalCommand};

pub const TOKEN_CANCEL_REASON: &str = "cancelled via link";
pub const RESCHEDULE_REASON: &str = "rescheduled";
pub const NO_SHOW_REASON: &str = "not marked visited";

impl Engine {
    /// Staff decision on a booking, following the status transition table.
    pub async fn decide(
        &self,
        booking_id: Ulid,
        decision: Decision,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        if let Some(r) = &reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let (slot_id, date) = self
            .store
            .locate(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;

        let mut txn = self.begin(&[slot_id]).await?;
        let mut booking = txn
            .booking(slot_id, date, booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        let next = booking
            .status
            .apply(decision)
            .ok_or(EngineError::InvalidTransition {
                from: booking.status,
                decision,
            })?;
        txn.stage(Event::BookingStatusChanged {
            id: booking_id,
            slot_id,
            date,
            status: next,
            reason: reason.clone(),
        });
        txn.commit().await?;

        info!(booking = %booking_id, from = %booking.status, to = %next, "booking decided");
        booking.status = next;
        booking.reason = reason;
        Ok(booking)
    }

    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.decide(booking_id, Decision::Cancel, None).await
    }

    /// Cancel through a reschedule link. Only counted bookings can be cancelled this way.
    pub async fn cancel_by_token(&self, token: &str) -> Result<Booking, EngineError> {
        let booking_id = self
            .store
            .booking_for_token(token)
            .ok_or_else(|| EngineError::not_found("reschedule token", "<redacted>"))?;
        let (slot_id, date) = self
            .store
            .locate(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;

        let mut txn = self.begin(&[slot_id]).await?;
        let mut booking = txn
            .booking(slot_id, date, booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        if !booking.status.is_counted() {
            return Err(EngineError::AlreadyResolved(booking_id));
        }
        txn.stage(Event::BookingStatusChanged {
            id: booking_id,
            slot_id,
            date,
            status: BookingStatus::Cancelled,
            reason: Some(TOKEN_CANCEL_REASON.into()),
        });
        txn.commit().await?;

        info!(booking = %booking_id, "booking cancelled via link");
        booking.status = BookingStatus::Cancelled;
        booking.reason = Some(TOKEN_CANCEL_REASON.into());
        Ok(booking)
    }

    /// Move the booking owning `token` to another slot/date for the same requester.
    pub async fn reschedule_by_token(
        &self,
        token: &str,
        new_id: Ulid,
        slot_id: Ulid,
        date: &str,
    ) -> Result<Booking, EngineError> {
        let date = parse_request_date(date)?;
        let old_id = self
            .store
            .booking_for_token(token)
            .ok_or_else(|| EngineError::not_found("reschedule token", "<redacted>"))?;
        let old = self
            .get_booking(old_id)
            .await
            .ok_or_else(|| EngineError::not_found("booking", old_id))?;
        if !old.status.is_counted() {
            return Err(EngineError::AlreadyResolved(old_id));
        }

        let admission = Admission {
            id: new_id,
            requester: old.requester,
            slot_id,
            date,
            note: old.note,
            origin: Origin::SelfService,
            recurring_id: None,
        };
        let booking = self.replace(old_id, admission, RESCHEDULE_REASON).await?;
        info!(from = %old_id, to = %booking.id, "booking rescheduled");
        Ok(booking)
    }

    /// Mark approved bookings dated before `cutoff` as no-shows. Returns how many changed.
    pub async fn mark_no_shows(&self, cutoff: NaiveDate) -> Result<usize, EngineError> {
        let mut marked = 0;
        for slot_id in self.store.slot_ids() {
            let stale: Vec<(Ulid, NaiveDate)> = {
                let Some(state) = self.store.get_slot(&slot_id) else {
                    continue;
                };
                let guard = state.read().await;
                guard
                    .bookings
                    .range(..cutoff)
                    .flat_map(|(date, rows)| {
                        rows.iter()
                            .filter(|b| b.status == BookingStatus::Approved)
                            .map(move |b| (b.id, *date))
                    })
                    .collect()
            };
            if stale.is_empty() {
                continue;
            }

            let mut txn = self.begin(&[slot_id]).await?;
            for (id, date) in stale {
                // Re-check under the write lock: staff may have decided it meanwhile.
                let still_approved = txn
                    .booking(slot_id, date, id)
                    .is_some_and(|b| b.status == BookingStatus::Approved);
                if still_approved {
                    txn.stage(Event::BookingStatusChanged {
                        id,
                        slot_id,
                        date,
                        status: BookingStatus::NoShow,
                        reason: Some(NO_SHOW_REASON.into()),
                    });
                    marked += 1;
                }
            }
            txn.commit().await?;
        }
        Ok(marked)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Holds the catalog lock and every slot's read lock until the new file is in
    /// place, so no commit can land in the old file after the snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _held = self.catalog_lock.lock().await;

        let mut events = Vec::new();
        for role in self.store.roles() {
            events.push(Event::RoleCreated { role });
        }
        for (volunteer_id, role_id) in self.store.trainings() {
            events.push(Event::TrainingGranted { volunteer_id, role_id });
        }
        for holiday in self.store.holidays() {
            events.push(Event::HolidayAdded { holiday });
        }
        for series in self.store.all_series() {
            events.push(Event::SeriesCreated { series });
        }

        let mut guards = BTreeMap::new();
        for slot_id in self.store.slot_ids() {
            if let Some(state) = self.store.get_slot(&slot_id) {
                guards.insert(slot_id, state.read_owned().await);
            }
        }
        for guard in guards.values() {
            events.push(Event::SlotCreated {
                slot: guard.slot.clone(),
            });
        }
        for guard in guards.values() {
            for booking in guard.bookings.values().flatten() {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
