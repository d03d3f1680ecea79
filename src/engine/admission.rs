use chrono::{Datelike, NaiveDate};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::{is_weekend, parse_date};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::error::Closure;
use super::{Engine, EngineError, Transaction};

/// A single booking request as it arrives from a caller.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub requester: Requester,
    pub slot_id: Ulid,
    /// Raw `YYYY-MM-DD`; validated as the first admission step.
    pub date: String,
    pub note: Option<String>,
    pub origin: Origin,
}

/// A request whose date has parsed.
#[derive(Debug, Clone)]
pub(super) struct Admission {
    pub id: Ulid,
    pub requester: Requester,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub note: Option<String>,
    pub origin: Origin,
    pub recurring_id: Option<Ulid>,
}

pub(super) fn new_reschedule_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RESCHEDULE_TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub(super) fn parse_request_date(raw: &str) -> Result<NaiveDate, EngineError> {
    parse_date(raw).ok_or_else(|| EngineError::InvalidDate(raw.to_string()))
}

impl Engine {
    /// Admit a single booking request.
    pub async fn book(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let date = parse_request_date(&request.date)?;
        self.admit(Admission {
            id: request.id,
            requester: request.requester,
            slot_id: request.slot_id,
            date,
            note: request.note,
            origin: request.origin,
            recurring_id: None,
        })
        .await
    }

    pub(super) async fn admit(&self, admission: Admission) -> Result<Booking, EngineError> {
        let result = self.try_admit(&admission).await;
        let outcome = match &result {
            Ok(_) => "admitted",
            Err(e) => e.kind().as_str(),
        };
        metrics::counter!(observability::ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Ok(booking) => info!(
                booking = %booking.id,
                requester = %booking.requester,
                slot = %booking.slot_id,
                date = %booking.date,
                status = %booking.status,
                "booking admitted"
            ),
            Err(e) => debug!(requester = %admission.requester, date = %admission.date, "admission rejected: {e}"),
        }
        result
    }

    async fn try_admit(&self, admission: &Admission) -> Result<Booking, EngineError> {
        self.precheck(admission, None).await?;
        let mut txn = self.begin(&[admission.slot_id]).await?;
        let booking = txn.stage_booking(admission)?;
        txn.commit().await?;
        Ok(booking)
    }

    /// Admission steps 2 to 7, each under at most one read lock.
    /// `ignoring` is a booking about to be cancelled in the same transaction.
    pub(super) async fn precheck(
        &self,
        admission: &Admission,
        ignoring: Option<Ulid>,
    ) -> Result<Slot, EngineError> {
        if self.store.locate(&admission.id).is_some() {
            return Err(EngineError::AlreadyExists(format!("booking {}", admission.id)));
        }
        if let Some(note) = &admission.note
            && note.len() > MAX_NOTE_LEN
        {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        self.check_temporal(admission.date, admission.origin)?;

        let date = admission.date;
        let state = self
            .store
            .get_slot(&admission.slot_id)
            .ok_or_else(|| EngineError::not_found("slot", admission.slot_id))?;
        let (slot, duplicate, counted) = {
            let guard = state.read().await;
            let live = guard
                .bookings_on(date)
                .iter()
                .filter(|b| b.status.is_counted() && Some(b.id) != ignoring);
            let mut duplicate = None;
            let mut counted = 0u32;
            for b in live {
                counted += 1;
                if b.requester == admission.requester {
                    duplicate = Some(b.id);
                }
            }
            (guard.slot.clone(), duplicate, counted)
        };

        // 3. eligibility
        let role = self.check_eligibility(&slot, admission.requester)?;
        // 4. closure
        self.check_closure(&slot, &role, date)?;
        // 5. duplicate
        if let Some(existing) = duplicate {
            return Err(EngineError::Duplicate(existing));
        }
        // 6. overlap
        if let Some((existing, existing_slot)) = self.find_overlap(admission.requester, date, &slot, ignoring).await {
            return Err(EngineError::Conflict(Box::new(ConflictDetail {
                attempted: self.summarize(None, &slot, date),
                existing: self.summarize(Some(existing.id), &existing_slot, date),
            })));
        }
        // 7. capacity
        if counted >= slot.max_capacity && !admission.origin.force() {
            return Err(EngineError::Full {
                slot_id: slot.id,
                capacity: slot.max_capacity,
            });
        }
        Ok(slot)
    }

    pub(super) fn check_temporal(&self, date: NaiveDate, origin: Origin) -> Result<(), EngineError> {
        if date < self.clock.today() && !origin.allows_past() {
            return Err(EngineError::PastDate(date));
        }
        Ok(())
    }

    fn check_eligibility(&self, slot: &Slot, requester: Requester) -> Result<Role, EngineError> {
        if !slot.is_active {
            return Err(EngineError::SlotInactive(slot.id));
        }
        let role = self
            .store
            .role(&slot.role_id)
            .ok_or_else(|| EngineError::not_found("role", slot.role_id))?;
        let eligible = role.audience == requester.kind
            && match requester.kind {
                RequesterKind::Client => true,
                RequesterKind::Volunteer => self.store.is_trained(&requester.id, &role.id),
            };
        if !eligible {
            return Err(EngineError::NotTrained {
                requester,
                role: role.name.clone(),
            });
        }
        Ok(role)
    }

    /// The requester's counted booking on `date` in another slot whose window overlaps `slot`.
    async fn find_overlap(
        &self,
        requester: Requester,
        date: NaiveDate,
        slot: &Slot,
        ignoring: Option<Ulid>,
    ) -> Option<(Booking, Slot)> {
        for booking_id in self.store.bookings_of(&requester) {
            if Some(booking_id) == ignoring {
                continue;
            }
            let Some((slot_id, booked_date)) = self.store.locate(&booking_id) else {
                continue;
            };
            if booked_date != date || slot_id == slot.id {
                continue;
            }
            let Some(state) = self.store.get_slot(&slot_id) else {
                continue;
            };
            let guard = state.read().await;
            if !guard.slot.window.overlaps(&slot.window) {
                continue;
            }
            if let Some(existing) = guard.booking(date, booking_id)
                && existing.status.is_counted()
            {
                return Some((existing.clone(), guard.slot.clone()));
            }
        }
        None
    }

    pub(super) fn check_closure(&self, slot: &Slot, role: &Role, date: NaiveDate) -> Result<(), EngineError> {
        if self.store.is_holiday(&date) || (is_weekend(date) && !role.weekends) {
            return Err(EngineError::ClosedDay(Closure::HolidayOrWeekend));
        }
        if let Some(day) = slot.weekday
            && day != date.weekday()
        {
            return Err(EngineError::ClosedDay(Closure::WrongWeekday(day)));
        }
        Ok(())
    }
}

impl Transaction<'_> {
    /// Admission step 8: re-check duplicate and capacity against locked state
    /// (plus anything already staged), grow capacity on force, stage the insert.
    pub(super) fn stage_booking(&mut self, admission: &Admission) -> Result<Booking, EngineError> {
        let slot = self
            .slot(admission.slot_id)
            .ok_or_else(|| EngineError::not_found("slot", admission.slot_id))?;
        if !slot.is_active {
            return Err(EngineError::SlotInactive(slot.id));
        }
        if let Some(existing) = self.holding(slot.id, admission.date, admission.requester) {
            return Err(EngineError::Duplicate(existing.id));
        }

        let counted = self.counted(slot.id, admission.date);
        if counted as usize >= MAX_BOOKINGS_PER_SLOT_DATE {
            return Err(EngineError::LimitExceeded("too many bookings for slot and date"));
        }
        if counted >= slot.max_capacity {
            if !admission.origin.force() {
                return Err(EngineError::Full {
                    slot_id: slot.id,
                    capacity: slot.max_capacity,
                });
            }
            info!(slot = %slot.id, from = slot.max_capacity, to = counted + 1, "forced booking grows capacity");
            self.stage(Event::SlotCapacityGrown {
                slot_id: slot.id,
                max_capacity: counted + 1,
            });
        }

        let booking = Booking {
            id: admission.id,
            requester: admission.requester,
            slot_id: slot.id,
            date: admission.date,
            status: admission.origin.initial_status(admission.requester.kind),
            note: admission.note.clone(),
            recurring_id: admission.recurring_id,
            reschedule_token: new_reschedule_token(),
            reason: None,
            created_on: self.engine.today(),
        };
        self.stage(Event::BookingCreated {
            booking: booking.clone(),
        });
        Ok(booking)
    }
}
