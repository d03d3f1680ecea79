use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::admission::{parse_request_date, Admission};
use super::{Engine, EngineError};

pub const CONFLICT_CANCEL_REASON: &str = "conflict";

/// The new booking to create when the caller keeps the new side.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub date: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    KeptExisting(Booking),
    KeptNew { booking: Booking, cancelled: Ulid },
}

impl Resolution {
    pub fn keep(&self) -> Keep {
        match self {
            Resolution::KeptExisting(_) => Keep::Existing,
            Resolution::KeptNew { .. } => Keep::New,
        }
    }

    pub fn booking(&self) -> &Booking {
        match self {
            Resolution::KeptExisting(booking) | Resolution::KeptNew { booking, .. } => booking,
        }
    }
}

impl Engine {
    /// Settle an overlap reported as CONFLICT.
    ///
    /// `Keep::Existing` writes nothing. `Keep::New` cancels the existing booking
    /// and admits the replacement for the same requester in one transaction.
    pub async fn resolve_conflict(
        &self,
        existing_id: Ulid,
        keep: Keep,
        replacement: Option<Replacement>,
    ) -> Result<Resolution, EngineError> {
        let existing = self
            .get_booking(existing_id)
            .await
            .ok_or_else(|| EngineError::not_found("booking", existing_id))?;

        if !existing.status.is_counted() {
            return Err(EngineError::AlreadyResolved(existing_id));
        }

        match keep {
            Keep::Existing => Ok(Resolution::KeptExisting(existing)),
            Keep::New => {
                let replacement = replacement.ok_or_else(|| {
                    EngineError::InvalidInput("keep = new needs booking_id, slot_id and date".into())
                })?;
                let admission = Admission {
                    id: replacement.id,
                    requester: existing.requester,
                    slot_id: replacement.slot_id,
                    date: parse_request_date(&replacement.date)?,
                    note: replacement.note,
                    origin: Origin::SelfService,
                    recurring_id: None,
                };
                let booking = self
                    .replace(existing_id, admission, CONFLICT_CANCEL_REASON)
                    .await?;
                info!(cancelled = %existing_id, kept = %booking.id, "conflict resolved, kept new");
                Ok(Resolution::KeptNew {
                    booking,
                    cancelled: existing_id,
                })
            }
        }
    }

    /// Cancel `existing_id` with `reason` and admit `admission` in the same
    /// transaction. Both slots are locked in id order; if the existing booking
    /// stopped being counted in the meantime nothing is written.
    pub(super) async fn replace(
        &self,
        existing_id: Ulid,
        admission: Admission,
        reason: &str,
    ) -> Result<Booking, EngineError> {
        let (old_slot, old_date) = self
            .store
            .locate(&existing_id)
            .ok_or_else(|| EngineError::not_found("booking", existing_id))?;
        self.precheck(&admission, Some(existing_id)).await?;

        let mut txn = self.begin(&[old_slot, admission.slot_id]).await?;
        let existing = txn
            .booking(old_slot, old_date, existing_id)
            .ok_or_else(|| EngineError::not_found("booking", existing_id))?;
        if !existing.status.is_counted() {
            return Err(EngineError::AlreadyResolved(existing_id));
        }
        txn.stage(Event::BookingStatusChanged {
            id: existing_id,
            slot_id: old_slot,
            date: old_date,
            status: BookingStatus::Cancelled,
            reason: Some(reason.to_string()),
        });
        let booking = txn.stage_booking(&admission)?;
        txn.commit().await?;
        Ok(booking)
    }
}
