use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{info, warn};
use ulid::Ulid;

use crate::calendar::days;
use crate::limits::*;
use crate::model::*;

use super::admission::{parse_request_date, Admission};
use super::{Engine, EngineError};

pub const SERIES_CANCEL_REASON: &str = "series cancelled";

#[derive(Debug, Clone)]
pub struct SeriesRequest {
    pub id: Ulid,
    pub requester: Requester,
    pub slot_id: Ulid,
    pub start_date: String,
    pub end_date: String,
    pub pattern: Pattern,
    pub origin: Origin,
}

impl Engine {
    /// Persist a series, then admit each matching date in order.
    ///
    /// Per-date rejections land in `skipped` with the error's message; only a
    /// bad request or a WAL failure fails the whole call.
    pub async fn create_series(&self, request: SeriesRequest) -> Result<SeriesOutcome, EngineError> {
        let start = parse_request_date(&request.start_date)?;
        let end = parse_request_date(&request.end_date)?;
        if end < start {
            return Err(EngineError::InvalidInput(format!(
                "end_date {end} is before start_date {start}"
            )));
        }
        if (end - start).num_days() + 1 > MAX_SERIES_DAYS {
            return Err(EngineError::LimitExceeded("recurring series spans too many days"));
        }
        if let Pattern::Weekly { days } = &request.pattern
            && days.is_empty()
        {
            return Err(EngineError::InvalidInput("weekly pattern needs at least one day".into()));
        }
        if !self.store.contains_slot(&request.slot_id) {
            return Err(EngineError::not_found("slot", request.slot_id));
        }

        let series = RecurringSeries {
            id: request.id,
            requester: request.requester,
            slot_id: request.slot_id,
            start_date: start,
            end_date: end,
            pattern: request.pattern,
            created_on: self.today(),
        };
        {
            let held = self.catalog_lock.lock().await;
            if self.store.series(&series.id).is_some() {
                return Err(EngineError::AlreadyExists(format!("recurring series {}", series.id)));
            }
            self.persist_catalog(&held, Event::SeriesCreated { series: series.clone() })
                .await?;
        }

        let mut outcome = SeriesOutcome {
            recurring_id: series.id,
            successes: Vec::new(),
            skipped: Vec::new(),
        };
        for date in days(start, end).filter(|d| series.pattern.includes(*d)) {
            let admission = Admission {
                id: Ulid::new(),
                requester: series.requester,
                slot_id: series.slot_id,
                date,
                note: None,
                origin: request.origin,
                recurring_id: Some(series.id),
            };
            match self.admit(admission).await {
                Ok(_) => outcome.successes.push(date),
                Err(e) if e.is_skippable() => outcome.skipped.push(SkippedDate {
                    date,
                    reason: e.to_string(),
                }),
                Err(e) => {
                    warn!(series = %series.id, %date, "recurring expansion aborted: {e}");
                    return Err(e);
                }
            }
        }

        info!(
            series = %series.id,
            requester = %series.requester,
            booked = outcome.successes.len(),
            skipped = outcome.skipped.len(),
            "recurring series created"
        );
        Ok(outcome)
    }

    /// Cancel every counted occurrence dated `from` or later (default today).
    /// Returns the number cancelled.
    pub async fn cancel_series(&self, id: Ulid, from: Option<&str>) -> Result<usize, EngineError> {
        let from = match from {
            Some(raw) => parse_request_date(raw)?,
            None => self.today(),
        };
        if self.store.series(&id).is_none() {
            return Err(EngineError::not_found("recurring series", id));
        }

        let mut by_slot: BTreeMap<Ulid, Vec<(Ulid, NaiveDate)>> = BTreeMap::new();
        for booking_id in self.store.series_bookings(&id) {
            if let Some((slot_id, date)) = self.store.locate(&booking_id)
                && date >= from
            {
                by_slot.entry(slot_id).or_default().push((booking_id, date));
            }
        }

        let mut cancelled = 0;
        for (slot_id, occurrences) in by_slot {
            let mut txn = self.begin(&[slot_id]).await?;
            for (booking_id, date) in occurrences {
                let Some(booking) = txn.booking(slot_id, date, booking_id) else {
                    continue;
                };
                if !booking.status.is_counted() {
                    continue;
                }
                txn.stage(Event::BookingStatusChanged {
                    id: booking_id,
                    slot_id,
                    date,
                    status: BookingStatus::Cancelled,
                    reason: Some(SERIES_CANCEL_REASON.into()),
                });
                cancelled += 1;
            }
            txn.commit().await?;
        }

        info!(series = %id, %from, cancelled, "recurring series cancelled");
        Ok(cancelled)
    }
}
