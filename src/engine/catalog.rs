use chrono::{NaiveDate, NaiveTime, Weekday};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admission::parse_request_date;
use super::{Engine, EngineError};

/// Changes to one slot. `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct SlotEdit {
    pub slot_id: Ulid,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub max_capacity: Option<u32>,
    pub is_active: Option<bool>,
    /// `Some(None)` clears the weekday restriction.
    pub weekday: Option<Option<Weekday>>,
}

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_slot_shape(slot: &Slot) -> Result<(), EngineError> {
    if slot.window.start >= slot.window.end {
        return Err(EngineError::InvalidInput(format!(
            "start_time {} must be before end_time {}",
            slot.window.start.format("%H:%M"),
            slot.window.end.format("%H:%M")
        )));
    }
    if slot.max_capacity == 0 {
        return Err(EngineError::InvalidInput("max_capacity must be greater than 0".into()));
    }
    if slot.max_capacity > MAX_SLOT_CAPACITY {
        return Err(EngineError::LimitExceeded("max_capacity too large"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_role(&self, role: Role) -> Result<(), EngineError> {
        check_name(&role.name)?;
        let held = self.catalog_lock.lock().await;
        if self.store.role_count() >= MAX_ROLES {
            return Err(EngineError::LimitExceeded("too many roles"));
        }
        if self.store.role(&role.id).is_some() {
            return Err(EngineError::AlreadyExists(format!("role {}", role.id)));
        }
        info!(role = %role.id, name = %role.name, audience = role.audience.as_str(), "role created");
        self.persist_catalog(&held, Event::RoleCreated { role }).await
    }

    pub async fn create_slot(&self, slot: Slot) -> Result<(), EngineError> {
        check_slot_shape(&slot)?;
        let held = self.catalog_lock.lock().await;
        if self.store.slot_count() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        if self.store.contains_slot(&slot.id) {
            return Err(EngineError::AlreadyExists(format!("slot {}", slot.id)));
        }
        if self.store.role(&slot.role_id).is_none() {
            return Err(EngineError::not_found("role", slot.role_id));
        }
        if slot.is_active {
            self.check_no_slot_overlap(&slot).await?;
        }
        info!(slot = %slot.id, role = %slot.role_id, window = %slot.window, capacity = slot.max_capacity, "slot created");
        self.persist_catalog(&held, Event::SlotCreated { slot }).await
    }

    /// Edit a slot under its write lock so concurrent forced growth is never lost.
    /// Capacity set here may be lower than the current count: existing bookings stay.
    pub async fn edit_slot(&self, edit: SlotEdit) -> Result<Slot, EngineError> {
        let _held = self.catalog_lock.lock().await;
        let current = {
            let state = self
                .store
                .get_slot(&edit.slot_id)
                .ok_or_else(|| EngineError::not_found("slot", edit.slot_id))?;
            let guard = state.read().await;
            guard.slot.clone()
        };
        let proposed = apply_edit(current, &edit);
        check_slot_shape(&proposed)?;
        // Windows only change under the catalog lock, so this check stays valid
        // once we take the write lock below.
        if proposed.is_active {
            self.check_no_slot_overlap(&proposed).await?;
        }

        let mut txn = self.begin(&[edit.slot_id]).await?;
        let locked = txn
            .slot(edit.slot_id)
            .ok_or_else(|| EngineError::not_found("slot", edit.slot_id))?;
        let updated = apply_edit(locked, &edit);
        check_slot_shape(&updated)?;
        txn.stage(Event::SlotUpdated { slot: updated.clone() });
        txn.commit().await?;
        info!(slot = %updated.id, window = %updated.window, capacity = updated.max_capacity, active = updated.is_active, "slot edited");
        Ok(updated)
    }

    /// Active slots of the same role may not overlap, whatever weekday either is restricted to.
    async fn check_no_slot_overlap(&self, slot: &Slot) -> Result<(), EngineError> {
        for other_id in self.store.slot_ids() {
            if other_id == slot.id {
                continue;
            }
            let Some(state) = self.store.get_slot(&other_id) else {
                continue;
            };
            let other = state.read().await;
            if other.slot.is_active
                && other.slot.role_id == slot.role_id
                && other.slot.window.overlaps(&slot.window)
            {
                return Err(EngineError::SlotOverlap(other_id));
            }
        }
        Ok(())
    }

    pub async fn grant_training(&self, volunteer_id: Ulid, role_id: Ulid) -> Result<(), EngineError> {
        let held = self.catalog_lock.lock().await;
        let role = self
            .store
            .role(&role_id)
            .ok_or_else(|| EngineError::not_found("role", role_id))?;
        if role.audience != RequesterKind::Volunteer {
            return Err(EngineError::InvalidInput(format!("role {} is not a volunteer role", role.name)));
        }
        if self.store.is_trained(&volunteer_id, &role_id) {
            return Ok(());
        }
        self.persist_catalog(&held, Event::TrainingGranted { volunteer_id, role_id })
            .await
    }

    pub async fn revoke_training(&self, volunteer_id: Ulid, role_id: Ulid) -> Result<(), EngineError> {
        let held = self.catalog_lock.lock().await;
        if !self.store.is_trained(&volunteer_id, &role_id) {
            return Err(EngineError::not_found("training", format!("{volunteer_id}/{role_id}")));
        }
        self.persist_catalog(&held, Event::TrainingRevoked { volunteer_id, role_id })
            .await
    }

    pub async fn add_holiday(&self, date: &str, reason: Option<String>) -> Result<Holiday, EngineError> {
        let date = parse_request_date(date)?;
        if let Some(r) = &reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let held = self.catalog_lock.lock().await;
        if self.store.is_holiday(&date) {
            return Err(EngineError::AlreadyExists(format!("holiday {date}")));
        }
        let holiday = Holiday { date, reason };
        self.persist_catalog(&held, Event::HolidayAdded { holiday: holiday.clone() })
            .await?;
        info!(%date, "holiday added");
        Ok(holiday)
    }

    pub async fn remove_holiday(&self, date: &str) -> Result<NaiveDate, EngineError> {
        let date = parse_request_date(date)?;
        let held = self.catalog_lock.lock().await;
        if !self.store.is_holiday(&date) {
            return Err(EngineError::not_found("holiday", date));
        }
        self.persist_catalog(&held, Event::HolidayRemoved { date }).await?;
        Ok(date)
    }
}

fn apply_edit(mut slot: Slot, edit: &SlotEdit) -> Slot {
    if let Some(start) = edit.start_time {
        slot.window.start = start;
    }
    if let Some(end) = edit.end_time {
        slot.window.end = end;
    }
    if let Some(capacity) = edit.max_capacity {
        slot.max_capacity = capacity;
    }
    if let Some(active) = edit.is_active {
        slot.is_active = active;
    }
    if let Some(weekday) = edit.weekday {
        slot.weekday = weekday;
    }
    slot
}
