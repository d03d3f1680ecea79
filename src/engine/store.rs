use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::{SharedSlotState, SlotState};

/// In-memory state: slots behind their own locks, the rest of the catalog,
/// and the booking indexes.
pub struct Store {
    slots: DashMap<Ulid, SharedSlotState>,
    roles: DashMap<Ulid, Role>,
    /// volunteer id → trained role ids
    trainings: DashMap<Ulid, HashSet<Ulid>>,
    holidays: DashMap<NaiveDate, Holiday>,
    series: DashMap<Ulid, RecurringSeries>,
    /// booking id → (slot id, date)
    booking_slot: DashMap<Ulid, (Ulid, NaiveDate)>,
    by_requester: DashMap<Requester, Vec<Ulid>>,
    by_series: DashMap<Ulid, Vec<Ulid>>,
    by_token: DashMap<String, Ulid>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            roles: DashMap::new(),
            trainings: DashMap::new(),
            holidays: DashMap::new(),
            series: DashMap::new(),
            booking_slot: DashMap::new(),
            by_requester: DashMap::new(),
            by_series: DashMap::new(),
            by_token: DashMap::new(),
        }
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn contains_slot(&self, id: &Ulid) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn insert_slot(&self, slot: Slot) {
        self.slots.insert(slot.id, Arc::new(RwLock::new(SlotState::new(slot))));
    }

    /// Every slot id, ascending (the multi-slot lock order).
    pub fn slot_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.slots.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Catalog ──────────────────────────────────────────────

    pub fn role(&self, id: &Ulid) -> Option<Role> {
        self.roles.get(id).map(|e| e.value().clone())
    }

    pub fn role_count(&self) -> usize {
        self.roles.len()
    }

    pub fn role_name(&self, id: &Ulid) -> String {
        self.roles
            .get(id)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.roles.iter().map(|e| e.value().clone()).collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        roles
    }

    pub fn is_trained(&self, volunteer_id: &Ulid, role_id: &Ulid) -> bool {
        self.trainings
            .get(volunteer_id)
            .is_some_and(|roles| roles.contains(role_id))
    }

    /// All (volunteer id, role id) pairs.
    pub fn trainings(&self) -> Vec<(Ulid, Ulid)> {
        let mut pairs: Vec<(Ulid, Ulid)> = self
            .trainings
            .iter()
            .flat_map(|e| {
                let volunteer = *e.key();
                e.value().iter().map(move |r| (volunteer, *r)).collect::<Vec<_>>()
            })
            .collect();
        pairs.sort();
        pairs
    }

    pub fn is_holiday(&self, date: &NaiveDate) -> bool {
        self.holidays.contains_key(date)
    }

    pub fn holidays(&self) -> Vec<Holiday> {
        let mut holidays: Vec<Holiday> = self.holidays.iter().map(|e| e.value().clone()).collect();
        holidays.sort_by_key(|h| h.date);
        holidays
    }

    pub fn series(&self, id: &Ulid) -> Option<RecurringSeries> {
        self.series.get(id).map(|e| e.value().clone())
    }

    pub fn all_series(&self) -> Vec<RecurringSeries> {
        let mut all: Vec<RecurringSeries> = self.series.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    // ── Booking indexes ──────────────────────────────────────

    pub fn locate(&self, booking_id: &Ulid) -> Option<(Ulid, NaiveDate)> {
        self.booking_slot.get(booking_id).map(|e| *e.value())
    }

    pub fn bookings_of(&self, requester: &Requester) -> Vec<Ulid> {
        self.by_requester
            .get(requester)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn series_bookings(&self, series_id: &Ulid) -> Vec<Ulid> {
        self.by_series
            .get(series_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn booking_for_token(&self, token: &str) -> Option<Ulid> {
        self.by_token.get(token).map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Apply a slot-scoped event. Caller holds the slot's write lock.
    pub fn apply_event(&self, state: &mut SlotState, event: &Event) {
        match event {
            Event::SlotUpdated { slot } => state.slot = slot.clone(),
            Event::SlotCapacityGrown { max_capacity, .. } => {
                state.slot.max_capacity = state.slot.max_capacity.max(*max_capacity);
            }
            Event::BookingCreated { booking } => {
                self.booking_slot.insert(booking.id, (booking.slot_id, booking.date));
                self.by_requester.entry(booking.requester).or_default().push(booking.id);
                if let Some(series_id) = booking.recurring_id {
                    self.by_series.entry(series_id).or_default().push(booking.id);
                }
                self.by_token.insert(booking.reschedule_token.clone(), booking.id);
                state.bookings.entry(booking.date).or_default().push(booking.clone());
            }
            Event::BookingStatusChanged {
                id,
                date,
                status,
                reason,
                ..
            } => {
                if let Some(booking) = state.booking_mut(*date, *id) {
                    booking.status = *status;
                    booking.reason = reason.clone();
                }
            }
            // SlotCreated is handled at the map level; the rest are catalog events.
            Event::SlotCreated { .. }
            | Event::RoleCreated { .. }
            | Event::TrainingGranted { .. }
            | Event::TrainingRevoked { .. }
            | Event::HolidayAdded { .. }
            | Event::HolidayRemoved { .. }
            | Event::SeriesCreated { .. } => {}
        }
    }

    /// Apply an event that touches no slot.
    pub fn apply_catalog(&self, event: &Event) {
        match event {
            Event::RoleCreated { role } => {
                self.roles.insert(role.id, role.clone());
            }
            Event::TrainingGranted {
                volunteer_id,
                role_id,
            } => {
                self.trainings.entry(*volunteer_id).or_default().insert(*role_id);
            }
            Event::TrainingRevoked {
                volunteer_id,
                role_id,
            } => {
                if let Some(mut roles) = self.trainings.get_mut(volunteer_id) {
                    roles.remove(role_id);
                }
            }
            Event::HolidayAdded { holiday } => {
                self.holidays.insert(holiday.date, holiday.clone());
            }
            Event::HolidayRemoved { date } => {
                self.holidays.remove(date);
            }
            Event::SeriesCreated { series } => {
                self.series.insert(series.id, series.clone());
            }
            Event::SlotCreated { .. }
            | Event::SlotUpdated { .. }
            | Event::SlotCapacityGrown { .. }
            | Event::BookingCreated { .. }
            | Event::BookingStatusChanged { .. } => {}
        }
    }
}
