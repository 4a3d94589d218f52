use chrono::NaiveDate;

use crate::model::{Appointment, AppointmentId, GarageId, Slot, SlotId};

use super::SlotStore;

impl SlotStore {
    /// Snapshot a single slot's durable state.
    pub async fn slot_by_id(&self, slot_id: SlotId) -> Option<Slot> {
        let key = self.day_key_for_slot(slot_id)?;
        let day = self.day(&key)?;
        let guard = day.read().await;
        guard.slot(slot_id).cloned()
    }

    /// Slot set for a day that has already been materialized. Use
    /// `get_or_create_day_slots` for the lazy-creating read.
    pub async fn day_slots(&self, garage_id: GarageId, date: NaiveDate) -> Option<Vec<Slot>> {
        let day = self.day(&(garage_id, date))?;
        let guard = day.read().await;
        Some(guard.slots.clone())
    }

    pub fn appointment(&self, id: AppointmentId) -> Option<Appointment> {
        self.appointments.get(&id).map(|r| r.value().clone())
    }

    pub fn appointment_count(&self) -> usize {
        self.appointments.len()
    }

    pub fn day_count(&self) -> usize {
        self.days.len()
    }
}
