use chrono::NaiveDate;
use tracing::{debug, error};

use crate::limits::{MAX_BOOKING_HORIZON_DAYS, MAX_SLOTS_PER_BOOKING};
use crate::model::{civil_now, now_ms, Appointment, AppointmentId, DayState, Event, GarageId, Ms, Slot};

use super::slots::plan_day_slots;
use super::{apply_decrement, apply_increment, SlotStore, StoreError};

impl SlotStore {
    /// Return the slot set for (garage, date), materializing it on first read.
    ///
    /// Capacity is `min(active mechanics, service bays)`, snapshotted now and
    /// never retroactively adjusted. Safe under concurrent callers: insert is
    /// first-write-wins, the loser re-reads the winner's slots.
    pub async fn get_or_create_day_slots(
        &self,
        garage_id: GarageId,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, StoreError> {
        self.materialize_day(garage_id, date, now_ms()).await
    }

    pub(crate) async fn materialize_day(
        &self,
        garage_id: GarageId,
        date: NaiveDate,
        now: Ms,
    ) -> Result<Vec<Slot>, StoreError> {
        let key = (garage_id, date);
        if let Some(day) = self.day(&key) {
            return Ok(day.read().await.slots.clone());
        }

        // Serialize creators of this day so exactly one generates and
        // appends; the insert-if-absent in install_day stays as the backstop.
        let creation = self
            .creating
            .entry(key)
            .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        let guard = creation.lock().await;
        let result = self.materialize_locked(garage_id, date, now).await;
        drop(guard);
        self.creating.remove(&key);
        result
    }

    /// The slow path, entered with this day's creation lock held.
    async fn materialize_locked(
        &self,
        garage_id: GarageId,
        date: NaiveDate,
        now: Ms,
    ) -> Result<Vec<Slot>, StoreError> {
        let key = (garage_id, date);
        if let Some(day) = self.day(&key) {
            // Lost the create race — re-read the winner's slot set.
            debug!("lost materialization race for garage {garage_id} on {date}");
            return Ok(day.read().await.slots.clone());
        }

        let profile = self.directory.profile(garage_id).await?;
        let (today, _) = civil_now(now, profile.utc_offset_min);
        if (date - today).num_days() > MAX_BOOKING_HORIZON_DAYS {
            return Err(StoreError::LimitExceeded("date beyond booking horizon"));
        }

        let mechanics = self.directory.active_mechanic_count(garage_id).await?;
        let bays = self.directory.service_bay_count(garage_id).await?;
        let capacity = mechanics.min(bays);

        let slots = plan_day_slots(
            profile.open_min,
            profile.close_min,
            profile.slot_len_min,
            capacity,
            date,
            now,
            profile.utc_offset_min,
        );

        let event = Event::DayMaterialized {
            garage_id,
            date,
            slot_len_min: profile.slot_len_min,
            slots: slots.clone(),
        };
        let _gate = self.compaction_gate.read().await;
        self.wal_append(&event).await?;
        self.install_day(DayState::new(garage_id, date, profile.slot_len_min, slots.clone()));
        metrics::counter!(crate::observability::DAYS_MATERIALIZED_TOTAL).increment(1);
        Ok(slots)
    }

    /// Durably commit an appointment.
    ///
    /// Re-validates capacity inside the day write lock (a racing commit or
    /// cancellation may have moved `booked` since the caller's snapshot),
    /// then lands the appointment write and the booked-count increments as
    /// one composite WAL record.
    pub async fn commit_booking(&self, record: Appointment) -> Result<(), StoreError> {
        if record.slot_ids.is_empty() {
            return Err(StoreError::LimitExceeded("booking covers no slots"));
        }
        if record.slot_ids.len() > MAX_SLOTS_PER_BOOKING {
            return Err(StoreError::LimitExceeded("booking covers too many slots"));
        }

        // Gate before day lock, always in that order.
        let _gate = self.compaction_gate.read().await;
        let day = self.day(&(record.garage_id, record.date)).ok_or(StoreError::DayNotFound {
            garage_id: record.garage_id,
            date: record.date,
        })?;
        let mut guard = day.write().await;

        for &slot_id in &record.slot_ids {
            let slot = guard.slot(slot_id).ok_or_else(|| {
                error!("booking {} references unknown slot {slot_id}", record.id);
                StoreError::SlotNotFound(slot_id)
            })?;
            if !slot.released {
                return Err(StoreError::SlotNotBookable(slot_id));
            }
            if slot.booked >= slot.capacity {
                return Err(StoreError::CapacityExhausted(slot_id));
            }
        }

        let event = Event::AppointmentBooked {
            record: record.clone(),
        };
        self.wal_append(&event).await?;
        apply_increment(&mut guard, &record.slot_ids);
        self.appointments.insert(record.id, record);
        metrics::counter!(crate::observability::APPOINTMENTS_BOOKED_TOTAL).increment(1);
        Ok(())
    }

    /// Cancellation hook: mark the record and release its slots exactly once.
    /// Returns false when the appointment was already cancelled (no-op).
    pub async fn cancel_appointment(&self, id: AppointmentId) -> Result<bool, StoreError> {
        let record = self
            .appointments
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::AppointmentNotFound(id))?;

        let _gate = self.compaction_gate.read().await;
        let day = self.day(&(record.garage_id, record.date)).ok_or(StoreError::DayNotFound {
            garage_id: record.garage_id,
            date: record.date,
        })?;
        let mut guard = day.write().await;

        // Re-check under the lock — two racing cancels must release once.
        let already = self
            .appointments
            .get(&id)
            .map(|r| r.cancelled)
            .unwrap_or(true);
        if already {
            return Ok(false);
        }

        let event = Event::AppointmentCancelled { id };
        self.wal_append(&event).await?;
        apply_decrement(&mut guard, &record.slot_ids);
        if let Some(mut r) = self.appointments.get_mut(&id) {
            r.cancelled = true;
        }
        metrics::counter!(crate::observability::APPOINTMENTS_CANCELLED_TOTAL).increment(1);
        Ok(true)
    }
}
