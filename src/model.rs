use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — used for "now" and hold expiry.
pub type Ms = i64;

/// Minutes since local midnight. Slot times live on a civil-day grid,
/// so minute-of-day is the native unit; `Ms` only appears at the edges.
pub type MinuteOfDay = u16;

pub type GarageId = Ulid;
pub type SlotId = Ulid;
pub type UserId = Ulid;
pub type AppointmentId = Ulid;

/// A materialized day is keyed by (garage, civil date).
pub type DayKey = (GarageId, NaiveDate);

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Parse `"HH:MM"` into minutes since midnight. `"24:00"` is accepted as a
/// closing time; anything past that is rejected.
pub fn parse_hhmm(s: &str) -> Option<MinuteOfDay> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return None;
    }
    Some(h * 60 + m)
}

pub fn format_hhmm(minute: MinuteOfDay) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// Civil date and minute-of-day at a fixed UTC offset.
///
/// The garage's offset defines its calendar day; the process timezone is
/// never consulted, so "today" is stable no matter where the server runs.
pub fn civil_now(now: Ms, utc_offset_min: i32) -> (NaiveDate, MinuteOfDay) {
    let utc = DateTime::<Utc>::from_timestamp_millis(now).unwrap_or(DateTime::UNIX_EPOCH);
    let offset = FixedOffset::east_opt(utc_offset_min * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
    let local = utc.with_timezone(&offset);
    let minute = (local.time().hour() * 60 + local.time().minute()) as MinuteOfDay;
    (local.date_naive(), minute)
}

/// One capacity-bounded unit of bookable time.
///
/// Shape (times, capacity) is fixed at materialization; only `booked` moves,
/// and only on the commit/cancel path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub start_min: MinuteOfDay,
    pub end_min: MinuteOfDay,
    pub capacity: u32,
    pub booked: u32,
    /// Open for customer booking. Always true today; kept as the seam for
    /// same-day release throttling.
    pub released: bool,
}

impl Slot {
    pub fn duration_min(&self) -> u16 {
        self.end_min - self.start_min
    }

    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.booked)
    }
}

/// All slots for one (garage, date), ordered by start time.
#[derive(Debug, Clone)]
pub struct DayState {
    pub garage_id: GarageId,
    pub date: NaiveDate,
    pub slot_len_min: u16,
    pub slots: Vec<Slot>,
}

impl DayState {
    pub fn new(garage_id: GarageId, date: NaiveDate, slot_len_min: u16, slots: Vec<Slot>) -> Self {
        Self {
            garage_id,
            date,
            slot_len_min,
            slots,
        }
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceItem {
    pub name: String,
    pub duration_min: u32,
}

/// A committed booking over one or more consecutive slots of a single day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub garage_id: GarageId,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub slot_ids: Vec<SlotId>,
    pub start_min: MinuteOfDay,
    pub end_min: MinuteOfDay,
    pub total_duration_min: u32,
    pub items: Vec<ServiceItem>,
    pub cancelled: bool,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// A day's slot set came into existence. Replayed insert-if-absent, so a
    /// record written by the loser of a materialization race is inert.
    DayMaterialized {
        garage_id: GarageId,
        date: NaiveDate,
        slot_len_min: u16,
        slots: Vec<Slot>,
    },
    /// Appointment write + booked-count increments, atomically.
    AppointmentBooked { record: Appointment },
    /// Cancellation: mark the record and decrement its slots once.
    AppointmentCancelled { id: AppointmentId },
    /// Compaction only: reinsert a record whose increments are already
    /// folded into the day snapshot. Never incremented on replay.
    AppointmentRestored { record: Appointment },
}
