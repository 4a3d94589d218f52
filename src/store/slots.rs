use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{civil_now, MinuteOfDay, Ms, Slot};

// ── Slot-set generation ───────────────────────────────────────────

/// Produce the ordered slot set for one (garage, civil day).
///
/// Slots are emitted on the `slot_len_min` grid from the effective start while
/// `current + len <= close`; a trailing remainder that cannot fit a whole slot
/// is dropped, never emitted as a partial slot. When `date` is the garage's
/// current civil day (per `utc_offset_min`, never the process timezone), the
/// effective start is `max(open, now rounded up to the grid)` so a slot that
/// has already begun is never offered. An empty result is a valid outcome,
/// not an error.
pub fn plan_day_slots(
    open_min: MinuteOfDay,
    close_min: MinuteOfDay,
    slot_len_min: u16,
    capacity: u32,
    date: NaiveDate,
    now: Ms,
    utc_offset_min: i32,
) -> Vec<Slot> {
    if slot_len_min == 0 {
        return Vec::new();
    }
    let (today, minute_now) = civil_now(now, utc_offset_min);
    let Some(start) = effective_start(open_min, slot_len_min, date, today, minute_now) else {
        return Vec::new();
    };

    let mut slots = Vec::new();
    let mut cur = start;
    while cur + slot_len_min <= close_min {
        slots.push(Slot {
            id: Ulid::new(),
            start_min: cur,
            end_min: cur + slot_len_min,
            capacity,
            booked: 0,
            released: true,
        });
        cur += slot_len_min;
    }
    slots
}

/// First minute a slot may start at, or `None` when the whole day is past.
fn effective_start(
    open_min: MinuteOfDay,
    slot_len_min: u16,
    date: NaiveDate,
    today: NaiveDate,
    minute_now: MinuteOfDay,
) -> Option<MinuteOfDay> {
    if date < today {
        return None;
    }
    if date > today {
        return Some(open_min);
    }
    Some(open_min.max(round_up_to_grid(minute_now, slot_len_min)))
}

/// Round `minute` up to the next multiple of `slot_len`. A minute already on
/// the grid stays put.
pub fn round_up_to_grid(minute: MinuteOfDay, slot_len: u16) -> MinuteOfDay {
    ((minute as u32).div_ceil(slot_len as u32) * slot_len as u32) as MinuteOfDay
}
