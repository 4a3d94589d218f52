//! Hard caps that bound memory and request cost. All are generous for the
//! domain; hitting one is a client bug or an abuse pattern, not a tuning knob.

/// Furthest-out date a day slot set may be materialized for.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 365;

/// Shortest slot granularity a garage profile may declare.
pub const MIN_SLOT_LEN_MIN: u16 = 5;

/// Longest slot granularity a garage profile may declare.
pub const MAX_SLOT_LEN_MIN: u16 = 240;

/// Most consecutive slots a single booking may cover (8 h of 5-minute slots).
pub const MAX_SLOTS_PER_BOOKING: usize = 96;

/// Longest total service duration for one booking, in minutes.
pub const MAX_TOTAL_DURATION_MIN: u32 = 8 * 60;

/// Most service line items on one booking.
pub const MAX_SERVICE_ITEMS: usize = 20;

/// Longest service line-item name.
pub const MAX_ITEM_NAME_LEN: usize = 120;
