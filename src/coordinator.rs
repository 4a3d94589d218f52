use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time::timeout;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::arbiter::{ArbiterError, ReservationArbiter};
use crate::limits::{
    MAX_ITEM_NAME_LEN, MAX_SERVICE_ITEMS, MAX_SLOTS_PER_BOOKING, MAX_TOTAL_DURATION_MIN,
};
use crate::model::{Appointment, GarageId, ServiceItem, Slot, SlotId, UserId};
use crate::store::{SlotStore, StoreError};

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub garage_id: GarageId,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub start_slot_id: SlotId,
    pub total_duration_min: u32,
    pub items: Vec<ServiceItem>,
}

#[derive(Debug)]
pub enum BookingError {
    /// A required slot has no remaining capacity once in-flight holds count.
    SlotUnavailable,
    /// The day ends before enough consecutive slots cover the service.
    InsufficientConsecutiveCapacity { needed_min: u32, available_min: u32 },
    /// The resolved slot run has a gap — stale client-side slot data.
    NonContiguousSlots,
    UnknownStartSlot(SlotId),
    InvalidRequest(&'static str),
    AttemptTimeout,
    Store(StoreError),
    Arbiter(ArbiterError),
}

impl BookingError {
    fn is_transient(&self) -> bool {
        match self {
            BookingError::Store(e) => e.is_transient(),
            BookingError::Arbiter(_) => true,
            _ => false,
        }
    }

    /// Wire-level error code.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::SlotUnavailable => "SlotUnavailable",
            BookingError::InsufficientConsecutiveCapacity { .. } => {
                "InsufficientConsecutiveCapacity"
            }
            BookingError::NonContiguousSlots => "NonContiguousSlots",
            BookingError::UnknownStartSlot(_) => "UnknownStartSlot",
            BookingError::InvalidRequest(_) => "InvalidRequest",
            BookingError::AttemptTimeout => "AttemptTimeout",
            BookingError::Store(_) => "StoreError",
            BookingError::Arbiter(_) => "ArbiterError",
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::SlotUnavailable => write!(f, "slot no longer available"),
            BookingError::InsufficientConsecutiveCapacity {
                needed_min,
                available_min,
            } => write!(
                f,
                "only {available_min} of {needed_min} consecutive minutes available"
            ),
            BookingError::NonContiguousSlots => write!(f, "resolved slots are not contiguous"),
            BookingError::UnknownStartSlot(id) => write!(f, "unknown start slot: {id}"),
            BookingError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            BookingError::AttemptTimeout => write!(f, "booking attempt timed out"),
            BookingError::Store(e) => write!(f, "store: {e}"),
            BookingError::Arbiter(e) => write!(f, "arbiter: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}

const READ_RETRY_ATTEMPTS: u32 = 3;
const READ_RETRY_BASE: Duration = Duration::from_millis(10);

/// Bounded retry with doubling backoff, for read/hold steps only. Commit is
/// never routed through here: retrying a commit risks double-writes.
async fn with_read_retries<T, F, Fut>(mut op: F) -> Result<T, BookingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BookingError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < READ_RETRY_ATTEMPTS => {
                attempt += 1;
                debug!("transient failure, retry {attempt}: {e}");
                tokio::time::sleep(READ_RETRY_BASE * 2u32.pow(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Orchestrates one booking attempt end to end: resolve the consecutive slot
/// run, hold each slot via the arbiter with the over-subscription check,
/// durably commit, then release every hold no matter how the attempt ended.
///
/// There is no retry of a failed attempt here — the caller re-queries and
/// picks another slot.
pub struct BookingCoordinator {
    store: Arc<SlotStore>,
    arbiter: Arc<dyn ReservationArbiter>,
    attempt_timeout: Duration,
}

impl BookingCoordinator {
    pub fn new(
        store: Arc<SlotStore>,
        arbiter: Arc<dyn ReservationArbiter>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            store,
            arbiter,
            attempt_timeout,
        }
    }

    pub async fn book(&self, req: BookingRequest) -> Result<Appointment, BookingError> {
        validate_request(&req)?;

        let started = std::time::Instant::now();
        // Holds taken so far live outside the timed future so the cleanup
        // below reaches them even when the attempt is cancelled mid-await.
        let held: Arc<Mutex<Vec<SlotId>>> = Arc::new(Mutex::new(Vec::new()));

        let result = match timeout(self.attempt_timeout, self.attempt(&req, &held)).await {
            Ok(r) => r,
            Err(_) => Err(BookingError::AttemptTimeout),
        };

        // Unconditional release — success, failure, and timeout all end here.
        let to_release: Vec<SlotId> = std::mem::take(&mut *held.lock().expect("held-slots mutex"));
        for slot_id in to_release {
            if let Err(e) = self.arbiter.release(slot_id).await {
                // TTL self-heals whatever fails to release here.
                warn!("failed to release hold on {slot_id}: {e}");
            }
        }

        metrics::counter!(
            crate::observability::BOOKING_ATTEMPTS_TOTAL,
            "outcome" => crate::observability::outcome_label(&result)
        )
        .increment(1);
        metrics::histogram!(crate::observability::BOOKING_ATTEMPT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn attempt(
        &self,
        req: &BookingRequest,
        held: &Arc<Mutex<Vec<SlotId>>>,
    ) -> Result<Appointment, BookingError> {
        let chosen = self.resolve_slots(req).await?;

        // Provisional holds, one arbiter round trip per slot. The counter is
        // incremented before the capacity read, so a concurrent competitor
        // sees this hold before it can pass its own check.
        for slot in &chosen {
            let slot_id = slot.id;
            let count = with_read_retries(|| async move {
                self.arbiter.hold(slot_id).await.map_err(BookingError::Arbiter)
            })
            .await?;
            held.lock().expect("held-slots mutex").push(slot_id);

            let snapshot = self
                .store
                .slot_by_id(slot_id)
                .await
                .ok_or(BookingError::Store(StoreError::SlotNotFound(slot_id)))?;
            if count > snapshot.remaining() {
                debug!(
                    "slot {slot_id} over-subscribed: booked={} holds={count} capacity={}",
                    snapshot.booked, snapshot.capacity
                );
                return Err(BookingError::SlotUnavailable);
            }
        }

        // Durable commit — never retried. The store re-validates capacity
        // under the day write lock before applying anything.
        let record = Appointment {
            id: Ulid::new(),
            garage_id: req.garage_id,
            user_id: req.user_id,
            date: req.date,
            slot_ids: chosen.iter().map(|s| s.id).collect(),
            start_min: chosen[0].start_min,
            end_min: chosen[chosen.len() - 1].end_min,
            total_duration_min: req.total_duration_min,
            items: req.items.clone(),
            cancelled: false,
        };
        self.store
            .commit_booking(record.clone())
            .await
            .map_err(|e| match e {
                StoreError::CapacityExhausted(_) | StoreError::SlotNotBookable(_) => {
                    BookingError::SlotUnavailable
                }
                other => BookingError::Store(other),
            })?;
        Ok(record)
    }

    /// Steps 1–2: load the day (lazily materializing), walk forward from the
    /// requested start slot until the service duration is covered, and verify
    /// the run is strictly contiguous. No holds are taken in here.
    async fn resolve_slots(&self, req: &BookingRequest) -> Result<Vec<Slot>, BookingError> {
        let slots = with_read_retries(|| async move {
            self.store
                .get_or_create_day_slots(req.garage_id, req.date)
                .await
                .map_err(BookingError::Store)
        })
        .await?;

        let start_idx = slots
            .iter()
            .position(|s| s.id == req.start_slot_id)
            .ok_or(BookingError::UnknownStartSlot(req.start_slot_id))?;

        let mut chosen: Vec<Slot> = Vec::new();
        let mut covered: u32 = 0;
        for slot in &slots[start_idx..] {
            if covered >= req.total_duration_min {
                break;
            }
            chosen.push(slot.clone());
            covered += slot.duration_min() as u32;
        }
        if covered < req.total_duration_min {
            return Err(BookingError::InsufficientConsecutiveCapacity {
                needed_min: req.total_duration_min,
                available_min: covered,
            });
        }
        if chosen.len() > MAX_SLOTS_PER_BOOKING {
            return Err(BookingError::InvalidRequest("service spans too many slots"));
        }

        for pair in chosen.windows(2) {
            if pair[0].end_min != pair[1].start_min {
                return Err(BookingError::NonContiguousSlots);
            }
        }
        Ok(chosen)
    }
}

fn validate_request(req: &BookingRequest) -> Result<(), BookingError> {
    if req.total_duration_min == 0 {
        return Err(BookingError::InvalidRequest("total duration must be positive"));
    }
    if req.total_duration_min > MAX_TOTAL_DURATION_MIN {
        return Err(BookingError::InvalidRequest("total duration too long"));
    }
    if req.items.len() > MAX_SERVICE_ITEMS {
        return Err(BookingError::InvalidRequest("too many service items"));
    }
    for item in &req.items {
        if item.name.is_empty() || item.name.len() > MAX_ITEM_NAME_LEN {
            return Err(BookingError::InvalidRequest("bad service item name"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::InMemoryArbiter;
    use crate::directory::{GarageProfile, GarageRecord, StaticDirectory};
    use crate::model::{parse_hhmm, DayState};
    use async_trait::async_trait;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("pitstop_test_coordinator");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn directory_with(garage: GarageId, mechanics: u32, bays: u32) -> Arc<StaticDirectory> {
        let dir = StaticDirectory::new();
        dir.insert(
            garage,
            GarageRecord {
                profile: GarageProfile {
                    open_min: parse_hhmm("09:00").unwrap(),
                    close_min: parse_hhmm("18:00").unwrap(),
                    slot_len_min: 30,
                    utc_offset_min: 0,
                },
                mechanics,
                bays,
            },
        );
        Arc::new(dir)
    }

    fn future_date() -> NaiveDate {
        chrono::Utc::now().date_naive() + chrono::Duration::days(30)
    }

    struct Fixture {
        store: Arc<SlotStore>,
        arbiter: Arc<InMemoryArbiter>,
        coordinator: BookingCoordinator,
        garage: GarageId,
    }

    fn fixture(name: &str, mechanics: u32, bays: u32) -> Fixture {
        let garage = Ulid::new();
        let store = Arc::new(
            SlotStore::open(test_wal_path(name), directory_with(garage, mechanics, bays)).unwrap(),
        );
        let arbiter = Arc::new(InMemoryArbiter::new(Duration::from_secs(300)));
        let coordinator = BookingCoordinator::new(
            store.clone(),
            arbiter.clone(),
            Duration::from_secs(5),
        );
        Fixture {
            store,
            arbiter,
            coordinator,
            garage,
        }
    }

    fn request(garage: GarageId, date: NaiveDate, start: SlotId, minutes: u32) -> BookingRequest {
        BookingRequest {
            garage_id: garage,
            user_id: Ulid::new(),
            date,
            start_slot_id: start,
            total_duration_min: minutes,
            items: vec![ServiceItem {
                name: "Brake inspection".into(),
                duration_min: minutes,
            }],
        }
    }

    #[tokio::test]
    async fn books_three_contiguous_slots_for_75_minutes() {
        let f = fixture("consecutive_75.wal", 2, 2);
        let date = future_date();
        let slots = f.store.get_or_create_day_slots(f.garage, date).await.unwrap();

        let appt = f
            .coordinator
            .book(request(f.garage, date, slots[2].id, 75))
            .await
            .unwrap();

        assert_eq!(appt.slot_ids.len(), 3);
        assert_eq!(appt.start_min, slots[2].start_min);
        assert_eq!(appt.end_min, slots[4].end_min);

        // Exactly the chosen slots carry the increment.
        let after = f.store.day_slots(f.garage, date).await.unwrap();
        for (i, slot) in after.iter().enumerate() {
            let expected = if (2..=4).contains(&i) { 1 } else { 0 };
            assert_eq!(slot.booked, expected, "slot {i}");
        }

        // All holds released after the successful commit.
        for slot in &after {
            assert_eq!(f.arbiter.hold_count(slot.id), 0);
        }
    }

    #[tokio::test]
    async fn insufficient_consecutive_capacity_at_day_end() {
        let f = fixture("insufficient_tail.wal", 2, 2);
        let date = future_date();
        let slots = f.store.get_or_create_day_slots(f.garage, date).await.unwrap();

        // Second-to-last slot: only 60 minutes remain before closing.
        let start = slots[slots.len() - 2].id;
        let result = f.coordinator.book(request(f.garage, date, start, 75)).await;

        match result {
            Err(BookingError::InsufficientConsecutiveCapacity {
                needed_min,
                available_min,
            }) => {
                assert_eq!(needed_min, 75);
                assert_eq!(available_min, 60);
            }
            other => panic!("expected InsufficientConsecutiveCapacity, got {other:?}"),
        }

        // The walk failed before any hold was taken.
        for slot in &slots {
            assert_eq!(f.arbiter.hold_count(slot.id), 0);
        }
        let after = f.store.day_slots(f.garage, date).await.unwrap();
        assert!(after.iter().all(|s| s.booked == 0));
    }

    #[tokio::test]
    async fn no_double_booking_under_contention() {
        let f = fixture("contention.wal", 1, 1);
        let date = future_date();
        let slots = f.store.get_or_create_day_slots(f.garage, date).await.unwrap();
        let target = slots[0].id;

        let coordinator = Arc::new(f.coordinator);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let c = coordinator.clone();
            let garage = f.garage;
            tasks.push(tokio::spawn(async move {
                c.book(request(garage, date, target, 30)).await
            }));
        }

        let mut won = 0;
        let mut unavailable = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => won += 1,
                Err(BookingError::SlotUnavailable) => unavailable += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(unavailable, 7);

        let after = f.store.day_slots(f.garage, date).await.unwrap();
        assert_eq!(after[0].booked, 1);
        assert_eq!(f.arbiter.hold_count(target), 0);
    }

    /// Reports a hold count of zero no matter the real contention, forcing
    /// the attempt past the arbiter check so the commit-time re-validation
    /// has to do the rejecting.
    struct UnderReportingArbiter {
        inner: InMemoryArbiter,
    }

    #[async_trait]
    impl ReservationArbiter for UnderReportingArbiter {
        async fn hold(&self, slot_id: SlotId) -> Result<u32, ArbiterError> {
            self.inner.hold(slot_id).await?;
            Ok(0)
        }

        async fn release(&self, slot_id: SlotId) -> Result<(), ArbiterError> {
            self.inner.release(slot_id).await
        }
    }

    #[tokio::test]
    async fn holds_released_when_commit_rejects() {
        let garage = Ulid::new();
        let store = Arc::new(
            SlotStore::open(
                test_wal_path("commit_reject.wal"),
                directory_with(garage, 1, 1),
            )
            .unwrap(),
        );
        let arbiter = Arc::new(UnderReportingArbiter {
            inner: InMemoryArbiter::new(Duration::from_secs(300)),
        });
        let coordinator =
            BookingCoordinator::new(store.clone(), arbiter.clone(), Duration::from_secs(5));

        let date = future_date();
        let slots = store.get_or_create_day_slots(garage, date).await.unwrap();
        let target = slots[0].id;

        // Fill the slot through the store directly, bypassing the arbiter —
        // the coordinator's snapshot-plus-lying-arbiter will still pass its
        // pre-commit check.
        store
            .commit_booking(Appointment {
                id: Ulid::new(),
                garage_id: garage,
                user_id: Ulid::new(),
                date,
                slot_ids: vec![target],
                start_min: slots[0].start_min,
                end_min: slots[0].end_min,
                total_duration_min: 30,
                items: vec![],
                cancelled: false,
            })
            .await
            .unwrap();

        // Snapshot says booked=1, lying arbiter says holds=0, capacity=1 →
        // 1 + 0 > 1 is false, so the hold check passes and commit rejects.
        let result = coordinator.book(request(garage, date, target, 30)).await;
        assert!(matches!(result, Err(BookingError::SlotUnavailable)));

        // The cleanup path released the hold the attempt had taken.
        assert_eq!(arbiter.inner.hold_count(target), 0);
        let after = store.day_slots(garage, date).await.unwrap();
        assert_eq!(after[0].booked, 1);
    }

    /// Stalls before taking the hold, long enough to trip the attempt timeout.
    struct StalledArbiter {
        inner: InMemoryArbiter,
        delay: Duration,
    }

    #[async_trait]
    impl ReservationArbiter for StalledArbiter {
        async fn hold(&self, slot_id: SlotId) -> Result<u32, ArbiterError> {
            tokio::time::sleep(self.delay).await;
            self.inner.hold(slot_id).await
        }

        async fn release(&self, slot_id: SlotId) -> Result<(), ArbiterError> {
            self.inner.release(slot_id).await
        }
    }

    #[tokio::test]
    async fn attempt_timeout_bounds_a_stalled_hold() {
        let garage = Ulid::new();
        let store = Arc::new(
            SlotStore::open(test_wal_path("stalled.wal"), directory_with(garage, 1, 1)).unwrap(),
        );
        let arbiter = Arc::new(StalledArbiter {
            inner: InMemoryArbiter::new(Duration::from_secs(300)),
            delay: Duration::from_secs(2),
        });
        let coordinator =
            BookingCoordinator::new(store.clone(), arbiter.clone(), Duration::from_millis(100));

        let date = future_date();
        let slots = store.get_or_create_day_slots(garage, date).await.unwrap();

        let result = coordinator.book(request(garage, date, slots[0].id, 30)).await;
        assert!(matches!(result, Err(BookingError::AttemptTimeout)));
        assert_eq!(arbiter.inner.hold_count(slots[0].id), 0);
        let after = store.day_slots(garage, date).await.unwrap();
        assert!(after.iter().all(|s| s.booked == 0));
    }

    #[tokio::test]
    async fn gap_in_day_is_rejected_as_non_contiguous() {
        let f = fixture("gap_day.wal", 2, 2);
        let date = future_date();

        // Hand-build a day with a hole between the first two slots.
        let s1 = Slot {
            id: Ulid::new(),
            start_min: 540,
            end_min: 570,
            capacity: 2,
            booked: 0,
            released: true,
        };
        let s2 = Slot {
            id: Ulid::new(),
            start_min: 600,
            end_min: 630,
            capacity: 2,
            booked: 0,
            released: true,
        };
        let start = s1.id;
        assert!(f
            .store
            .install_day(DayState::new(f.garage, date, 30, vec![s1.clone(), s2.clone()])));

        let result = f.coordinator.book(request(f.garage, date, start, 60)).await;
        assert!(matches!(result, Err(BookingError::NonContiguousSlots)));
        assert_eq!(f.arbiter.hold_count(s1.id), 0);
        assert_eq!(f.arbiter.hold_count(s2.id), 0);
    }

    #[tokio::test]
    async fn unknown_start_slot_rejected() {
        let f = fixture("unknown_start.wal", 1, 1);
        let date = future_date();
        f.store.get_or_create_day_slots(f.garage, date).await.unwrap();

        let bogus = Ulid::new();
        let result = f.coordinator.book(request(f.garage, date, bogus, 30)).await;
        assert!(matches!(result, Err(BookingError::UnknownStartSlot(id)) if id == bogus));
    }

    #[tokio::test]
    async fn zero_duration_rejected_before_any_io() {
        let f = fixture("zero_duration.wal", 1, 1);
        let result = f
            .coordinator
            .book(request(f.garage, future_date(), Ulid::new(), 0))
            .await;
        assert!(matches!(result, Err(BookingError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn cancelled_slot_can_be_rebooked() {
        let f = fixture("cancel_rebook.wal", 1, 1);
        let date = future_date();
        let slots = f.store.get_or_create_day_slots(f.garage, date).await.unwrap();
        let target = slots[0].id;

        let appt = f
            .coordinator
            .book(request(f.garage, date, target, 30))
            .await
            .unwrap();
        assert!(matches!(
            f.coordinator.book(request(f.garage, date, target, 30)).await,
            Err(BookingError::SlotUnavailable)
        ));

        assert!(f.store.cancel_appointment(appt.id).await.unwrap());
        f.coordinator
            .book(request(f.garage, date, target, 30))
            .await
            .unwrap();
    }
}
