mod booking;
mod error;
mod queries;
pub mod slots;

pub use error::StoreError;
pub use slots::plan_day_slots;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, warn};

use crate::directory::GarageDirectory;
use crate::model::{Appointment, AppointmentId, DayKey, DayState, Event, SlotId};
use crate::wal::Wal;

pub type SharedDayState = Arc<RwLock<DayState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Durable store for day slot sets and appointments.
///
/// In-memory state (a `RwLock`-guarded record per day) backed by an
/// append-only WAL. The day write lock is the transaction scope: an
/// appointment record and its slot increments land in one composite WAL
/// event applied under that lock, so the two are durable together or not
/// at all.
pub struct SlotStore {
    days: DashMap<DayKey, SharedDayState>,
    /// Reverse lookup: slot id → owning (garage, date).
    slot_days: DashMap<SlotId, DayKey>,
    appointments: DashMap<AppointmentId, Appointment>,
    /// Per-key creation locks: concurrent materializers of one day serialize
    /// here so exactly one DayMaterialized record reaches the WAL per day.
    creating: DashMap<DayKey, Arc<tokio::sync::Mutex<()>>>,
    /// Mutators hold this shared, compaction holds it exclusive, so the
    /// compacted snapshot and the log can never get out of step. Always
    /// acquired before any day lock.
    compaction_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub(crate) directory: Arc<dyn GarageDirectory>,
}

impl SlotStore {
    pub fn open(wal_path: PathBuf, directory: Arc<dyn GarageDirectory>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            days: DashMap::new(),
            slot_days: DashMap::new(),
            appointments: DashMap::new(),
            creating: DashMap::new(),
            compaction_gate: RwLock::new(()),
            wal_tx,
            directory,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because open()
        // may run inside an async context.
        for event in events {
            store.replay_event(event);
        }

        Ok(store)
    }

    fn replay_event(&self, event: Event) {
        match event {
            Event::DayMaterialized {
                garage_id,
                date,
                slot_len_min,
                slots,
            } => {
                // Insert-if-absent: a record appended by the loser of a
                // materialization race is inert on replay too.
                self.install_day(DayState::new(garage_id, date, slot_len_min, slots));
            }
            Event::AppointmentBooked { record } => {
                let key = (record.garage_id, record.date);
                match self.day(&key) {
                    Some(day) => {
                        let mut guard = day.try_write().expect("replay: uncontended write");
                        apply_increment(&mut guard, &record.slot_ids);
                    }
                    None => error!(
                        "replay: appointment {} references unmaterialized day {:?}",
                        record.id, key
                    ),
                }
                self.appointments.insert(record.id, record);
            }
            Event::AppointmentCancelled { id } => {
                let Some(record) = self.appointments.get(&id).map(|r| r.value().clone()) else {
                    warn!("replay: cancellation of unknown appointment {id}");
                    return;
                };
                if record.cancelled {
                    return;
                }
                if let Some(day) = self.day(&(record.garage_id, record.date)) {
                    let mut guard = day.try_write().expect("replay: uncontended write");
                    apply_decrement(&mut guard, &record.slot_ids);
                }
                if let Some(mut r) = self.appointments.get_mut(&id) {
                    r.cancelled = true;
                }
            }
            Event::AppointmentRestored { record } => {
                // Compaction snapshot already carries the booked counts.
                self.appointments.insert(record.id, record);
            }
        }
    }

    /// Insert a day first-write-wins. Returns false (and indexes nothing)
    /// when another writer already owns the key.
    pub(crate) fn install_day(&self, day: DayState) -> bool {
        let key = (day.garage_id, day.date);
        match self.days.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                for slot in &day.slots {
                    self.slot_days.insert(slot.id, key);
                }
                v.insert(Arc::new(RwLock::new(day)));
                true
            }
        }
    }

    pub fn day(&self, key: &DayKey) -> Option<SharedDayState> {
        self.days.get(key).map(|e| e.value().clone())
    }

    pub fn day_key_for_slot(&self, slot_id: SlotId) -> Option<DayKey> {
        self.slot_days.get(&slot_id).map(|e| *e.value())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(crate) async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// Rewrite the WAL as day snapshots (current booked counts) plus restored
    /// records for live appointments. Cancelled appointments are dropped.
    pub async fn compact_log(&self) -> Result<(), StoreError> {
        // Exclusive gate: no mutator is mid-append while the snapshot is
        // gathered and swapped in, so nothing appended can be lost.
        let _gate = self.compaction_gate.write().await;

        let mut events = Vec::new();
        let keys: Vec<DayKey> = self.days.iter().map(|e| *e.key()).collect();

        for key in keys {
            let Some(day) = self.day(&key) else { continue };
            let guard = day.read().await;
            events.push(Event::DayMaterialized {
                garage_id: guard.garage_id,
                date: guard.date,
                slot_len_min: guard.slot_len_min,
                slots: guard.slots.clone(),
            });
            // Gathered under the day's lock so the snapshot counts and the
            // appointment set stay consistent with each other.
            for entry in self.appointments.iter() {
                let r = entry.value();
                if r.garage_id == key.0 && r.date == key.1 && !r.cancelled {
                    events.push(Event::AppointmentRestored { record: r.clone() });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Increment booked on each slot. A missing id is a programming error:
/// logged at error level, that id skipped.
pub(crate) fn apply_increment(day: &mut DayState, slot_ids: &[SlotId]) {
    for &id in slot_ids {
        match day.slot_mut(id) {
            Some(slot) => slot.booked += 1,
            None => error!(
                "increment for unknown slot {id} on garage {} {}",
                day.garage_id, day.date
            ),
        }
    }
}

/// Decrement booked on each slot, flooring at zero with a warning — an
/// underflow attempt means a double release slipped past the cancelled flag.
pub(crate) fn apply_decrement(day: &mut DayState, slot_ids: &[SlotId]) {
    for &id in slot_ids {
        match day.slot_mut(id) {
            Some(slot) if slot.booked > 0 => slot.booked -= 1,
            Some(_) => warn!(
                "release below zero attempted for slot {id} on garage {} {}",
                day.garage_id, day.date
            ),
            None => error!(
                "decrement for unknown slot {id} on garage {} {}",
                day.garage_id, day.date
            ),
        }
    }
}
