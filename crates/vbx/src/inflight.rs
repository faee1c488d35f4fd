//! ✈️ In-flight bookkeeping: everything that left the building and hasn't come home.
//!
//! - `cache`: sent records by insertion index, waiting for a result. This is what gets
//!   replayed after a reconnect.
//! - `by_uuid` / `by_beacon`: correlation from what the server echoes back to indices.
//!   Duplicate keys queue up FIFO, the oldest send is resolved first.
//! - `unacked`: sent but not yet acknowledged. Its size is the back-pressure signal.
//! - `exclusion`: objects added but not acknowledged. References touching them wait.
//!   Counted per UUID, so a duplicate still queued keeps blocking after its twin's ack.
//!
//! One mutex guards all of it, so "popped from the queue" and "registered as in flight"
//! happen as a single step and nobody can catch a record in between.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::protocol::Target;
use crate::queue::RecordQueue;
use crate::records::{InsertionIndex, Record};

#[derive(Debug, Default)]
struct InFlightState {
    cache: BTreeMap<InsertionIndex, Record>,
    by_uuid: HashMap<Uuid, VecDeque<InsertionIndex>>,
    by_beacon: HashMap<String, VecDeque<InsertionIndex>>,
    unacked: HashSet<InsertionIndex>,
    exclusion: HashSet<Uuid>,
    blockers: HashMap<Uuid, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// ✅ Final outcome, the object no longer blocks references.
    Resolved,
    /// ⏪ Going back to the queue, so it keeps blocking.
    Requeued,
}

#[derive(Debug, Default)]
pub(crate) struct InFlight {
    state: Mutex<InFlightState>,
    changed: Notify,
}

impl InFlightState {
    /// 🚧 One more copy of `uuid` is waiting to be acked.
    fn block(&mut self, uuid: Uuid) {
        *self.blockers.entry(uuid).or_default() += 1;
        self.exclusion.insert(uuid);
    }

    /// 🔓 One copy of `uuid` was acked or settled. The last one lifts the block.
    fn unblock(&mut self, uuid: &Uuid) {
        let Some(count) = self.blockers.get_mut(uuid) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.blockers.remove(uuid);
            self.exclusion.remove(uuid);
        }
    }

    fn register(&mut self, record: &Record) {
        let index = record.index();
        match record {
            Record::Object(object) => self.by_uuid.entry(object.uuid).or_default().push_back(index),
            Record::Reference(reference) => self
                .by_beacon
                .entry(reference.beacon())
                .or_default()
                .push_back(index),
        }
        self.unacked.insert(index);
        self.cache.insert(index, record.clone());
    }

    fn indices_of(&mut self, target: &Target) -> Option<&mut VecDeque<InsertionIndex>> {
        match target {
            Target::Uuid(uuid) => {
                let uuid = Uuid::parse_str(uuid).ok()?;
                self.by_uuid.get_mut(&uuid)
            }
            Target::Beacon(beacon) => self.by_beacon.get_mut(beacon),
        }
    }

    fn forget_correlation(&mut self, record: &Record) {
        let index = record.index();
        match record {
            Record::Object(object) => {
                if let Some(indices) = self.by_uuid.get_mut(&object.uuid) {
                    indices.retain(|i| *i != index);
                    if indices.is_empty() {
                        self.by_uuid.remove(&object.uuid);
                    }
                }
            }
            Record::Reference(reference) => {
                let beacon = reference.beacon();
                if let Some(indices) = self.by_beacon.get_mut(&beacon) {
                    indices.retain(|i| *i != index);
                    if indices.is_empty() {
                        self.by_beacon.remove(&beacon);
                    }
                }
            }
        }
    }

    fn remove_index(&mut self, index: InsertionIndex, release: Release) -> Option<Record> {
        let record = self.cache.remove(&index)?;
        let was_unacked = self.unacked.remove(&index);
        self.forget_correlation(&record);
        if let Record::Object(object) = &record {
            match release {
                Release::Resolved if was_unacked => self.unblock(&object.uuid),
                // -- acked copies stopped blocking, back in the queue they block again
                Release::Requeued if !was_unacked => self.block(object.uuid),
                _ => {}
            }
        }
        Some(record)
    }
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InFlightState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 🚧 An object was added: references to it wait until the server acks it.
    pub(crate) fn exclude(&self, uuid: Uuid) {
        self.lock().block(uuid);
    }

    /// 🔓 The object got a final verdict without an ack. Its references may go.
    pub(crate) fn release(&self, uuid: &Uuid) {
        self.lock().unblock(uuid);
    }

    /// 📤 Pop a batch honouring the exclusion set and register it, atomically.
    pub(crate) fn pop_and_register(&self, queue: &RecordQueue, max: usize) -> Vec<Record> {
        let mut state = self.lock();
        let batch = queue.pop_batch(max, &state.exclusion);
        for record in &batch {
            state.register(record);
        }
        batch
    }

    /// 📬 The server accepted the record into its queue. Returns false for strangers.
    pub(crate) fn acknowledge(&self, target: &Target) -> bool {
        let mut state = self.lock();
        let acked = {
            let InFlightState {
                by_uuid,
                by_beacon,
                unacked,
                ..
            } = &mut *state;
            let indices = match target {
                Target::Uuid(uuid) => Uuid::parse_str(uuid).ok().and_then(|uuid| by_uuid.get(&uuid)),
                Target::Beacon(beacon) => by_beacon.get(beacon),
            };
            indices
                .and_then(|indices| indices.iter().copied().find(|index| unacked.contains(index)))
                .map(|index| unacked.remove(&index))
                .unwrap_or(false)
        };
        if let (true, Target::Uuid(uuid)) = (acked, target) {
            if let Ok(uuid) = Uuid::parse_str(uuid) {
                state.unblock(&uuid);
            }
        }
        drop(state);
        if acked {
            self.changed.notify_waiters();
        }
        acked
    }

    /// 🎯 Take the oldest in-flight record for `target` out of the cache.
    pub(crate) fn take(&self, target: &Target, release: Release) -> Option<Record> {
        let mut state = self.lock();
        let index = state.indices_of(target)?.front().copied()?;
        let record = state.remove_index(index, release);
        drop(state);
        self.changed.notify_waiters();
        record
    }

    /// ⏪ Pull specific indices back out (a send that never made it onto the wire).
    pub(crate) fn take_indices(&self, indices: &[InsertionIndex]) -> Vec<Record> {
        let mut state = self.lock();
        let taken: Vec<Record> = indices
            .iter()
            .filter_map(|index| state.remove_index(*index, Release::Requeued))
            .collect();
        drop(state);
        self.changed.notify_waiters();
        taken
    }

    /// 🔁 Everything still cached, in insertion order, for replay on a fresh connection.
    /// Replayed objects go back into the exclusion set until they are acked again.
    pub(crate) fn drain_for_replay(&self) -> Vec<Record> {
        let mut state = self.lock();
        let cache = std::mem::take(&mut state.cache);
        state.by_uuid.clear();
        state.by_beacon.clear();
        let unacked = std::mem::take(&mut state.unacked);
        for record in cache.values() {
            if let Record::Object(object) = record {
                if !unacked.contains(&record.index()) {
                    state.block(object.uuid);
                }
            }
        }
        drop(state);
        self.changed.notify_waiters();
        cache.into_values().collect()
    }

    pub(crate) fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().cache.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().cache.is_empty()
    }

    pub(crate) fn is_excluded(&self, uuid: &Uuid) -> bool {
        self.lock().exclusion.contains(uuid)
    }

    /// ⏰ Sleep until something is acked or resolved, or `timeout` passes.
    pub(crate) async fn wait_for_change(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.changed.notified()).await;
    }
}
