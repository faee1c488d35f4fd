//! 🧾 Results: the ledger of who made it and who didn't.
//!
//! Every record that reaches a final outcome lands in exactly one map, keyed by its
//! insertion index. The maps are bounded (oldest index evicted first) so an
//! hours-long import doesn't slowly turn into a memory leak with extra steps. The
//! lifetime counters are kept on the side, so eviction never makes the totals lie.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::records::{InsertionIndex, PendingObject, PendingReference, Shard};

/// 💀 A record the server refused, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord<R> {
    pub message: String,
    pub record: R,
    pub retries: u32,
}

/// 📒 Successes and failures for one record kind.
#[derive(Debug, Clone)]
pub struct BatchResult<Id, R> {
    pub successes: BTreeMap<InsertionIndex, Id>,
    pub failures: BTreeMap<InsertionIndex, ErrorRecord<R>>,
    pub elapsed: Duration,
    pub has_errors: bool,
    total_successes: u64,
    total_failures: u64,
    max_history: usize,
}

pub type ObjectResults = BatchResult<Uuid, PendingObject>;
pub type ReferenceResults = BatchResult<String, PendingReference>;

impl<Id, R> BatchResult<Id, R> {
    pub fn new(max_history: usize) -> Self {
        Self {
            successes: BTreeMap::new(),
            failures: BTreeMap::new(),
            elapsed: Duration::ZERO,
            has_errors: false,
            total_successes: 0,
            total_failures: 0,
            max_history: max_history.max(1),
        }
    }

    pub fn record_success(&mut self, index: InsertionIndex, id: Id) {
        self.failures.remove(&index);
        self.successes.insert(index, id);
        self.total_successes += 1;
        while self.successes.len() > self.max_history {
            self.successes.pop_first();
        }
    }

    pub fn record_failure(&mut self, index: InsertionIndex, error: ErrorRecord<R>) {
        self.successes.remove(&index);
        self.failures.insert(index, error);
        self.total_failures += 1;
        // -- sticky: evicting the evidence doesn't un-fail the batch
        self.has_errors = true;
        while self.failures.len() > self.max_history {
            self.failures.pop_first();
        }
    }

    /// 🔢 Successes over the whole lifetime, evicted entries included.
    pub fn total_successes(&self) -> u64 {
        self.total_successes
    }

    /// 🔢 Failures over the whole lifetime, evicted entries included.
    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    /// 🧹 Hand the current failures to a retry and forget them.
    pub(crate) fn take_failures(&mut self) -> BTreeMap<InsertionIndex, ErrorRecord<R>> {
        std::mem::take(&mut self.failures)
    }
}

/// 📸 A point-in-time copy of everything the aggregator knows.
#[derive(Debug, Clone)]
pub struct BatchResults {
    pub objects: ObjectResults,
    pub references: ReferenceResults,
}

impl BatchResults {
    pub fn has_errors(&self) -> bool {
        self.objects.has_errors || self.references.has_errors
    }
}

#[derive(Debug)]
struct AggregatorState {
    objects: ObjectResults,
    references: ReferenceResults,
    shards: BTreeSet<Shard>,
}

/// 🧮 Thread-safe home for both ledgers and the touched shard set.
#[derive(Debug)]
pub struct ResultAggregator {
    started: Instant,
    state: Mutex<AggregatorState>,
}

impl ResultAggregator {
    pub fn new(max_history: usize) -> Self {
        Self {
            started: Instant::now(),
            state: Mutex::new(AggregatorState {
                objects: BatchResult::new(max_history),
                references: BatchResult::new(max_history),
                shards: BTreeSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn touch_shard(&self, shard: Shard) {
        self.lock().shards.insert(shard);
    }

    pub fn object_succeeded(&self, object: &PendingObject) {
        self.lock().objects.record_success(object.index, object.uuid);
    }

    pub fn object_failed(&self, object: PendingObject, message: String) {
        let index = object.index;
        let retries = object.retries;
        self.lock().objects.record_failure(
            index,
            ErrorRecord {
                message,
                record: object,
                retries,
            },
        );
    }

    pub fn reference_succeeded(&self, reference: &PendingReference) {
        self.lock()
            .references
            .record_success(reference.index, reference.beacon());
    }

    pub fn reference_failed(&self, reference: PendingReference, message: String) {
        let index = reference.index;
        let retries = reference.retries;
        self.lock().references.record_failure(
            index,
            ErrorRecord {
                message,
                record: reference,
                retries,
            },
        );
    }

    pub fn snapshot(&self) -> BatchResults {
        let elapsed = self.started.elapsed();
        let state = self.lock();
        let mut objects = state.objects.clone();
        let mut references = state.references.clone();
        objects.elapsed = elapsed;
        references.elapsed = elapsed;
        BatchResults {
            objects,
            references,
        }
    }

    pub fn failed_objects(&self) -> Vec<ErrorRecord<PendingObject>> {
        self.lock().objects.failures.values().cloned().collect()
    }

    pub fn failed_references(&self) -> Vec<ErrorRecord<PendingReference>> {
        self.lock().references.failures.values().cloned().collect()
    }

    pub fn number_errors(&self) -> u64 {
        let state = self.lock();
        state.objects.total_failures() + state.references.total_failures()
    }

    /// 🔢 Lifetime successes across both kinds, without copying the maps.
    pub fn number_successes(&self) -> u64 {
        let state = self.lock();
        state.objects.total_successes() + state.references.total_successes()
    }

    pub fn touched_shards(&self) -> Vec<Shard> {
        self.lock().shards.iter().cloned().collect()
    }

    pub(crate) fn take_failed_objects(&self) -> Vec<ErrorRecord<PendingObject>> {
        self.lock().objects.take_failures().into_values().collect()
    }

    pub(crate) fn take_failed_references(&self) -> Vec<ErrorRecord<PendingReference>> {
        self.lock().references.take_failures().into_values().collect()
    }
}
