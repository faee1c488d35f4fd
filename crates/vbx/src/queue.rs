//! 🚶 The record queue. Many callers push, one sender pops, nobody cuts in line
//! (except retries, which get to go to the front because they've suffered enough).

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::records::Record;

/// 📥 FIFO of records waiting for the sender.
///
/// The lock is a plain `std::sync::Mutex`: every critical section is a handful of
/// pointer shuffles and none of them cross an `.await`.
#[derive(Debug, Default)]
pub struct RecordQueue {
    inner: Mutex<VecDeque<Record>>,
    arrived: Notify,
}

impl RecordQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Record>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// ➕ Append one record at the back.
    pub fn add(&self, record: Record) {
        self.lock().push_back(record);
        self.arrived.notify_one();
    }

    /// ➕ Append several records at the back, keeping them contiguous.
    pub fn extend(&self, records: impl IntoIterator<Item = Record>) {
        self.lock().extend(records);
        self.arrived.notify_one();
    }

    /// 📤 Take up to `max` records in order, leaving references that are still waiting on
    /// an unacknowledged object exactly where they were.
    pub fn pop_batch(&self, max: usize, exclusion: &HashSet<Uuid>) -> Vec<Record> {
        let mut queue = self.lock();
        let mut taken = Vec::with_capacity(max.min(queue.len()));
        let mut held_back = VecDeque::new();
        while taken.len() < max {
            let Some(record) = queue.pop_front() else {
                break;
            };
            if record.is_blocked_by(exclusion) {
                held_back.push_back(record);
            } else {
                taken.push(record);
            }
        }
        // -- held-back records were in front of whatever is left, so they go back in front
        held_back.append(&mut queue);
        *queue = held_back;
        taken
    }

    /// ⏪ Put records back at the front. They're sorted by insertion index first, so a
    /// replay pulled out of a hash map still comes back in submission order.
    pub fn prepend(&self, mut records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        records.sort_by_key(Record::index);
        let mut queue = self.lock();
        for record in records.into_iter().rev() {
            queue.push_front(record);
        }
        drop(queue);
        self.arrived.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// ⏰ Wait until something is added or `timeout` passes, whichever comes first.
    ///
    /// `notify_one` stores a permit, so an add that lands between the caller's length
    /// check and this call still wakes it.
    pub async fn wait_for_records(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.arrived.notified()).await;
    }
}
