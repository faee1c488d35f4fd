//! 🧵 Dispatch: the workers that keep records moving while callers go about their day.
//!
//! 🎬 *[one worker sends. one worker listens. one worker stares at the server's queue
//! statistics every second like it's a stock ticker.]*
//!
//! - [`sender::SenderWorker`] pops batches, frames them and puts them on the wire.
//! - [`receiver::ReceiverWorker`] reacts to everything the server says back.
//! - [`ticker::AdmissionTicker`] feeds node statistics into the admission controller.
//!
//! The workers share nothing but the engine's [`EngineShared`](crate::engine::EngineShared)
//! and the [`SendGate`] below, which is the sender's single answer to "may I send?".
//! Workers are private to the engine. Nobody outside spawns them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::BatchError;

pub(crate) mod receiver;
pub(crate) mod sender;
pub(crate) mod ticker;

/// 🏗️ A background worker. `start` hands it to the runtime and gives back the handle
/// the engine joins on close.
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Result<(), BatchError>>;
}

/// 🚦 Everything that can stop the sender, in one place.
#[derive(Debug)]
pub(crate) struct SendGate {
    awaiting_started: AtomicBool,
    shutting_down: AtomicBool,
    reconnecting: AtomicBool,
    oom_since: Mutex<Option<Instant>>,
    cooldown_until: Mutex<Option<Instant>>,
}

impl Default for SendGate {
    fn default() -> Self {
        Self {
            // -- nothing goes out before the first Started
            awaiting_started: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            oom_since: Mutex::new(None),
            cooldown_until: Mutex::new(None),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SendGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// ✅ Started, not paused, not reconnecting, not cooling down.
    pub(crate) fn is_open(&self) -> bool {
        !self.awaiting_started.load(Ordering::SeqCst)
            && !self.shutting_down.load(Ordering::SeqCst)
            && !self.reconnecting.load(Ordering::SeqCst)
            && lock(&self.oom_since).is_none()
            && lock(&self.cooldown_until).is_none_or(|until| Instant::now() >= until)
    }

    pub(crate) fn mark_started(&self) {
        self.awaiting_started.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_awaiting_started(&self) {
        self.awaiting_started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_shutting_down(&self, shutting_down: bool) {
        self.shutting_down.store(shutting_down, Ordering::SeqCst);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn set_reconnecting(&self, reconnecting: bool) {
        self.reconnecting.store(reconnecting, Ordering::SeqCst);
    }

    /// 🧠 Start the OOM clock. A second report while paused keeps the original start.
    pub(crate) fn enter_oom(&self) {
        lock(&self.oom_since).get_or_insert_with(Instant::now);
    }

    pub(crate) fn clear_oom(&self) {
        if lock(&self.oom_since).take().is_some() {
            debug!("🧠 out-of-memory pause lifted");
        }
    }

    /// ⏱️ How long the server has been out of memory, if it is.
    pub(crate) fn oom_elapsed(&self) -> Option<Duration> {
        lock(&self.oom_since).map(|since| since.elapsed())
    }

    /// 🧊 Hold every send for `duration`. Overlapping cooldowns keep the later end.
    pub(crate) fn cool_down(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut cooldown = lock(&self.cooldown_until);
        if cooldown.is_none_or(|current| current < until) {
            *cooldown = Some(until);
        }
    }
}
