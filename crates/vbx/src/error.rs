//! 💀 Errors: the taxonomy of things that go bump in the night.
//!
//! 🎬 *[a record is added. it has a collection name of "123 Main St". nobody is surprised.]*
//!
//! Inside the crate we mostly speak `anyhow` (I/O, config, the CLI). The caller-facing
//! engine surface speaks [`BatchError`] instead, because callers need to tell a bad record
//! apart from a stream that has died for good. Partial failures are NOT errors here: a
//! record the server rejects is data in the results, not a reason to panic. 🦆

use std::time::Duration;

use thiserror::Error;

/// 💀 Everything the batch engine can throw back at its caller.
///
/// `Clone` because a background failure is stored once and then raised on every
/// caller operation that follows. Misery loves company.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatchError {
    /// 🚫 The record never made it into a queue. Fix it and try again. We won't retry it for you.
    #[error("💀 invalid record: {0}")]
    Validation(String),

    /// 🔌 We knocked on the stream's door until our knuckles bled.
    #[error("💀 could not re-establish the batch stream after {attempts} attempts, last error: {last_error}")]
    StreamReestablish { attempts: u32, last_error: String },

    /// 🧠 The server stayed out of memory longer than we were willing to wait.
    #[error("💀 the server reported out-of-memory and did not recover within {0:?}")]
    OutOfMemoryTimeout(Duration),

    /// 📡 The stream failed in a way a reconnect cannot fix.
    #[error("💀 the batch stream failed: {0}")]
    Transport(String),

    /// ⏳ Shards never reached READY with an empty vector queue.
    #[error("💀 waiting for vector indexing failed: {0}")]
    Readiness(String),

    /// 🚪 The batch has already been closed. The party is over. Go home.
    #[error("💀 the batch is closed")]
    Closed,
}

/// 📡 Stream-level failures, split by what we can do about them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// 🔌 Socket closed, connection reset, stream RST, idle timeout. Reconnect and carry on.
    #[error("stream hung up: {0}")]
    HangUp(String),
    /// 💀 Anything else. No amount of reconnecting fixes a rejected credential.
    #[error("stream failed: {0}")]
    Fatal(String),
}

impl TransportError {
    /// ✅ Hang-ups are handed to the reconnection manager, everything else is fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::HangUp(_))
    }

    /// 🕵️ Sniff an error message for the usual hang-up suspects.
    ///
    /// Used for transports that report everything as "unknown" or "internal" and leave
    /// the real story in the message text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if looks_like_hang_up(&message) {
            TransportError::HangUp(message)
        } else {
            TransportError::Fatal(message)
        }
    }
}

// -- 🔍 the lineup. lowercase, because shouting doesn't make the socket come back.
const HANG_UP_MARKERS: &[&str] = &[
    "connection reset",
    "connection closed",
    "connection refused",
    "broken pipe",
    "socket closed",
    "rst_stream",
    "stream reset",
    "h2 protocol error",
    "transport error",
    "stream no longer needed",
];

fn looks_like_hang_up(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    HANG_UP_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// 🌐 Failures from the unary REST side (nodes, shards, reference batches).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusterError {
    /// 🔄 Network hiccup, timeout, 5xx or 429. Worth another try.
    #[error("transient cluster error: {0}")]
    Transient(String),
    /// 🚫 The server understood us and said no.
    #[error("cluster rejected the request with {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl ClusterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_a_reset_connection_is_just_a_hang_up() {
        let err = TransportError::from_message("h2 protocol error: stream reset by peer");
        assert!(err.is_recoverable());
        let err = TransportError::from_message("Connection reset by peer (os error 104)");
        assert!(err.is_recoverable(), "case should not matter");
    }

    #[test]
    fn the_one_where_bad_credentials_are_not_a_hang_up() {
        let err = TransportError::from_message("unauthenticated: invalid api key");
        assert!(!err.is_recoverable());
        assert!(matches!(err, TransportError::Fatal(_)));
    }

    #[test]
    fn the_one_where_cluster_errors_know_if_they_are_worth_retrying() {
        assert!(ClusterError::Transient("timeout".into()).is_transient());
        assert!(
            !ClusterError::Rejected {
                status: 404,
                body: "no such collection".into()
            }
            .is_transient()
        );
    }
}
