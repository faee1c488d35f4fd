//! 📏 Framing: pack entries into `Data` messages that respect the size budget.
//!
//! An entry that would push the current message over the budget starts a new one.
//! A single entry bigger than the whole budget travels alone, and the server gets to
//! decide what it thinks of that.

use prost::Message;

use crate::protocol::{BatchStreamRequest, Data, Entry};
use crate::records::Record;

/// 📦 Tag byte plus the worst-case length prefix of `Data` inside `BatchStreamRequest`.
const ENVELOPE_OVERHEAD: usize = 1 + 10;

fn entry_cost(entry: &Entry) -> usize {
    let len = match entry {
        Entry::Object(object) => object.encoded_len(),
        Entry::Reference(reference) => reference.encoded_len(),
    };
    // -- field tag + length delimiter + body, the same arithmetic prost does for repeated messages
    1 + prost::length_delimiter_len(len) + len
}

/// 🧱 Split `entries` into budget-sized `Data` messages, preserving order.
pub fn frame_entries(
    entries: impl IntoIterator<Item = Entry>,
    max_message_bytes: usize,
) -> Vec<Data> {
    let budget = max_message_bytes.saturating_sub(ENVELOPE_OVERHEAD).max(1);
    let mut frames = Vec::new();
    let mut current = Data::default();
    let mut current_size = 0usize;

    for entry in entries {
        let cost = entry_cost(&entry);
        let current_is_empty = current.objects.is_empty() && current.references.is_empty();
        if !current_is_empty && current_size + cost > budget {
            frames.push(std::mem::take(&mut current));
            current_size = 0;
        }
        match entry {
            Entry::Object(object) => current.objects.push(object),
            Entry::Reference(reference) => current.references.push(reference),
        }
        current_size += cost;
    }

    if !current.objects.is_empty() || !current.references.is_empty() {
        frames.push(current);
    }
    frames
}

/// 📨 Records straight to ready-to-send stream requests.
pub fn frame_records(records: &[Record], max_message_bytes: usize) -> Vec<BatchStreamRequest> {
    frame_entries(records.iter().map(Entry::from), max_message_bytes)
        .into_iter()
        .map(BatchStreamRequest::data)
        .collect()
}
