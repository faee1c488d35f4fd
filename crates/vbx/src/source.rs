//! 📂 NDJSON source: one JSON record per line, from a file, a `.gz` file or stdin.
//!
//! 🎬 *[a 40 GB dump file. gzipped, naturally. somewhere around line 3,141,592 there's a
//! line somebody edited by hand in vim. we log it, skip it, and keep going.]*
//!
//! Reading and decompression are blocking work, so they run on tokio's blocking pool and
//! hand parsed lines to the async side through a bounded channel. When the engine falls
//! behind, the channel fills and the reader thread waits. Newlines are found with
//! `memchr`, lines are parsed straight from the byte buffer, no `String` round trip.
//!
//! A line is a reference if it looks like one (`from_collection`, `from_uuid`,
//! `from_property`, `to`), otherwise an object.

use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::Context;
use flate2::read::MultiGzDecoder;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::app_config::{FileSourceConfig, SourceConfig};
use crate::records::{NewObject, NewReference};

const READ_BUFFER: usize = 1024 * 1024;
const STDIN_LINE_BUFFER: usize = 1024;

/// 📄 What one NDJSON line turns into.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum IngestLine {
    Reference(NewReference),
    Object(NewObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine {
    /// 🔢 1-based, counting blank and malformed lines too.
    pub line_number: u64,
    /// 📏 Bytes consumed since the previous `SourceLine`, skipped lines included.
    pub bytes: u64,
    pub record: IngestLine,
}

/// 📊 Totals once the reader is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub lines: u64,
    pub bytes: u64,
    pub parsed: u64,
    pub skipped: u64,
}

pub struct NdjsonSource {
    name: String,
    total_size: u64,
    line_buffer: usize,
    reader: Box<dyn BufRead + Send>,
}

impl std::fmt::Debug for NdjsonSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdjsonSource")
            .field("name", &self.name)
            .field("total_size", &self.total_size)
            .field("line_buffer", &self.line_buffer)
            .finish()
    }
}

impl NdjsonSource {
    pub fn open(config: &SourceConfig) -> anyhow::Result<Self> {
        match config {
            SourceConfig::File(file) => Self::open_file(file),
            SourceConfig::Stdin => Ok(Self::from_reader(
                "stdin",
                0,
                BufReader::with_capacity(READ_BUFFER, std::io::stdin()),
                STDIN_LINE_BUFFER,
            )),
        }
    }

    fn open_file(config: &FileSourceConfig) -> anyhow::Result<Self> {
        let file = File::open(&config.file_name).with_context(|| {
            format!(
                "💀 could not open source file '{}'. Check the path, and whether it's relative to where you ran this from",
                config.file_name
            )
        })?;
        // -- 0 means unknown: a gzip's size on disk says nothing about what we'll read
        let total_size = if config.is_gzip() {
            0
        } else {
            file.metadata().map(|meta| meta.len()).unwrap_or(0)
        };
        let reader: Box<dyn BufRead + Send> = if config.is_gzip() {
            let decoder = MultiGzDecoder::new(BufReader::new(file));
            Box::new(BufReader::with_capacity(READ_BUFFER, decoder))
        } else {
            Box::new(BufReader::with_capacity(READ_BUFFER, file))
        };
        debug!(
            "📂 opened {} (gzip: {}, {} bytes on disk)",
            config.file_name,
            config.is_gzip(),
            total_size
        );
        Ok(Self {
            name: config.file_name.clone(),
            total_size,
            line_buffer: config.line_buffer.max(1),
            reader,
        })
    }

    pub fn from_reader(
        name: impl Into<String>,
        total_size: u64,
        reader: impl BufRead + Send + 'static,
        line_buffer: usize,
    ) -> Self {
        Self {
            name: name.into(),
            total_size,
            line_buffer: line_buffer.max(1),
            reader: Box::new(reader),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 📏 Uncompressed size when we know it, 0 when we don't.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 🧵 Start reading on the blocking pool. Dropping the receiver stops the reader at the
    /// next line.
    pub fn spawn(
        self,
    ) -> (
        async_channel::Receiver<SourceLine>,
        JoinHandle<anyhow::Result<SourceStats>>,
    ) {
        let (lines, receiver) = async_channel::bounded(self.line_buffer);
        let name = self.name;
        let reader = self.reader;
        let handle = tokio::task::spawn_blocking(move || {
            read_lines(reader, &lines)
                .with_context(|| format!("💀 reading NDJSON from {name} failed"))
        });
        (receiver, handle)
    }
}

struct LineReader<'a> {
    lines: &'a async_channel::Sender<SourceLine>,
    stats: SourceStats,
    unreported_bytes: u64,
}

impl LineReader<'_> {
    /// ➡️ Parse and forward one raw line. `false` once nobody is listening any more.
    fn emit(&mut self, raw: &[u8], consumed: u64) -> bool {
        self.stats.lines += 1;
        self.stats.bytes += consumed;
        self.unreported_bytes += consumed;
        let line = raw.trim_ascii();
        if line.is_empty() {
            return true;
        }
        match serde_json::from_slice::<IngestLine>(line) {
            Ok(record) => {
                self.stats.parsed += 1;
                let line = SourceLine {
                    line_number: self.stats.lines,
                    bytes: std::mem::take(&mut self.unreported_bytes),
                    record,
                };
                self.lines.send_blocking(line).is_ok()
            }
            Err(err) => {
                self.stats.skipped += 1;
                warn!("⚠️ skipping line {}: {}", self.stats.lines, err);
                true
            }
        }
    }
}

fn read_lines(
    mut reader: Box<dyn BufRead + Send>,
    lines: &async_channel::Sender<SourceLine>,
) -> anyhow::Result<SourceStats> {
    let mut line_reader = LineReader {
        lines,
        stats: SourceStats::default(),
        unreported_bytes: 0,
    };
    let mut partial: Vec<u8> = Vec::new();
    loop {
        let buffer = reader.fill_buf().context("💀 read from the source failed")?;
        if buffer.is_empty() {
            break;
        }
        let Some(newline) = memchr::memchr(b'\n', buffer) else {
            partial.extend_from_slice(buffer);
            let consumed = buffer.len();
            reader.consume(consumed);
            continue;
        };
        let keep_going = if partial.is_empty() {
            line_reader.emit(&buffer[..newline], newline as u64 + 1)
        } else {
            partial.extend_from_slice(&buffer[..newline]);
            let consumed = partial.len() as u64 + 1;
            let keep_going = line_reader.emit(&partial, consumed);
            partial.clear();
            keep_going
        };
        reader.consume(newline + 1);
        if !keep_going {
            debug!("📪 nobody is reading lines any more, stopping the source early");
            return Ok(line_reader.stats);
        }
    }
    if !partial.is_empty() {
        let consumed = partial.len() as u64;
        line_reader.emit(&partial, consumed);
    }
    debug!(
        "📖 source done: {} lines, {} parsed, {} skipped",
        line_reader.stats.lines, line_reader.stats.parsed, line_reader.stats.skipped
    );
    Ok(line_reader.stats)
}
