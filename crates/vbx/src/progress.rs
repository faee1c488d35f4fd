//! 📊 Progress for the CLI: a live bar while records flow, a summary table at the end.
//!
//! 🎬 *[the bar crawls. the table says 41,000 records/s. the server queue says otherwise.
//! the batch size drops to 60. the bar crawls slightly less.]*
//!
//! Rates use a 5 second sliding window so one slow batch doesn't make the numbers jump.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

use crate::results::BatchResults;
use crate::source::SourceStats;

const MIB: u64 = 1024 * 1024;
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 📦 Units follow the total, or the count itself when the total is unknown.
fn format_bytes(bytes: u64, total_size: u64) -> String {
    let scale = if total_size == 0 { bytes } else { total_size };
    if scale >= 512 * MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if scale >= MIB {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

/// 🔢 `1234567` -> `1,234,567`.
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ `MM:SS`, or `HH:MM:SS` once it's been a while.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

fn right(text: impl Into<String>) -> Cell {
    Cell::new(text.into()).set_alignment(CellAlignment::Right)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Rates {
    records_per_sec: f64,
    mib_per_sec: f64,
}

/// 🚂 What the engine looks like right now, for the panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineGauge {
    pub stored: u64,
    pub failed: u64,
    pub batch_size: usize,
    pub streams: usize,
}

/// 📊 Bytes and records read, plus an engine gauge, drawn on an indicatif bar.
pub struct ProgressMetrics {
    source_name: String,
    /// 📏 0 when unknown (stdin, gzip)
    total_size: u64,
    total_bytes: u64,
    total_records: u64,
    gauge: EngineGauge,
    progress_bar: ProgressBar,
    rate_samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressMetrics")
            .field("source_name", &self.source_name)
            .field("total_size", &self.total_size)
            .field("total_bytes", &self.total_bytes)
            .field("total_records", &self.total_records)
            .field("gauge", &self.gauge)
            .finish()
    }
}

impl ProgressMetrics {
    pub fn new(source_name: impl Into<String>, total_size: u64) -> Self {
        let progress_bar = if total_size > 0 {
            ProgressBar::new(total_size)
        } else {
            ProgressBar::new_spinner()
        };
        let template = if total_size > 0 {
            "{msg}\n| [{bar:40.cyan/blue}]"
        } else {
            "{msg}\n| {spinner:.cyan}"
        };
        progress_bar.set_style(
            ProgressStyle::default_bar()
                .template(template)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0u64, 0u64));
        Self {
            source_name: source_name.into(),
            total_size,
            total_bytes: 0,
            total_records: 0,
            gauge: EngineGauge::default(),
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 `bytes_read` and `records_read` are deltas since the last call.
    pub fn update(&mut self, bytes_read: u64, records_read: u64, gauge: EngineGauge) {
        self.total_bytes += bytes_read;
        self.total_records += records_read;
        self.gauge = gauge;
        let rates = self.calculate_rates(Instant::now());
        self.render(rates);
        if self.total_size > 0 {
            self.progress_bar.set_position(self.total_bytes);
        } else {
            self.progress_bar.tick();
        }
    }

    pub fn finish(&self) {
        self.progress_bar.finish_and_clear();
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    fn calculate_rates(&mut self, now: Instant) -> Rates {
        while let Some(&(timestamp, _, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > RATE_WINDOW {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples
            .push_back((now, self.total_bytes, self.total_records));

        let Some(&(oldest_time, oldest_bytes, oldest_records)) = self.rate_samples.front() else {
            return Rates::default();
        };
        let elapsed = now.duration_since(oldest_time).as_secs_f64();
        if elapsed <= 0.0 {
            return Rates::default();
        }
        Rates {
            records_per_sec: self.total_records.saturating_sub(oldest_records) as f64 / elapsed,
            mib_per_sec: (self.total_bytes.saturating_sub(oldest_bytes) as f64 / elapsed)
                / MIB as f64,
        }
    }

    fn percent(&self) -> Option<f64> {
        (self.total_size > 0)
            .then(|| (self.total_bytes as f64 / self.total_size as f64) * 100.0)
    }

    fn panel(&self, rates: Rates) -> Table {
        let elapsed = self.start_time.elapsed();
        let remaining = match self.percent() {
            Some(percent) if percent > 0.0 => {
                let remaining_secs =
                    elapsed.as_secs_f64() / (percent / 100.0) - elapsed.as_secs_f64();
                if remaining_secs > 0.0 {
                    format_duration(Duration::from_secs_f64(remaining_secs))
                } else {
                    "--:--".to_string()
                }
            }
            _ => "--:--".to_string(),
        };
        let bytes_progress = if self.total_size > 0 {
            format!(
                "{} / {}",
                format_bytes(self.total_bytes, self.total_size),
                format_bytes(self.total_size, self.total_size)
            )
        } else {
            format_bytes(self.total_bytes, 0)
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            right(format!("{} Records/s", format_number(rates.records_per_sec as u64))),
            right(format!("{} Records read", format_number(self.total_records))),
        ]);
        table.add_row(vec![
            right(format!("{:.2} MiB/s", rates.mib_per_sec)),
            right(bytes_progress),
        ]);
        table.add_row(vec![
            right(format!("{} stored", format_number(self.gauge.stored))),
            right(format!("{} failed", format_number(self.gauge.failed))),
        ]);
        table.add_row(vec![
            right(format!("batch size {}", self.gauge.batch_size)),
            right(format!("{} streams", self.gauge.streams)),
        ]);
        table.add_row(vec![
            right(format!("{} elapsed", format_duration(elapsed))),
            right(format!("{} remaining", remaining)),
        ]);
        table
    }

    fn render(&self, rates: Rates) {
        self.progress_bar
            .set_message(format!("source: {}\n{}", self.source_name, self.panel(rates)));
    }
}

/// 🏁 The end-of-run report.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestSummary {
    pub source: SourceStats,
    /// 🚫 Parsed fine, but failed validation.
    pub rejected: u64,
    pub objects_stored: u64,
    pub objects_failed: u64,
    pub references_stored: u64,
    pub references_failed: u64,
    /// 🔢 Lifetime terminal failures, including ones evicted from the results.
    pub errors: u64,
    /// ⏳ Vector indexing was waited for and caught up.
    pub indexed: bool,
    pub elapsed: Duration,
}

impl IngestSummary {
    pub fn new(
        source: SourceStats,
        rejected: u64,
        results: &BatchResults,
        errors: u64,
        indexed: bool,
        elapsed: Duration,
    ) -> Self {
        Self {
            source,
            rejected,
            objects_stored: results.objects.total_successes(),
            objects_failed: results.objects.total_failures(),
            references_stored: results.references.total_successes(),
            references_failed: results.references.total_failures(),
            errors,
            indexed,
            elapsed,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.errors > 0
    }

    pub fn table(&self) -> Table {
        let per_sec = {
            let secs = self.elapsed.as_secs_f64();
            if secs > 0.0 {
                ((self.objects_stored + self.references_stored) as f64 / secs) as u64
            } else {
                0
            }
        };
        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["", "stored", "failed"]);
        table.add_row(vec![
            Cell::new("objects"),
            right(format_number(self.objects_stored)),
            right(format_number(self.objects_failed)),
        ]);
        table.add_row(vec![
            Cell::new("references"),
            right(format_number(self.references_stored)),
            right(format_number(self.references_failed)),
        ]);
        table.add_row(vec![
            Cell::new("lines"),
            right(format!("{} parsed", format_number(self.source.parsed))),
            right(format!(
                "{} skipped",
                format_number(self.source.skipped + self.rejected)
            )),
        ]);
        table.add_row(vec![
            Cell::new("time"),
            right(format_duration(self.elapsed)),
            right(format!("{}/s", format_number(per_sec))),
        ]);
        table.add_row(vec![
            Cell::new("vector index"),
            right(if self.indexed { "caught up" } else { "not checked" }),
            right(""),
        ]);
        table
    }
}

impl fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * MIB;

    #[test]
    fn the_one_where_big_numbers_get_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn the_one_where_long_runs_show_hours() {
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
    }

    #[test]
    fn the_one_where_units_follow_the_total() {
        assert_eq!(format_bytes(512, 1_000), "512 bytes");
        assert_eq!(format_bytes(2048, 10 * MIB), "2.00 KiB");
        assert_eq!(format_bytes(MIB, GIB), "1.00 MiB");
        assert_eq!(format_bytes(3 * MIB, 0), "3072.00 KiB");
    }

    #[test]
    fn the_one_where_rates_come_from_the_window() {
        let mut metrics = ProgressMetrics::new("test", 0);
        let start = metrics.start_time;
        metrics.total_records = 500;
        metrics.total_bytes = 2 * MIB;
        let rates = metrics.calculate_rates(start + Duration::from_secs(2));
        assert_eq!(rates.records_per_sec, 250.0);
        assert_eq!(rates.mib_per_sec, 1.0);

        // -- the seed sample falls out of the window, the 2s one stays
        metrics.total_records = 1_500;
        let rates = metrics.calculate_rates(start + Duration::from_secs(6));
        assert_eq!(rates.records_per_sec, 250.0);
    }

    #[test]
    fn the_one_where_the_panel_shows_the_engine() {
        let mut metrics = ProgressMetrics::new("articles.ndjson", 1_000);
        metrics.update(
            100,
            10,
            EngineGauge {
                stored: 8,
                failed: 1,
                batch_size: 100,
                streams: 2,
            },
        );
        let panel = metrics.panel(Rates::default()).to_string();
        assert!(panel.contains("10 Records read"));
        assert!(panel.contains("8 stored"));
        assert!(panel.contains("2 streams"));
        assert_eq!(metrics.percent(), Some(10.0));
        metrics.finish();
    }

    #[test]
    fn the_one_where_the_summary_adds_up() {
        let summary = IngestSummary {
            source: SourceStats {
                lines: 12,
                bytes: 1_000,
                parsed: 10,
                skipped: 1,
            },
            rejected: 1,
            objects_stored: 7_000,
            objects_failed: 1,
            references_stored: 3_000,
            references_failed: 0,
            errors: 1,
            indexed: false,
            elapsed: Duration::from_secs(10),
        };
        assert!(summary.has_failures());
        let rendered = summary.to_string();
        assert!(rendered.contains("7,000"));
        assert!(rendered.contains("2 skipped"));
        assert!(rendered.contains("1,000/s"));
        assert!(rendered.contains("not checked"));
    }
}
