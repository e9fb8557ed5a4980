//! Per-request latency records and engine counters.
//!
//! Every completed request produces one CSV line on the metrics sink:
//!
//! ```text
//! processing_ns,response_ns
//! 81234,190022
//! ```
//!
//! `processing_ns` covers decode, transform and encode on the worker;
//! `response_ns` runs from the request header arriving to the last response
//! byte being handed to the kernel.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// CSV header written once per run.
pub const CSV_HEADER: &str = "processing_ns,response_ns";

/// Four monotonic timestamps of one request.
///
/// `received <= processing_start <= processing_finish <= sent`.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimings {
    pub received: Instant,
    pub processing_start: Instant,
    pub processing_finish: Instant,
    pub sent: Instant,
}

impl RequestTimings {
    pub fn processing(&self) -> Duration {
        self.processing_finish - self.processing_start
    }

    pub fn response(&self) -> Duration {
        self.sent - self.received
    }

    /// Whether the timestamps are in lifecycle order.
    #[cfg(test)]
    pub fn is_ordered(&self) -> bool {
        self.received <= self.processing_start
            && self.processing_start <= self.processing_finish
            && self.processing_finish <= self.sent
    }
}

/// Serialised CSV writer shared by all producers of one engine.
pub struct MetricsSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl MetricsSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Sink writing to standard output.
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Write the CSV header line.
    pub fn write_header(&self) {
        self.write_line(format_args!("{CSV_HEADER}"));
    }

    /// Write one line for a completed request.
    pub fn record(&self, timings: &RequestTimings) {
        self.write_line(format_args!(
            "{},{}",
            timings.processing().as_nanos(),
            timings.response().as_nanos()
        ));
    }

    fn write_line(&self, line: std::fmt::Arguments<'_>) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            warn!(error = %e, "Failed to write metrics line");
        }
    }
}

/// Cloneable in-memory writer, used to capture metrics output.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct SharedBuffer(std::sync::Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured output as text.
    pub fn contents(&self) -> String {
        let bytes = match self.0.lock() {
            Ok(bytes) => bytes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut bytes) => bytes.extend_from_slice(buf),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(buf),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Lock-free per-engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    accepted: AtomicU64,
    requests: AtomicU64,
    graceful_closes: AtomicU64,
    violations: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub requests: u64,
    pub graceful_closes: u64,
    pub violations: u64,
}

impl EngineStats {
    pub fn connection_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn graceful_close(&self) {
        self.graceful_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn violation(&self) {
        self.violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            graceful_closes: self.graceful_closes.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn timings(offsets_ns: [u64; 4]) -> RequestTimings {
        let base = Instant::now();
        let at = |ns| base + Duration::from_nanos(ns);
        RequestTimings {
            received: at(offsets_ns[0]),
            processing_start: at(offsets_ns[1]),
            processing_finish: at(offsets_ns[2]),
            sent: at(offsets_ns[3]),
        }
    }

    #[test]
    fn test_record_line() {
        let out = SharedBuffer::new();
        let sink = MetricsSink::new(Box::new(out.clone()));
        sink.write_header();
        sink.record(&timings([0, 100, 350, 1000]));

        assert_eq!(out.contents(), "processing_ns,response_ns\n250,1000\n");
    }

    #[test]
    fn test_ordering_check() {
        assert!(timings([0, 1, 2, 3]).is_ordered());
        assert!(timings([5, 5, 5, 5]).is_ordered());
        assert!(!timings([0, 2, 1, 3]).is_ordered());
    }

    #[test]
    fn test_concurrent_lines_not_interleaved() {
        let out = SharedBuffer::new();
        let sink = Arc::new(MetricsSink::new(Box::new(out.clone())));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    for _ in 0..100 {
                        sink.record(&timings([0, i, i * 2, 1_000 + i]));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = out.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 800);
        for line in lines {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 2, "malformed line {line:?}");
            assert!(fields.iter().all(|f| f.parse::<u64>().is_ok()));
        }
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = EngineStats::default();
        stats.connection_accepted();
        stats.request_completed();
        stats.request_completed();
        stats.violation();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                accepted: 1,
                requests: 2,
                graceful_closes: 0,
                violations: 1,
            }
        );
    }
}
