//! Tracer counters
//!
//! Everything the handlers and the consumer swallow is counted here so it
//! can be inspected after the fact.

use serde::Serialize;
use sockwatch_common::EventKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const KINDS: usize = EventKind::ALL.len();

/// Atomic counters shared by the producer and consumer sides
#[derive(Debug)]
pub struct TracerStats {
    start_time: Instant,
    published: [AtomicU64; KINDS],
    dropped: [AtomicU64; KINDS],
    received_by_kind: [AtomicU64; KINDS],
    /// Connect returns with no correlation entry
    pub unobserved_connects: AtomicU64,
    /// Connect returns with a non-zero return code
    pub failed_connects: AtomicU64,
    /// Records the consumer could not decode
    pub decode_errors: AtomicU64,
    /// Records decoded by the consumer, all kinds
    pub received: AtomicU64,
}

impl Default for TracerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TracerStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            published: Default::default(),
            dropped: Default::default(),
            received_by_kind: Default::default(),
            unobserved_connects: AtomicU64::new(0),
            failed_connects: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn record_published(&self, kind: EventKind) {
        self.published[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, kind: EventKind) {
        self.dropped[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Count a record the consumer decoded
    pub fn record_received(&self, kind: EventKind) {
        self.received_by_kind[kind as usize].fetch_add(1, Ordering::Relaxed);
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published(&self, kind: EventKind) -> u64 {
        self.published[kind as usize].load(Ordering::Relaxed)
    }

    pub fn dropped(&self, kind: EventKind) -> u64 {
        self.dropped[kind as usize].load(Ordering::Relaxed)
    }

    pub fn received_by(&self, kind: EventKind) -> u64 {
        self.received_by_kind[kind as usize].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let per_kind = EventKind::ALL
            .iter()
            .map(|kind| KindCounts {
                kind: kind.as_str(),
                published: self.published(*kind),
                dropped: self.dropped(*kind),
                received: self.received_by(*kind),
            })
            .collect();

        StatsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            per_kind,
            unobserved_connects: self.unobserved_connects.load(Ordering::Relaxed),
            failed_connects: self.failed_connects.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }

    /// Export counters in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP sockwatch_uptime_seconds Time since the tracer started\n");
        output.push_str("# TYPE sockwatch_uptime_seconds gauge\n");
        output.push_str(&format!(
            "sockwatch_uptime_seconds {}\n\n",
            snapshot.uptime_seconds
        ));

        output.push_str("# HELP sockwatch_events_published_total Records written to the event channel\n");
        output.push_str("# TYPE sockwatch_events_published_total counter\n");
        for counts in &snapshot.per_kind {
            output.push_str(&format!(
                "sockwatch_events_published_total{{kind=\"{}\"}} {}\n",
                counts.kind, counts.published
            ));
        }
        output.push('\n');

        output.push_str("# HELP sockwatch_events_dropped_total Records lost to a full event channel\n");
        output.push_str("# TYPE sockwatch_events_dropped_total counter\n");
        for counts in &snapshot.per_kind {
            output.push_str(&format!(
                "sockwatch_events_dropped_total{{kind=\"{}\"}} {}\n",
                counts.kind, counts.dropped
            ));
        }
        output.push('\n');

        output.push_str("# HELP sockwatch_connects_unobserved_total Connect returns without a recorded entry\n");
        output.push_str("# TYPE sockwatch_connects_unobserved_total counter\n");
        output.push_str(&format!(
            "sockwatch_connects_unobserved_total {}\n\n",
            snapshot.unobserved_connects
        ));

        output.push_str("# HELP sockwatch_connects_failed_total Connect calls that returned an error\n");
        output.push_str("# TYPE sockwatch_connects_failed_total counter\n");
        output.push_str(&format!(
            "sockwatch_connects_failed_total {}\n\n",
            snapshot.failed_connects
        ));

        output.push_str("# HELP sockwatch_decode_errors_total Records the consumer rejected\n");
        output.push_str("# TYPE sockwatch_decode_errors_total counter\n");
        output.push_str(&format!(
            "sockwatch_decode_errors_total {}\n\n",
            snapshot.decode_errors
        ));

        output.push_str("# HELP sockwatch_events_received_total Records decoded by the consumer\n");
        output.push_str("# TYPE sockwatch_events_received_total counter\n");
        for counts in &snapshot.per_kind {
            output.push_str(&format!(
                "sockwatch_events_received_total{{kind=\"{}\"}} {}\n",
                counts.kind, counts.received
            ));
        }

        output
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub kind: &'static str,
    pub published: u64,
    pub dropped: u64,
    pub received: u64,
}

/// Serializable copy of [`TracerStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub per_kind: Vec<KindCounts>,
    pub unobserved_connects: u64,
    pub failed_connects: u64,
    pub decode_errors: u64,
    pub received: u64,
}

impl StatsSnapshot {
    pub fn total_published(&self) -> u64 {
        self.per_kind.iter().map(|c| c.published).sum()
    }

    pub fn total_dropped(&self) -> u64 {
        self.per_kind.iter().map(|c| c.dropped).sum()
    }
}
