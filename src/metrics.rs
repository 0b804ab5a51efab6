/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Counters, gauges, and a latency histogram describing the traffic of one session.
//!
//! Counters are plain atomics, so recording never blocks message handling for longer than one
//! `fetch_add`. Only the latency histogram sits behind a mutex.

use std::{
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use crate::messages::MessageKind;

const KINDS: usize = MessageKind::ALL.len();

/// Traffic metrics of one session. Shared between the session's threads behind an `Arc`.
#[derive(Debug)]
pub struct MetricsRecorder {
    messages_sent: AtomicU64,
    payload_bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    payload_bytes_received: AtomicU64,
    sent_by_kind: [AtomicU64; KINDS],
    received_by_kind: [AtomicU64; KINDS],
    throttled: AtomicU64,
    dropped_invalid: AtomicU64,
    serialization_errors: AtomicU64,
    active_locks: AtomicU64,
    pending_requests: AtomicU64,
    known_peers: AtomicU64,
    latency: Mutex<LatencyHistogram>,
    started_at: Instant,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            payload_bytes_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            payload_bytes_received: AtomicU64::new(0),
            sent_by_kind: Default::default(),
            received_by_kind: Default::default(),
            throttled: AtomicU64::new(0),
            dropped_invalid: AtomicU64::new(0),
            serialization_errors: AtomicU64::new(0),
            active_locks: AtomicU64::new(0),
            pending_requests: AtomicU64::new(0),
            known_peers: AtomicU64::new(0),
            latency: Mutex::new(LatencyHistogram::new()),
            started_at: Instant::now(),
        }
    }

    /// Records a message handed to the transport.
    pub fn record_sent(&self, kind: MessageKind, payload_bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.payload_bytes_sent
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
        self.sent_by_kind[kind.tag() as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Records a message received from the transport, whether or not it was then accepted.
    pub fn record_received(&self, kind: MessageKind, payload_bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.payload_bytes_received
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
        self.received_by_kind[kind.tag() as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an inbound message dropped because it failed to decode or validate.
    pub fn record_dropped_invalid(&self) {
        self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an outbound message dropped because its payload could not be built.
    pub fn record_serialization_error(&self) {
        self.serialization_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the delay between a message being stamped by its sender and it being handled here.
    pub fn record_latency(&self, latency: Duration) {
        self.latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(latency);
    }

    pub fn set_lock_gauges(&self, active_locks: usize, pending_requests: usize) {
        self.active_locks
            .store(active_locks as u64, Ordering::Relaxed);
        self.pending_requests
            .store(pending_requests as u64, Ordering::Relaxed);
    }

    pub fn set_known_peers(&self, known_peers: usize) {
        self.known_peers.store(known_peers as u64, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let mut sent_by_kind = [0; KINDS];
        let mut received_by_kind = [0; KINDS];
        for i in 0..KINDS {
            sent_by_kind[i] = load(&self.sent_by_kind[i]);
            received_by_kind[i] = load(&self.received_by_kind[i]);
        }
        let latency = self
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .summary();

        MetricsSnapshot {
            messages_sent: load(&self.messages_sent),
            payload_bytes_sent: load(&self.payload_bytes_sent),
            messages_received: load(&self.messages_received),
            payload_bytes_received: load(&self.payload_bytes_received),
            sent_by_kind,
            received_by_kind,
            throttled: load(&self.throttled),
            dropped_invalid: load(&self.dropped_invalid),
            serialization_errors: load(&self.serialization_errors),
            active_locks: load(&self.active_locks),
            pending_requests: load(&self.pending_requests),
            known_peers: load(&self.known_peers),
            latency,
            uptime: self.started_at.elapsed(),
        }
    }

    /// A multi-line, human-readable summary of the current metrics.
    pub fn report(&self) -> String {
        self.snapshot().to_string()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of a [`MetricsRecorder`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub payload_bytes_sent: u64,
    pub messages_received: u64,
    pub payload_bytes_received: u64,
    /// Indexed by [`MessageKind::tag`].
    pub sent_by_kind: [u64; KINDS],
    /// Indexed by [`MessageKind::tag`].
    pub received_by_kind: [u64; KINDS],
    pub throttled: u64,
    pub dropped_invalid: u64,
    pub serialization_errors: u64,
    pub active_locks: u64,
    pub pending_requests: u64,
    pub known_peers: u64,
    pub latency: LatencySummary,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    pub fn sent(&self, kind: MessageKind) -> u64 {
        self.sent_by_kind[kind.tag() as usize]
    }

    pub fn received(&self, kind: MessageKind) -> u64 {
        self.received_by_kind[kind.tag() as usize]
    }
}

impl Display for MetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session uptime: {:.1} s", self.uptime.as_secs_f64())?;
        writeln!(
            f,
            "Sent: {} messages, {} payload bytes",
            self.messages_sent, self.payload_bytes_sent
        )?;
        writeln!(
            f,
            "Received: {} messages, {} payload bytes",
            self.messages_received, self.payload_bytes_received
        )?;
        for kind in MessageKind::ALL {
            writeln!(
                f,
                "  {}: {} sent, {} received",
                kind,
                self.sent(kind),
                self.received(kind)
            )?;
        }
        writeln!(
            f,
            "Throttled: {}, dropped invalid: {}, serialization errors: {}",
            self.throttled, self.dropped_invalid, self.serialization_errors
        )?;
        writeln!(
            f,
            "Active locks: {}, pending requests: {}, known peers: {}",
            self.active_locks, self.pending_requests, self.known_peers
        )?;
        write!(
            f,
            "Latency over {} samples: avg {:.2} ms, max {:.2} ms, p50 {:.2} ms, p95 {:.2} ms, p99 {:.2} ms",
            self.latency.samples,
            self.latency.average_ms,
            self.latency.max_ms,
            self.latency.p50_ms,
            self.latency.p95_ms,
            self.latency.p99_ms
        )
    }
}

/// Fixed-size ring buffer of the most recent latency samples.
#[derive(Clone, Debug)]
pub struct LatencyHistogram {
    /// Samples in microseconds.
    samples: Box<[u64; Self::CAPACITY]>,
    cursor: usize,
    count: u64,
}

impl LatencyHistogram {
    pub const CAPACITY: usize = 100;

    pub fn new() -> Self {
        Self {
            samples: Box::new([0; Self::CAPACITY]),
            cursor: 0,
            count: 0,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples[self.cursor] = micros;
        self.cursor = (self.cursor + 1) % Self::CAPACITY;
        self.count += 1;
    }

    /// Number of samples held, at most [`CAPACITY`](Self::CAPACITY).
    pub fn len(&self) -> usize {
        if self.count >= Self::CAPACITY as u64 {
            Self::CAPACITY
        } else {
            self.count as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn summary(&self) -> LatencySummary {
        let n = self.len();
        if n == 0 {
            return LatencySummary::default();
        }
        let mut sorted: Vec<u64> = self.samples[..n].to_vec();
        sorted.sort_unstable();
        let percentile = |p: f64| {
            let idx = ((p * (n as f64 - 1.0)).ceil() as usize).min(n - 1);
            micros_to_ms(sorted[idx])
        };
        let total: u128 = sorted.iter().map(|micros| *micros as u128).sum();

        LatencySummary {
            samples: n,
            average_ms: total as f64 / n as f64 / 1000.0,
            max_ms: micros_to_ms(sorted[n - 1]),
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            p99_ms: percentile(0.99),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

fn micros_to_ms(micros: u64) -> f64 {
    micros as f64 / 1000.0
}

/// Statistics over the samples of a [`LatencyHistogram`], in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LatencySummary {
    pub samples: usize,
    pub average_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[test]
fn latency_histogram_keeps_last_hundred_samples_test() {
    let mut histogram = LatencyHistogram::new();
    assert!(histogram.is_empty());
    assert_eq!(histogram.summary(), LatencySummary::default());

    // 1 ms to 150 ms; only 51 ms to 150 ms are kept.
    for ms in 1..=150 {
        histogram.record(Duration::from_millis(ms));
    }
    let summary = histogram.summary();
    assert_eq!(summary.samples, 100);
    assert_eq!(summary.max_ms, 150.0);
    assert_eq!(summary.average_ms, 100.5);
    assert_eq!(summary.p50_ms, 101.0);
    assert_eq!(summary.p99_ms, 150.0);
}

#[test]
fn recorder_counts_by_kind_test() {
    let metrics = MetricsRecorder::new();
    metrics.record_sent(MessageKind::LockRequest, 120);
    metrics.record_sent(MessageKind::WirePreview, 40);
    metrics.record_received(MessageKind::LockRelease, 90);
    metrics.record_throttled();
    metrics.record_dropped_invalid();
    metrics.set_lock_gauges(3, 2);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.messages_sent, 2);
    assert_eq!(snapshot.payload_bytes_sent, 160);
    assert_eq!(snapshot.sent(MessageKind::LockRequest), 1);
    assert_eq!(snapshot.received(MessageKind::LockRelease), 1);
    assert_eq!(snapshot.throttled, 1);
    assert_eq!(snapshot.dropped_invalid, 1);
    assert_eq!(snapshot.active_locks, 3);
    assert!(metrics.report().contains("LockRequest: 1 sent, 0 received"));
}
