//! Shared statistics struct every driver owns one of.
//!
//! Grounded in PETRA's `engine.rs::EngineStats`/`Engine` (atomic counters plus
//! `Arc<RwLock<...>>` for the parts that aren't plain integers) and
//! `mqtt.rs::MqttStatistics` for the protocol-specific map shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// EWMA response-time summary. `avg_ms` uses alpha = 0.1: on the first
/// sample `avg = sample`, thereafter `avg ← avg*0.9 + sample*0.1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseTimeStats {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    #[serde(skip)]
    samples: u64,
}

impl Default for ResponseTimeStats {
    fn default() -> Self {
        Self {
            avg_ms: 0.0,
            min_ms: f64::MAX,
            max_ms: 0.0,
            samples: 0,
        }
    }
}

impl ResponseTimeStats {
    const ALPHA: f64 = 0.1;

    fn record(&mut self, sample_ms: f64) {
        self.avg_ms = if self.samples == 0 {
            sample_ms
        } else {
            self.avg_ms * (1.0 - Self::ALPHA) + sample_ms * Self::ALPHA
        };
        self.min_ms = self.min_ms.min(sample_ms);
        self.max_ms = self.max_ms.max(sample_ms);
        self.samples += 1;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsTimestamps {
    pub start: Option<DateTime<Utc>>,
    pub last_read: Option<DateTime<Utc>>,
    pub last_write: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_connection: Option<DateTime<Utc>>,
}

/// A point-in-time snapshot of a driver's counters, suitable for serialization into a
/// diagnostic JSON payload. The live `Statistics` handle is not `Serialize` directly
/// because of its atomics; callers call `snapshot()` first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub total_reads: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub total_writes: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub consecutive_failures: u64,
    pub uptime_seconds: u64,
    pub success_rate: f64,
    pub response_time: ResponseTimeStats,
    pub timestamps: StatsTimestamps,
    pub counters: HashMap<String, u64>,
    pub metrics: HashMap<String, f64>,
    pub status: HashMap<String, String>,
}

/// Atomic-counter statistics struct shared by every driver. Counters are lock-free;
/// the protocol-specific maps are guarded by a single mutex since writes to them are
/// rare.
pub struct Statistics {
    total_reads: Arc<AtomicU64>,
    successful_reads: Arc<AtomicU64>,
    failed_reads: Arc<AtomicU64>,
    total_writes: Arc<AtomicU64>,
    successful_writes: Arc<AtomicU64>,
    failed_writes: Arc<AtomicU64>,
    successful_connections: Arc<AtomicU64>,
    failed_connections: Arc<AtomicU64>,
    consecutive_failures: Arc<AtomicU64>,
    response_time: Arc<Mutex<ResponseTimeStats>>,
    timestamps: Arc<Mutex<StatsTimestamps>>,
    counters: Arc<Mutex<HashMap<String, u64>>>,
    metrics: Arc<Mutex<HashMap<String, f64>>>,
    status: Arc<Mutex<HashMap<String, String>>>,
}

impl Clone for Statistics {
    fn clone(&self) -> Self {
        Self {
            total_reads: self.total_reads.clone(),
            successful_reads: self.successful_reads.clone(),
            failed_reads: self.failed_reads.clone(),
            total_writes: self.total_writes.clone(),
            successful_writes: self.successful_writes.clone(),
            failed_writes: self.failed_writes.clone(),
            successful_connections: self.successful_connections.clone(),
            failed_connections: self.failed_connections.clone(),
            consecutive_failures: self.consecutive_failures.clone(),
            response_time: self.response_time.clone(),
            timestamps: self.timestamps.clone(),
            counters: self.counters.clone(),
            metrics: self.metrics.clone(),
            status: self.status.clone(),
        }
    }
}

impl Statistics {
    pub fn new() -> Self {
        let stats = Self {
            total_reads: Arc::new(AtomicU64::new(0)),
            successful_reads: Arc::new(AtomicU64::new(0)),
            failed_reads: Arc::new(AtomicU64::new(0)),
            total_writes: Arc::new(AtomicU64::new(0)),
            successful_writes: Arc::new(AtomicU64::new(0)),
            failed_writes: Arc::new(AtomicU64::new(0)),
            successful_connections: Arc::new(AtomicU64::new(0)),
            failed_connections: Arc::new(AtomicU64::new(0)),
            consecutive_failures: Arc::new(AtomicU64::new(0)),
            response_time: Arc::new(Mutex::new(ResponseTimeStats::default())),
            timestamps: Arc::new(Mutex::new(StatsTimestamps::default())),
            counters: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(Mutex::new(HashMap::new())),
            status: Arc::new(Mutex::new(HashMap::new())),
        };
        stats.timestamps.lock().unwrap().start = Some(Utc::now());
        stats
    }

    /// Pre-registers protocol-specific counter keys at zero so readers can poll
    /// without lock contention on insertion.
    pub fn with_counter_keys(self, keys: &[&str]) -> Self {
        let mut counters = self.counters.lock().unwrap();
        for key in keys {
            counters.entry((*key).to_string()).or_insert(0);
        }
        drop(counters);
        self
    }

    pub fn record_read(&self, success: bool) {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        let mut ts = self.timestamps.lock().unwrap();
        ts.last_read = Some(Utc::now());
        if success {
            self.successful_reads.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            ts.last_success = Some(Utc::now());
        } else {
            self.failed_reads.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            ts.last_error = Some(Utc::now());
        }
    }

    pub fn record_write(&self, success: bool) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
        let mut ts = self.timestamps.lock().unwrap();
        ts.last_write = Some(Utc::now());
        if success {
            self.successful_writes.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            ts.last_success = Some(Utc::now());
        } else {
            self.failed_writes.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            ts.last_error = Some(Utc::now());
        }
    }

    pub fn record_connection(&self, success: bool) {
        let mut ts = self.timestamps.lock().unwrap();
        ts.last_connection = Some(Utc::now());
        if success {
            self.successful_connections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_response_time(&self, sample_ms: f64) {
        self.response_time.lock().unwrap().record(sample_ms);
    }

    pub fn increment_counter(&self, key: &str) {
        *self.counters.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn set_metric(&self, key: &str, value: f64) {
        self.metrics.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn set_status(&self, key: &str, value: impl Into<String>) {
        self.status.lock().unwrap().insert(key.to_string(), value.into());
    }

    /// `successful_ops / total_ops * 100.0`; `100.0` when total is zero, which keeps
    /// a freshly-reset driver reporting a healthy rate rather than 0%.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_reads.load(Ordering::Relaxed) + self.total_writes.load(Ordering::Relaxed);
        if total == 0 {
            return 100.0;
        }
        let successful = self.successful_reads.load(Ordering::Relaxed) + self.successful_writes.load(Ordering::Relaxed);
        successful as f64 / total as f64 * 100.0
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        let start = self.timestamps.lock().unwrap().start;
        match start {
            Some(start) => (Utc::now() - start).num_seconds().max(0) as u64,
            None => 0,
        }
    }

    /// Zeroes all counters and resets start-time to now. Does not clear the
    /// caller-visible `last_error` record (that lives on the driver).
    ///
    /// Takes `&self`: every field is internally shared (atomics, mutexes), so resetting
    /// a cloned handle is visible to every other clone, matching `Statistics`' role as
    /// a live handle into driver-owned counters.
    pub fn reset(&self) {
        self.total_reads.store(0, Ordering::Relaxed);
        self.successful_reads.store(0, Ordering::Relaxed);
        self.failed_reads.store(0, Ordering::Relaxed);
        self.total_writes.store(0, Ordering::Relaxed);
        self.successful_writes.store(0, Ordering::Relaxed);
        self.failed_writes.store(0, Ordering::Relaxed);
        self.successful_connections.store(0, Ordering::Relaxed);
        self.failed_connections.store(0, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.response_time.lock().unwrap() = ResponseTimeStats::default();
        let mut ts = self.timestamps.lock().unwrap();
        *ts = StatsTimestamps::default();
        ts.start = Some(Utc::now());
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let total_reads = self.total_reads.load(Ordering::Relaxed);
        let total_writes = self.total_writes.load(Ordering::Relaxed);
        StatisticsSnapshot {
            total_reads,
            successful_reads: self.successful_reads.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            total_writes,
            successful_writes: self.successful_writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            total_operations: total_reads + total_writes,
            successful_operations: self.successful_reads.load(Ordering::Relaxed)
                + self.successful_writes.load(Ordering::Relaxed),
            failed_operations: self.failed_reads.load(Ordering::Relaxed) + self.failed_writes.load(Ordering::Relaxed),
            successful_connections: self.successful_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
            success_rate: self.success_rate(),
            response_time: self.response_time.lock().unwrap().clone(),
            timestamps: self.timestamps.lock().unwrap().clone(),
            counters: self.counters.lock().unwrap().clone(),
            metrics: self.metrics.lock().unwrap().clone(),
            status: self.status.lock().unwrap().clone(),
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn success_rate_is_100_at_zero_operations() {
        let stats = Statistics::new();
        assert_eq!(stats.success_rate(), 100.0);
    }

    #[test]
    fn success_rate_tracks_reads_and_writes() {
        let stats = Statistics::new();
        stats.record_read(true);
        stats.record_read(false);
        assert_eq!(stats.success_rate(), 50.0);
    }

    #[test]
    fn ewma_sets_avg_to_first_sample() {
        let stats = Statistics::new();
        stats.record_response_time(20.0);
        assert_eq!(stats.snapshot().response_time.avg_ms, 20.0);
        stats.record_response_time(40.0);
        let snap = stats.snapshot();
        assert!((snap.response_time.avg_ms - 22.0).abs() < 1e-9);
    }

    #[test]
    fn reset_zeroes_counters_but_preserves_new_start() {
        let mut stats = Statistics::new();
        stats.record_read(true);
        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.total_reads, 0);
        assert_eq!(snap.success_rate, 100.0);
    }

    #[test]
    fn counters_preregister_at_zero() {
        let stats = Statistics::new().with_counter_keys(&["register_reads", "coil_reads"]);
        let snap = stats.snapshot();
        assert_eq!(snap.counters.get("register_reads"), Some(&0));
        assert_eq!(snap.counters.get("coil_reads"), Some(&0));
    }

    #[test]
    fn total_reads_equals_successful_plus_failed() {
        let stats = Statistics::new();
        stats.record_read(true);
        stats.record_read(true);
        stats.record_read(false);
        let snap = stats.snapshot();
        assert_eq!(snap.total_reads, snap.successful_reads + snap.failed_reads);
    }

    proptest! {
        #[test]
        fn success_rate_stays_in_0_to_100_for_any_outcome_sequence(outcomes: Vec<bool>) {
            let stats = Statistics::new();
            for (i, ok) in outcomes.iter().enumerate() {
                if i % 2 == 0 {
                    stats.record_read(*ok);
                } else {
                    stats.record_write(*ok);
                }
            }
            let rate = stats.success_rate();
            prop_assert!((0.0..=100.0).contains(&rate));

            let snap = stats.snapshot();
            prop_assert_eq!(snap.total_reads, snap.successful_reads + snap.failed_reads);
            prop_assert_eq!(snap.total_writes, snap.successful_writes + snap.failed_writes);
        }

        #[test]
        fn ewma_response_time_never_exceeds_the_sample_range(samples in proptest::collection::vec(0.0f64..10_000.0, 1..50)) {
            let stats = Statistics::new();
            let (mut lo, mut hi) = (f64::MAX, f64::MIN);
            for s in &samples {
                stats.record_response_time(*s);
                lo = lo.min(*s);
                hi = hi.max(*s);
            }
            let avg = stats.snapshot().response_time.avg_ms;
            prop_assert!(avg >= lo - 1e-9 && avg <= hi + 1e-9);
        }
    }
}
