//! MQTT multi-broker failover and load-balancing, layered on top of the MQTT driver.
//!
//! The backoff shape is grounded in `src/mqtt.rs::ReconnectStrategy`, generalized here
//! to multi-broker selection. The event history uses a fixed-capacity deque with FIFO
//! eviction rather than an unbounded history buffer.

use std::collections::VecDeque;
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};

const DEFAULT_RING_BUFFER_SIZE: usize = 100;
const DEFAULT_LOAD_IMBALANCE_THRESHOLD: f64 = 0.30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_response_time_ms: f64,
    pub is_available: bool,
    pub consecutive_failures: u32,
}

impl Default for BrokerStats {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            avg_response_time_ms: 0.0,
            is_available: true,
            consecutive_failures: 0,
        }
    }
}

impl BrokerStats {
    fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 100.0;
        }
        self.success_count as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broker {
    pub url: String,
    pub name: String,
    pub priority: u32,
    #[serde(default)]
    pub stats: BrokerStats,
}

/// Exponential backoff with optional uniform jitter:
/// `delay(n) = min(initial_delay * multiplier^(n-1), max_delay)`, ±25% jitter.
/// `max_attempts = -1` means unbounded.
#[derive(Debug, Clone)]
pub struct ReconnectStrategy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    pub max_attempts: i32,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
            max_attempts: -1,
        }
    }
}

impl ReconnectStrategy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts < 0 || (attempt as i32) < self.max_attempts
    }

    /// Delay before attempt `n` (1-indexed), with uniform jitter in `±25%` when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay_ms as f64);
        if !self.jitter {
            return capped as u64;
        }
        let jitter_fraction = rand::thread_rng().gen_range(-0.25..=0.25);
        (capped * (1.0 + jitter_fraction)).max(0.0) as u64
    }
}

/// Round-robin / weighted / least-loaded / response-time-weighted / topic-hash
/// selection for multi-broker publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalanceAlgorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastLoaded,
    ResponseTimeWeighted,
    HashTopic,
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub topic_pattern: String,
    pub broker_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

const CONSECUTIVE_PUBLISH_FAILURE_THRESHOLD: u32 = 3;
const CONSECUTIVE_HEALTH_FAILURE_THRESHOLD: u32 = 3;

/// Owns the broker list, reconnect strategy, and bounded failover-event history for a
/// multi-broker MQTT deployment.
pub struct FailoverManager {
    brokers: Mutex<Vec<Broker>>,
    current: Mutex<Option<String>>,
    reconnect: ReconnectStrategy,
    algorithm: LoadBalanceAlgorithm,
    routing_rules: Mutex<Vec<RoutingRule>>,
    events: Mutex<VecDeque<FailoverEvent>>,
    round_robin_cursor: Mutex<usize>,
    consecutive_publish_failures: Mutex<u32>,
}

impl FailoverManager {
    pub fn new(brokers: Vec<Broker>, reconnect: ReconnectStrategy, algorithm: LoadBalanceAlgorithm) -> Self {
        let current = brokers.first().map(|b| b.name.clone());
        Self {
            brokers: Mutex::new(brokers),
            current: Mutex::new(current),
            reconnect,
            algorithm,
            routing_rules: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::with_capacity(DEFAULT_RING_BUFFER_SIZE)),
            round_robin_cursor: Mutex::new(0),
            consecutive_publish_failures: Mutex::new(0),
        }
    }

    pub fn add_routing_rule(&self, rule: RoutingRule) {
        self.routing_rules.lock().unwrap().push(rule);
    }

    /// Lowest `priority` wins; ties broken by highest recent success rate, then by
    /// lowest `avg_response_time_ms`.
    pub fn select_primary(&self, exclude: Option<&str>) -> Option<String> {
        let brokers = self.brokers.lock().unwrap();
        brokers
            .iter()
            .filter(|b| b.stats.is_available)
            .filter(|b| exclude.map(|ex| ex != b.name).unwrap_or(true))
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.stats.success_rate().partial_cmp(&a.stats.success_rate()).unwrap())
                    .then_with(|| a.stats.avg_response_time_ms.partial_cmp(&b.stats.avg_response_time_ms).unwrap())
            })
            .map(|b| b.name.clone())
    }

    /// Selects a broker for publishing `topic` under the configured load-balancing
    /// algorithm, honoring any matching `RoutingRule` override first.
    pub fn select_for_publish(&self, topic: &str) -> Option<String> {
        let rules = self.routing_rules.lock().unwrap();
        for rule in rules.iter() {
            if crate::drivers::mqtt::topic_matches(&rule.topic_pattern, topic) {
                if let Some(name) = rule.broker_names.first() {
                    return Some(name.clone());
                }
            }
        }
        drop(rules);

        let brokers = self.brokers.lock().unwrap();
        let available: Vec<&Broker> = brokers.iter().filter(|b| b.stats.is_available).collect();
        if available.is_empty() {
            return None;
        }

        match self.algorithm {
            LoadBalanceAlgorithm::RoundRobin => {
                let mut cursor = self.round_robin_cursor.lock().unwrap();
                let chosen = available[*cursor % available.len()].name.clone();
                *cursor = (*cursor + 1) % available.len();
                Some(chosen)
            }
            LoadBalanceAlgorithm::WeightedRoundRobin => available
                .iter()
                .min_by_key(|b| b.priority)
                .map(|b| b.name.clone()),
            LoadBalanceAlgorithm::LeastLoaded => available
                .iter()
                .min_by_key(|b| b.stats.success_count + b.stats.failure_count)
                .map(|b| b.name.clone()),
            LoadBalanceAlgorithm::ResponseTimeWeighted => available
                .iter()
                .min_by(|a, b| a.stats.avg_response_time_ms.partial_cmp(&b.stats.avg_response_time_ms).unwrap())
                .map(|b| b.name.clone()),
            LoadBalanceAlgorithm::HashTopic => {
                let mut hash: u64 = 0xcbf29ce484222325;
                for byte in topic.bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(0x100000001b3);
                }
                Some(available[(hash as usize) % available.len()].name.clone())
            }
        }
    }

    /// Records a publish outcome; triggers failover after
    /// `CONSECUTIVE_PUBLISH_FAILURE_THRESHOLD` consecutive failures.
    pub fn record_publish_result(&self, broker_name: &str, success: bool, response_time_ms: f64) -> bool {
        let mut brokers = self.brokers.lock().unwrap();
        if let Some(broker) = brokers.iter_mut().find(|b| b.name == broker_name) {
            if success {
                broker.stats.success_count += 1;
                broker.stats.avg_response_time_ms = broker.stats.avg_response_time_ms * 0.9 + response_time_ms * 0.1;
            } else {
                broker.stats.failure_count += 1;
            }
        }
        drop(brokers);

        let mut consecutive = self.consecutive_publish_failures.lock().unwrap();
        if success {
            *consecutive = 0;
            false
        } else {
            *consecutive += 1;
            *consecutive >= CONSECUTIVE_PUBLISH_FAILURE_THRESHOLD
        }
    }

    /// Updates a broker's health from a background probe, marking it unavailable
    /// after `N` consecutive failed probes and restoring it on a single success.
    pub fn record_health_check(&self, broker_name: &str, success: bool, response_time_ms: f64) {
        let mut brokers = self.brokers.lock().unwrap();
        if let Some(broker) = brokers.iter_mut().find(|b| b.name == broker_name) {
            if success {
                broker.stats.consecutive_failures = 0;
                broker.stats.is_available = true;
                broker.stats.avg_response_time_ms = broker.stats.avg_response_time_ms * 0.9 + response_time_ms * 0.1;
            } else {
                broker.stats.consecutive_failures += 1;
                if broker.stats.consecutive_failures >= CONSECUTIVE_HEALTH_FAILURE_THRESHOLD {
                    broker.stats.is_available = false;
                }
            }
        }
    }

    /// Explicit or triggered failover: selects the next broker, records an event in
    /// the bounded ring buffer, and sets it as current.
    pub fn trigger_failover(&self, reason: &str) -> Option<String> {
        let from = self.current.lock().unwrap().clone().unwrap_or_default();
        let to = self.select_primary(Some(&from))?;

        let mut events = self.events.lock().unwrap();
        if events.len() >= DEFAULT_RING_BUFFER_SIZE {
            events.pop_front();
        }
        events.push_back(FailoverEvent {
            from: from.clone(),
            to: to.clone(),
            reason: reason.to_string(),
            timestamp: chrono::Utc::now(),
        });
        drop(events);

        *self.current.lock().unwrap() = Some(to.clone());
        Some(to)
    }

    pub fn current_broker(&self) -> Option<String> {
        self.current.lock().unwrap().clone()
    }

    pub fn recent_events(&self) -> Vec<FailoverEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    /// Folds this manager's event ring buffer into a driver's diagnostic report. The
    /// manager is owned by the caller, not the MQTT driver, so this is the seam where
    /// the `events` field of the §6 diagnostic schema actually gets populated.
    pub fn fill_diagnostic_events(&self, report: &mut crate::driver::DiagnosticReport) {
        report.events = self
            .recent_events()
            .into_iter()
            .map(|e| serde_json::to_value(e).unwrap_or(serde_json::Value::Null))
            .collect();
    }

    /// Whether per-broker load spread exceeds the rebalancing threshold (default 30%).
    pub fn needs_rebalance(&self) -> bool {
        let brokers = self.brokers.lock().unwrap();
        let loads: Vec<u64> = brokers.iter().map(|b| b.stats.success_count + b.stats.failure_count).collect();
        let max = loads.iter().max().copied().unwrap_or(0);
        let min = loads.iter().min().copied().unwrap_or(0);
        if max == 0 {
            return false;
        }
        let spread = (max - min) as f64 / max as f64;
        spread > DEFAULT_LOAD_IMBALANCE_THRESHOLD
    }

    pub fn reconnect_strategy(&self) -> &ReconnectStrategy {
        &self.reconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Statistics;

    fn broker(name: &str, priority: u32) -> Broker {
        Broker {
            url: format!("mqtt://{name}:1883"),
            name: name.to_string(),
            priority,
            stats: BrokerStats::default(),
        }
    }

    #[test]
    fn select_primary_prefers_lowest_priority() {
        let manager = FailoverManager::new(
            vec![broker("a", 1), broker("b", 0)],
            ReconnectStrategy::default(),
            LoadBalanceAlgorithm::RoundRobin,
        );
        assert_eq!(manager.select_primary(None), Some("b".to_string()));
    }

    #[test]
    fn trigger_failover_records_event_and_switches_current() {
        let manager = FailoverManager::new(
            vec![broker("a", 0), broker("b", 1)],
            ReconnectStrategy::default(),
            LoadBalanceAlgorithm::RoundRobin,
        );
        let to = manager.trigger_failover("connection lost").unwrap();
        assert_eq!(to, "b");
        assert_eq!(manager.current_broker(), Some("b".to_string()));
        let events = manager.recent_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from, "a");
        assert_eq!(events[0].to, "b");
    }

    #[test]
    fn ring_buffer_evicts_oldest_event_past_capacity() {
        let manager = FailoverManager::new(
            vec![broker("a", 0), broker("b", 1)],
            ReconnectStrategy::default(),
            LoadBalanceAlgorithm::RoundRobin,
        );
        for i in 0..150 {
            manager.trigger_failover(&format!("round {i}"));
        }
        assert_eq!(manager.recent_events().len(), 100);
    }

    #[test]
    fn publish_failure_threshold_triggers_after_three_consecutive() {
        let manager = FailoverManager::new(
            vec![broker("a", 0)],
            ReconnectStrategy::default(),
            LoadBalanceAlgorithm::RoundRobin,
        );
        assert!(!manager.record_publish_result("a", false, 10.0));
        assert!(!manager.record_publish_result("a", false, 10.0));
        assert!(manager.record_publish_result("a", false, 10.0));
    }

    #[test]
    fn health_check_marks_unavailable_after_consecutive_failures() {
        let manager = FailoverManager::new(
            vec![broker("a", 0)],
            ReconnectStrategy::default(),
            LoadBalanceAlgorithm::RoundRobin,
        );
        manager.record_health_check("a", false, 0.0);
        manager.record_health_check("a", false, 0.0);
        manager.record_health_check("a", false, 0.0);
        assert_eq!(manager.select_primary(None), None);
        manager.record_health_check("a", true, 5.0);
        assert_eq!(manager.select_primary(None), Some("a".to_string()));
    }

    #[test]
    fn backoff_respects_max_delay_cap() {
        let strategy = ReconnectStrategy { jitter: false, ..ReconnectStrategy::default() };
        assert_eq!(strategy.delay_for_attempt(1), 1000);
        assert_eq!(strategy.delay_for_attempt(10), 60_000);
    }

    #[test]
    fn unbounded_max_attempts_always_retries() {
        let strategy = ReconnectStrategy::default();
        assert!(strategy.should_retry(10_000));
    }

    #[test]
    fn fill_diagnostic_events_carries_recorded_failovers() {
        let manager = FailoverManager::new(
            vec![broker("a", 0), broker("b", 1)],
            ReconnectStrategy::default(),
            LoadBalanceAlgorithm::RoundRobin,
        );
        manager.trigger_failover("connection lost");

        let mut report = crate::driver::DiagnosticReport {
            status: "connected".to_string(),
            protocol: "MQTT".to_string(),
            endpoint: "broker-a:1883".to_string(),
            statistics: Statistics::new().snapshot(),
            subscriptions: Vec::new(),
            events: Vec::new(),
        };
        manager.fill_diagnostic_events(&mut report);
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0]["from"], "a");
    }
}
