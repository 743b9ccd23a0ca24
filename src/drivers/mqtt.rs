//! MQTT pub/sub driver: async client, message-pump + connection-monitor background
//! tasks, subscription restoration on reconnect, topic→point demultiplexing.
//!
//! Grounded almost directly on `src/mqtt.rs`: `MqttOptions`/`AsyncClient`/`EventLoop`
//! setup, the reconnect-delay loop, and `topic_matches` (extended here to route to
//! every matching point rather than a single signal).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, LastWill as RumqttcLastWill, MqttOptions, QoS};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::descriptors::{DataType, DeviceDescriptor, MqttConfig, PointDescriptor, Protocol, ProtocolConfig};
use crate::driver::{DriverState, ProtocolDriver};
use crate::error::{ErrorInfo, PulseError, Result};
use crate::stats::Statistics;
use crate::value::{Quality, TimestampedValue, Value};

const COUNTER_KEYS: &[&str] = &[
    "messages_published",
    "messages_received",
    "qos0_messages",
    "qos1_messages",
    "qos2_messages",
    "retained_messages",
    "broker_disconnections",
    "subscription_count",
    "publish_failures",
    "unmatched_messages",
    "mqtt_delivery_complete",
    "mqtt_delivery_timeout",
];

/// Matches an MQTT topic against a subscription pattern containing `+`/`#` wildcards,
/// without regex.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    let mut pi = 0;
    let mut ti = 0;
    while pi < pattern_parts.len() {
        match pattern_parts[pi] {
            "#" => return true,
            "+" => {
                if ti >= topic_parts.len() {
                    return false;
                }
                pi += 1;
                ti += 1;
            }
            literal => {
                if ti >= topic_parts.len() || topic_parts[ti] != literal {
                    return false;
                }
                pi += 1;
                ti += 1;
            }
        }
    }
    ti == topic_parts.len()
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

fn decode_payload(payload: &[u8], data_type: DataType, json_path: Option<&str>) -> std::result::Result<Value, String> {
    let text = std::str::from_utf8(payload).map_err(|e| e.to_string())?;
    let raw_text: String = match json_path {
        Some(path) => {
            let json: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
            let mut cursor = &json;
            for segment in path.split('.').filter(|s| !s.is_empty()) {
                cursor = cursor.get(segment).ok_or_else(|| format!("missing json path segment {segment}"))?;
            }
            cursor.to_string().trim_matches('"').to_string()
        }
        None => text.to_string(),
    };

    match data_type {
        DataType::Bool => raw_text
            .parse::<bool>()
            .or_else(|_| raw_text.parse::<i64>().map(|i| i != 0))
            .map(Value::Bool)
            .map_err(|e| e.to_string()),
        DataType::I16 => raw_text.parse().map(Value::I16).map_err(|e| e.to_string()),
        DataType::U16 => raw_text.parse().map(Value::U16).map_err(|e| e.to_string()),
        DataType::I32 => raw_text.parse().map(Value::I32).map_err(|e| e.to_string()),
        DataType::U32 => raw_text.parse().map(Value::U32).map_err(|e| e.to_string()),
        DataType::I64 => raw_text.parse().map(Value::I64).map_err(|e| e.to_string()),
        DataType::U64 => raw_text.parse().map(Value::U64).map_err(|e| e.to_string()),
        DataType::F32 => raw_text.parse().map(Value::F32).map_err(|e| e.to_string()),
        DataType::F64 => raw_text.parse().map(Value::F64).map_err(|e| e.to_string()),
        DataType::String => Ok(Value::String(raw_text)),
    }
}

fn format_value(value: &Value) -> String {
    value.to_string()
}

enum Signal {
    Connected,
    Disconnected,
}

struct SharedState {
    state: RwLock<DriverState>,
    subscriptions: Mutex<HashMap<String, u8>>,
    topic_index: Mutex<HashMap<String, Vec<PointDescriptor>>>,
    cache: Mutex<HashMap<String, TimestampedValue>>,
    last_error: Mutex<ErrorInfo>,
    stats: Statistics,
}

/// Async pub/sub driver. Two background tasks run for the driver's lifetime: the
/// message pump (decodes incoming publishes) and the connection monitor (restores
/// subscriptions after reconnect).
pub struct MqttDriver {
    device: Option<DeviceDescriptor>,
    config: Option<MqttConfig>,
    client: Option<AsyncClient>,
    shared: Arc<SharedState>,
    pump_handle: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
    /// Points the worker has registered for this device. MQTT's subscription set must
    /// exist before `connect()` (unlike Modbus/BACnet, which take points per read call),
    /// so the worker calls `set_points()` once after `initialize()`.
    pending_points: Vec<PointDescriptor>,
}

impl MqttDriver {
    pub fn new() -> Self {
        Self {
            device: None,
            config: None,
            client: None,
            shared: Arc::new(SharedState {
                state: RwLock::new(DriverState::Uninitialized),
                subscriptions: Mutex::new(HashMap::new()),
                topic_index: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                last_error: Mutex::new(ErrorInfo::success(Protocol::Mqtt)),
                stats: Statistics::new().with_counter_keys(COUNTER_KEYS),
            }),
            pump_handle: None,
            monitor_handle: None,
            pending_points: Vec::new(),
        }
    }

    pub fn set_points(&mut self, points: Vec<PointDescriptor>) {
        self.pending_points = points;
    }

    async fn set_state(&self, state: DriverState) {
        *self.shared.state.write().await = state;
    }

    /// Returns the list of currently-live topic/qos subscriptions.
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.shared.subscriptions.lock().await.keys().cloned().collect()
    }

    fn build_topic_index(points: &[PointDescriptor]) -> HashMap<String, Vec<PointDescriptor>> {
        let mut index: HashMap<String, Vec<PointDescriptor>> = HashMap::new();
        for p in points {
            if let Some(topic) = &p.address_string {
                index.entry(topic.clone()).or_default().push(p.clone());
            }
        }
        index
    }

    fn spawn_background_tasks(&mut self, mut eventloop: rumqttc::EventLoop, client: AsyncClient) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();
        let shared_pump = self.shared.clone();
        let pump = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        shared_pump.stats.increment_counter("messages_received");
                        let topic = publish.topic.clone();
                        let index = shared_pump.topic_index.lock().await;
                        let mut matched = false;
                        for (pattern, points) in index.iter() {
                            if topic_matches(pattern, &topic) {
                                matched = true;
                                for point in points {
                                    let json_path = point.protocol_params.get("json_path").map(String::as_str);
                                    let value = decode_payload(&publish.payload, point.data_type, json_path);
                                    let tv = match value {
                                        Ok(v) => {
                                            let scaled = v.scale(point.scaling_factor, point.scaling_offset);
                                            let quality = if scaled.as_f64().map(|x| point.in_range(x)).unwrap_or(true) {
                                                Quality::Good
                                            } else {
                                                Quality::Uncertain
                                            };
                                            TimestampedValue::new(point.id.clone(), scaled, quality, "mqtt")
                                        }
                                        Err(parse_err) => {
                                            let mut err = shared_pump.last_error.lock().await;
                                            *err = PulseError::DataFormat(parse_err).to_error_info(Protocol::Mqtt);
                                            TimestampedValue::bad(point.id.clone(), "mqtt")
                                        }
                                    };
                                    shared_pump.cache.lock().await.insert(point.id.clone(), tv);
                                }
                            }
                        }
                        drop(index);
                        if !matched {
                            shared_pump.stats.increment_counter("unmatched_messages");
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        let _ = tx.send(Signal::Connected);
                    }
                    Ok(Event::Incoming(Incoming::PubAck(_))) | Ok(Event::Incoming(Incoming::PubComp(_))) => {
                        shared_pump.stats.increment_counter("mqtt_delivery_complete");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt eventloop error");
                        shared_pump.stats.increment_counter("broker_disconnections");
                        let _ = tx.send(Signal::Disconnected);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        });

        let shared_monitor = self.shared.clone();
        let monitor_client = client.clone();
        let monitor = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                match signal {
                    Signal::Connected => {
                        let subs = shared_monitor.subscriptions.lock().await.clone();
                        for (topic, qos) in subs {
                            if let Err(e) = monitor_client.subscribe(topic.clone(), qos_from_u8(qos)).await {
                                warn!(topic, error = %e, "failed to restore subscription");
                            }
                        }
                        *shared_monitor.state.write().await = DriverState::Connected;
                        info!("mqtt subscriptions restored after reconnect");
                    }
                    Signal::Disconnected => {
                        *shared_monitor.state.write().await = DriverState::Reconnecting;
                    }
                }
            }
        });

        self.pump_handle = Some(pump);
        self.monitor_handle = Some(monitor);
    }
}

impl Default for MqttDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolDriver for MqttDriver {
    async fn initialize(&mut self, device: &DeviceDescriptor) -> Result<()> {
        let config = match &device.protocol_config {
            ProtocolConfig::Mqtt(c) => c.clone(),
            _ => return Err(PulseError::Configuration("device is not an MQTT device".into())),
        };
        if !config.is_valid() {
            return Err(PulseError::Configuration("invalid MQTT configuration".into()));
        }
        self.device = Some(device.clone());
        self.config = Some(config);
        *self.shared.state.write().await = DriverState::Initialized;
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        if *self.shared.state.read().await == DriverState::Connected {
            return Ok(());
        }
        self.set_state(DriverState::Starting).await;
        let device = self.device.clone().ok_or_else(|| PulseError::Configuration("not initialized".into()))?;
        let config = self.config.clone().ok_or_else(|| PulseError::Configuration("not initialized".into()))?;

        let client_id = if config.client_id.is_empty() {
            format!("pulseone-{}", Uuid::new_v4().simple())
        } else {
            config.client_id.clone()
        };

        let (host, port) = device
            .endpoint
            .rsplit_once(':')
            .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
            .unwrap_or((device.endpoint.clone(), 1883));

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_s));
        options.set_clean_session(config.clean_session);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }
        if let Some(will) = &config.last_will {
            options.set_last_will(RumqttcLastWill::new(
                will.topic.clone(),
                will.payload.clone().into_bytes(),
                qos_from_u8(will.qos),
                will.retain,
            ));
        }

        let (client, eventloop) = AsyncClient::new(options, 10_000);

        let points = self.pending_points.clone();
        let topic_index = Self::build_topic_index(&points);
        let mut subs = self.shared.subscriptions.lock().await;
        for topic in topic_index.keys() {
            subs.entry(topic.clone()).or_insert(config.qos);
        }
        drop(subs);
        *self.shared.topic_index.lock().await = topic_index;

        let subs_snapshot = self.shared.subscriptions.lock().await.clone();
        for (topic, qos) in &subs_snapshot {
            if let Err(e) = client.subscribe(topic.clone(), qos_from_u8(*qos)).await {
                let err = PulseError::ConnectionFailed(e.to_string());
                self.set_state(DriverState::Error).await;
                self.shared.stats.record_connection(false);
                *self.shared.last_error.lock().await = err.to_error_info(Protocol::Mqtt);
                return Err(err);
            }
            self.shared.stats.increment_counter("subscription_count");
        }

        self.client = Some(client.clone());
        self.spawn_background_tasks(eventloop, client);
        self.set_state(DriverState::Connected).await;
        self.shared.stats.record_connection(true);
        metrics::gauge!("pulseone_driver_connected", "protocol" => "mqtt").set(1.0);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.set_state(DriverState::Stopping).await;
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(handle) = self.pump_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.monitor_handle.take() {
            handle.abort();
        }
        self.set_state(DriverState::Stopped).await;
        metrics::gauge!("pulseone_driver_connected", "protocol" => "mqtt").set(0.0);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// MQTT never generates network traffic on read: returns the most recently cached
    /// value per point, downgraded to `Stale` past `log_interval_ms * 3`.
    async fn read_values(&mut self, points: &[PointDescriptor]) -> Result<Vec<TimestampedValue>> {
        if points.is_empty() {
            return Err(PulseError::InvalidParameter("points must be non-empty".into()));
        }
        let started = std::time::Instant::now();
        let cache = self.shared.cache.lock().await;
        let mut results = Vec::with_capacity(points.len());
        for point in points {
            match cache.get(&point.id) {
                Some(cached) => {
                    let staleness_limit = chrono::Duration::milliseconds((point.log_interval_ms * 3) as i64);
                    let mut value = cached.clone();
                    if point.log_interval_ms > 0 && Utc::now() - cached.timestamp > staleness_limit {
                        value.quality = Quality::Stale;
                    }
                    results.push(value);
                }
                None => results.push(TimestampedValue::new(point.id.clone(), Value::Bool(false), Quality::NotConnected, "mqtt")),
            }
        }
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.shared.stats.record_read(true);
        self.shared.stats.record_response_time(elapsed_ms);
        metrics::counter!("pulseone_driver_reads_total", "protocol" => "mqtt").increment(1);
        metrics::histogram!("pulseone_driver_response_time_ms", "protocol" => "mqtt").record(elapsed_ms);
        Ok(results)
    }

    async fn write_value(&mut self, point: &PointDescriptor, value: Value) -> Result<()> {
        if !point.access.is_writable() {
            return Err(PulseError::AccessDenied);
        }
        let topic = point
            .address_string
            .clone()
            .ok_or_else(|| PulseError::InvalidAddress("point has no topic".into()))?;
        let client = self.client.as_ref().ok_or_else(|| PulseError::ConnectionLost("not connected".into()))?;
        let qos = self.config.as_ref().map(|c| c.qos).unwrap_or(0);
        let retain = point.protocol_params.get("retain").map(|v| v == "true").unwrap_or(false);
        let payload = format_value(&value);

        metrics::counter!("pulseone_driver_writes_total", "protocol" => "mqtt").increment(1);
        match client.publish(topic, qos_from_u8(qos), retain, payload).await {
            Ok(()) => {
                self.shared.stats.increment_counter("messages_published");
                self.shared.stats.increment_counter(match qos {
                    1 => "qos1_messages",
                    2 => "qos2_messages",
                    _ => "qos0_messages",
                });
                if retain {
                    self.shared.stats.increment_counter("retained_messages");
                }
                self.shared.stats.record_write(true);
                Ok(())
            }
            Err(e) => {
                self.shared.stats.increment_counter("publish_failures");
                self.shared.stats.record_write(false);
                // rumqttc's ClientError doesn't expose a stable "queue full" variant to
                // match on; its Display text is the only reliable backpressure signal.
                let msg = e.to_string();
                let is_backpressure = msg.to_lowercase().contains("full") || msg.to_lowercase().contains("capacity");
                let err = if is_backpressure {
                    PulseError::ResourceExhausted(msg)
                } else {
                    PulseError::ConnectionLost(msg)
                };
                *self.shared.last_error.lock().await = err.to_error_info(Protocol::Mqtt);
                Err(err)
            }
        }
    }

    fn statistics(&self) -> Statistics {
        self.shared.stats.clone()
    }

    fn reset_statistics(&mut self) {
        self.shared.stats.reset();
    }

    fn last_error(&self) -> ErrorInfo {
        self.shared
            .last_error
            .try_lock()
            .map(|e| e.clone())
            .unwrap_or_else(|_| ErrorInfo::success(Protocol::Mqtt))
    }

    fn status(&self) -> DriverState {
        self.shared.state.try_read().map(|s| *s).unwrap_or(DriverState::Uninitialized)
    }

    fn validate_address(&self, point: &PointDescriptor) -> Result<()> {
        match &point.address_string {
            Some(topic) if !topic.is_empty() => Ok(()),
            _ => Err(PulseError::InvalidAddress("mqtt point requires a non-empty topic".into())),
        }
    }

    /// Fills `subscriptions` from the live subscription map. `events` stays empty
    /// here: failover events belong to a `FailoverManager` the caller owns
    /// alongside this driver, not to the driver itself.
    async fn diagnostic_report(&self, protocol: crate::descriptors::Protocol, endpoint: &str) -> crate::driver::DiagnosticReport {
        crate::driver::DiagnosticReport {
            status: self.status().to_string(),
            protocol: protocol.to_string(),
            endpoint: endpoint.to_string(),
            statistics: self.shared.stats.snapshot(),
            subscriptions: self.subscribed_topics().await,
            events: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_matching_handles_single_level_wildcard() {
        assert!(topic_matches("sensors/+/temp", "sensors/a/temp"));
        assert!(!topic_matches("sensors/+/temp", "sensors/a/b/temp"));
    }

    #[test]
    fn topic_matching_handles_multi_level_wildcard() {
        assert!(topic_matches("sensors/#", "sensors/a/b/temp"));
        assert!(topic_matches("sensors/#", "sensors"));
    }

    #[test]
    fn topic_matching_rejects_non_matching_literal() {
        assert!(!topic_matches("sensors/a/temp", "sensors/b/temp"));
    }

    #[test]
    fn format_value_renders_plain_scalar() {
        assert_eq!(format_value(&Value::F64(12.5)), "12.5");
    }

    #[test]
    fn decode_payload_parses_plain_scalar() {
        let v = decode_payload(b"42", DataType::I32, None).unwrap();
        assert_eq!(v.as_i64(), Some(42));
    }

    #[test]
    fn decode_payload_extracts_json_path() {
        let payload = br#"{"reading":{"value":21.5}}"#;
        let v = decode_payload(payload, DataType::F64, Some("reading.value")).unwrap();
        assert_eq!(v.as_f64(), Some(21.5));
    }

    #[test]
    fn decode_payload_reports_error_on_malformed_input() {
        let result = decode_payload(b"not-a-number", DataType::F64, None);
        assert!(result.is_err());
    }

    #[test]
    fn decode_payload_keeps_string_points_as_text() {
        let v = decode_payload(b"OPEN", DataType::String, None).unwrap();
        assert_eq!(v, Value::String("OPEN".to_string()));
    }
}
