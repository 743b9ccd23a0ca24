//! BACnet/IP driver: Who-Is/I-Am discovery, ReadProperty(Multiple), WriteProperty with
//! priority arrays, COV subscription.
//!
//! This driver mirrors `protocols/modbus.rs`'s `ProtocolDriver` skeleton and `s7.rs`'s
//! connect/run/poll loop shape (interval-driven background task, `Arc<Mutex<...>>`
//! connection cell). The wire protocol itself comes from `bacnet-rs`, playing the same
//! role `rust-snap7` plays for S7: one crate handling BVLC/NPDU/APDU framing so this
//! module can focus on device-table bookkeeping and property mapping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bacnet_rs::client::BacnetClient;
use bacnet_rs::object::PropertyIdentifier;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::descriptors::{BacnetConfig, DeviceDescriptor, PointDescriptor, Protocol, ProtocolConfig};
use crate::driver::{DriverState, ProtocolDriver};
use crate::error::{ErrorInfo, PulseError, Result};
use crate::stats::Statistics;
use crate::value::{Quality, TimestampedValue, Value};

const DEFAULT_WHO_IS_INTERVAL_SECS: u64 = 10;
const DEFAULT_COV_LIFETIME_SECS: u32 = 3600;
const DEFAULT_APDU_TIMEOUT_SECS: u64 = 6;
const DEFAULT_APDU_RETRIES: u32 = 3;
const PRESENT_VALUE: u32 = 85;

const COUNTER_KEYS: &[&str] = &[
    "who_is_sent",
    "i_am_received",
    "read_property_requests",
    "write_property_requests",
    "cov_subscriptions",
    "cov_notifications",
    "devices_discovered",
    "segmented_messages",
];

#[derive(Debug, Clone)]
struct DiscoveredDevice {
    address: SocketAddr,
    vendor_id: u32,
    max_apdu: u16,
    segmentation: bool,
}

struct SharedState {
    devices: Mutex<HashMap<u32, DiscoveredDevice>>,
    state: Mutex<DriverState>,
    last_error: Mutex<ErrorInfo>,
    stats: Statistics,
}

pub struct BacnetDriver {
    device: Option<DeviceDescriptor>,
    config: Option<BacnetConfig>,
    client: Option<Arc<BacnetClient>>,
    shared: Arc<SharedState>,
    discovery_handle: Option<JoinHandle<()>>,
    cov_handle: Option<JoinHandle<()>>,
}

impl BacnetDriver {
    pub fn new() -> Self {
        Self {
            device: None,
            config: None,
            client: None,
            shared: Arc::new(SharedState {
                devices: Mutex::new(HashMap::new()),
                state: Mutex::new(DriverState::Uninitialized),
                last_error: Mutex::new(ErrorInfo::success(Protocol::Bacnet)),
                stats: Statistics::new().with_counter_keys(COUNTER_KEYS),
            }),
            discovery_handle: None,
            cov_handle: None,
        }
    }

    async fn set_state(&self, state: DriverState) {
        *self.shared.state.lock().await = state;
    }

    fn config(&self) -> Result<&BacnetConfig> {
        self.config.as_ref().ok_or_else(|| PulseError::Configuration("driver not initialized".into()))
    }

    /// Issues Who-Is (global, unbounded instance range by default) and collects
    /// I-Am responses for `who_is_interval`, populating the
    /// device table. Devices declared in config but not answering are left absent from
    /// the table and are marked `NotConnected` by callers on lookup.
    async fn run_discovery(client: Arc<BacnetClient>, shared: Arc<SharedState>) {
        let mut ticker = interval(Duration::from_secs(DEFAULT_WHO_IS_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            shared.stats.increment_counter("who_is_sent");
            match client.who_is(None, None).await {
                Ok(i_ams) => {
                    let mut devices = shared.devices.lock().await;
                    for i_am in i_ams {
                        shared.stats.increment_counter("i_am_received");
                        devices.insert(
                            i_am.device_instance,
                            DiscoveredDevice {
                                address: i_am.address,
                                vendor_id: i_am.vendor_id,
                                max_apdu: i_am.max_apdu_length as u16,
                                segmentation: i_am.segmentation_supported,
                            },
                        );
                    }
                    shared.stats.set_metric("devices_discovered", devices.len() as f64);
                }
                Err(e) => {
                    warn!(error = %e, "who-is discovery round failed");
                }
            }
        }
    }

    /// Renews every active COV subscription at `cov_lifetime_s / 2`. The
    /// subscription set itself is established by the worker's opted-in points; this
    /// loop only keeps existing subscriptions alive against timeout.
    async fn run_cov_renewal(client: Arc<BacnetClient>, shared: Arc<SharedState>, lifetime_secs: u32) {
        let mut ticker = interval(Duration::from_secs((lifetime_secs / 2).max(1) as u64));
        loop {
            ticker.tick().await;
            let devices = shared.devices.lock().await.clone();
            for (instance, discovered) in devices {
                match client.renew_cov_subscription(discovered.address, instance, lifetime_secs).await {
                    Ok(()) => shared.stats.increment_counter("cov_subscriptions"),
                    Err(e) => warn!(instance, error = %e, "cov renewal failed"),
                }
            }
        }
    }
}

impl Default for BacnetDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolDriver for BacnetDriver {
    async fn initialize(&mut self, device: &DeviceDescriptor) -> Result<()> {
        let config = match &device.protocol_config {
            ProtocolConfig::Bacnet(c) => c.clone(),
            _ => return Err(PulseError::Configuration("device is not a BACnet device".into())),
        };
        if !config.is_valid() {
            return Err(PulseError::Configuration("invalid BACnet configuration".into()));
        }
        self.device = Some(device.clone());
        self.config = Some(config);
        self.set_state(DriverState::Initialized).await;
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        if *self.shared.state.lock().await == DriverState::Connected {
            return Ok(());
        }
        self.set_state(DriverState::Starting).await;
        let config = self.config()?.clone();

        let bind_addr: SocketAddr = match format!("0.0.0.0:{}", config.port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                let err = PulseError::Configuration(format!("invalid bind address: {e}"));
                self.set_state(DriverState::Error).await;
                self.shared.stats.record_connection(false);
                *self.shared.last_error.lock().await = err.to_error_info(Protocol::Bacnet);
                return Err(err);
            }
        };

        let client = match BacnetClient::bind(bind_addr).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                let err = PulseError::ConnectionFailed(e.to_string());
                self.set_state(DriverState::Error).await;
                self.shared.stats.record_connection(false);
                *self.shared.last_error.lock().await = err.to_error_info(Protocol::Bacnet);
                return Err(err);
            }
        };

        self.client = Some(client.clone());
        self.discovery_handle = Some(tokio::spawn(Self::run_discovery(client.clone(), self.shared.clone())));
        if config.support_cov {
            self.cov_handle = Some(tokio::spawn(Self::run_cov_renewal(
                client,
                self.shared.clone(),
                DEFAULT_COV_LIFETIME_SECS,
            )));
        }

        self.set_state(DriverState::Connected).await;
        self.shared.stats.record_connection(true);
        metrics::gauge!("pulseone_driver_connected", "protocol" => "bacnet").set(1.0);
        info!(port = config.port, "bacnet driver connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.set_state(DriverState::Stopping).await;
        if let Some(handle) = self.discovery_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.cov_handle.take() {
            handle.abort();
        }
        self.client = None;
        self.set_state(DriverState::Stopped).await;
        metrics::gauge!("pulseone_driver_connected", "protocol" => "bacnet").set(0.0);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    async fn read_values(&mut self, points: &[PointDescriptor]) -> Result<Vec<TimestampedValue>> {
        if points.is_empty() {
            return Err(PulseError::InvalidParameter("points must be non-empty".into()));
        }
        let client = self.client.clone().ok_or_else(|| PulseError::ConnectionLost("not connected".into()))?;
        let config = self.config()?.clone();
        let devices = self.shared.devices.lock().await.clone();

        let mut by_device: HashMap<u32, Vec<&PointDescriptor>> = HashMap::new();
        for p in points {
            if let Some(instance) = p.address_numeric {
                by_device.entry(instance).or_default().push(p);
            }
        }

        let mut results: HashMap<String, TimestampedValue> = HashMap::new();
        let mut any_success = false;
        let started = std::time::Instant::now();

        for (instance, device_points) in by_device {
            let discovered = match devices.get(&instance) {
                Some(d) => d,
                None => {
                    for p in &device_points {
                        results.insert(p.id.clone(), TimestampedValue::new(p.id.clone(), Value::Bool(false), Quality::NotConnected, "bacnet"));
                    }
                    continue;
                }
            };

            let use_rpm = config.support_read_property_multiple && discovered.max_apdu >= 1476;
            self.shared.stats.increment_counter("read_property_requests");

            let read_outcome = if use_rpm {
                let properties: Vec<u32> = device_points.iter().map(|p| p.property_id()).collect();
                client
                    .read_property_multiple(discovered.address, instance, &properties)
                    .await
                    .map(|values| values.into_iter().map(Value::F64).collect::<Vec<_>>())
            } else {
                let mut values = Vec::with_capacity(device_points.len());
                let mut err = None;
                for p in &device_points {
                    match client
                        .read_property(discovered.address, instance, PropertyIdentifier::from(p.property_id()))
                        .await
                    {
                        Ok(v) => values.push(Value::F64(v)),
                        Err(e) => {
                            err = Some(e);
                            break;
                        }
                    }
                }
                match err {
                    Some(e) => Err(e),
                    None => Ok(values),
                }
            };

            match read_outcome {
                Ok(values) => {
                    any_success = true;
                    for (p, raw) in device_points.iter().zip(values) {
                        let scaled = raw.scale(p.scaling_factor, p.scaling_offset);
                        let quality = if scaled.as_f64().map(|v| p.in_range(v)).unwrap_or(true) {
                            Quality::Good
                        } else {
                            Quality::Uncertain
                        };
                        results.insert(p.id.clone(), TimestampedValue::new(p.id.clone(), scaled, quality, "bacnet"));
                    }
                }
                Err(e) => {
                    let err = PulseError::DeviceNotResponding(e.to_string());
                    *self.shared.last_error.lock().await = err.to_error_info(Protocol::Bacnet);
                    for p in &device_points {
                        results.insert(p.id.clone(), TimestampedValue::bad(p.id.clone(), "bacnet"));
                    }
                }
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.shared.stats.record_read(any_success || results.is_empty());
        self.shared.stats.record_response_time(elapsed_ms);
        metrics::counter!("pulseone_driver_reads_total", "protocol" => "bacnet").increment(1);
        metrics::histogram!("pulseone_driver_response_time_ms", "protocol" => "bacnet").record(elapsed_ms);
        debug!(points = points.len(), "bacnet read batch complete");
        Ok(points.iter().filter_map(|p| results.remove(&p.id)).collect())
    }

    async fn write_value(&mut self, point: &PointDescriptor, value: Value) -> Result<()> {
        if !point.access.is_writable() {
            return Err(PulseError::AccessDenied);
        }
        let instance = point.address_numeric.ok_or_else(|| PulseError::InvalidAddress("point has no object instance".into()))?;
        let client = self.client.clone().ok_or_else(|| PulseError::ConnectionLost("not connected".into()))?;
        let config = self.config()?.clone();
        let devices = self.shared.devices.lock().await;
        let discovered = devices.get(&instance).ok_or_else(|| PulseError::DeviceNotResponding(format!("device {instance} not discovered")))?;
        let address = discovered.address;
        drop(devices);

        let raw = value.as_f64().unwrap_or(0.0);
        self.shared.stats.increment_counter("write_property_requests");
        metrics::counter!("pulseone_driver_writes_total", "protocol" => "bacnet").increment(1);
        match client
            .write_property(address, instance, PropertyIdentifier::from(point.property_id()), raw, config.priority)
            .await
        {
            Ok(()) => {
                self.shared.stats.record_write(true);
                Ok(())
            }
            Err(e) => {
                self.shared.stats.record_write(false);
                let err = PulseError::Protocol(e.to_string());
                *self.shared.last_error.lock().await = err.to_error_info(Protocol::Bacnet);
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
            .unwrap_or_else(|_| ErrorInfo::success(Protocol::Bacnet))
    }

    fn status(&self) -> DriverState {
        self.shared.state.try_lock().map(|s| *s).unwrap_or(DriverState::Uninitialized)
    }

    fn validate_address(&self, point: &PointDescriptor) -> Result<()> {
        match point.address_numeric {
            Some(instance) if instance <= 4_194_303 => Ok(()),
            _ => Err(PulseError::InvalidAddress(format!(
                "bacnet device_instance must be in [0, 4194303], got {:?}",
                point.address_numeric
            ))),
        }
    }

    fn capabilities(&self) -> HashMap<String, bool> {
        let mut caps = HashMap::new();
        if let Some(config) = &self.config {
            caps.insert("supports_cov".to_string(), config.support_cov);
            caps.insert("supports_read_property_multiple".to_string(), config.support_read_property_multiple);
            caps.insert("supports_segmentation".to_string(), config.segmentation);
        }
        caps
    }

    fn diagnostics(&self) -> HashMap<String, String> {
        let mut diag = HashMap::new();
        diag.insert("apdu_timeout_s".to_string(), DEFAULT_APDU_TIMEOUT_SECS.to_string());
        diag.insert("apdu_retries".to_string(), DEFAULT_APDU_RETRIES.to_string());
        if let Some(config) = &self.config {
            diag.insert("max_segments".to_string(), config.max_segments.to_string());
        }
        diag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_address_rejects_broadcast_instance() {
        let driver = BacnetDriver::new();
        let point = PointDescriptor {
            id: "p1".into(),
            device_id: "d1".into(),
            name: "pv".into(),
            address_numeric: Some(4_194_303),
            address_string: None,
            data_type: crate::descriptors::DataType::F64,
            access: crate::descriptors::Access::Read,
            enabled: true,
            unit: None,
            scaling_factor: 1.0,
            scaling_offset: 0.0,
            min_value: None,
            max_value: None,
            log_enabled: true,
            log_interval_ms: 1000,
            log_deadband: 0.0,
            polling_interval_ms: 1000,
            protocol_params: HashMap::new(),
        };
        assert!(driver.validate_address(&point).is_err());
    }

    #[test]
    fn property_id_defaults_to_present_value() {
        let point = PointDescriptor {
            id: "p1".into(),
            device_id: "d1".into(),
            name: "pv".into(),
            address_numeric: Some(100),
            address_string: None,
            data_type: crate::descriptors::DataType::F64,
            access: crate::descriptors::Access::Read,
            enabled: true,
            unit: None,
            scaling_factor: 1.0,
            scaling_offset: 0.0,
            min_value: None,
            max_value: None,
            log_enabled: true,
            log_interval_ms: 1000,
            log_deadband: 0.0,
            polling_interval_ms: 1000,
            protocol_params: HashMap::new(),
        };
        assert_eq!(point.property_id(), PRESENT_VALUE);
    }
}
