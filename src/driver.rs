//! Protocol-agnostic driver lifecycle, trait, and registry.
//!
//! The `ProtocolDriver` trait and `DriverRegistry` are grounded directly in PETRA's
//! `protocols/mod.rs` (`ProtocolDriver`, `ProtocolManager`); the state machine borrows
//! `ConnectionState`'s `Display`/`can_retry`/`is_connected` shape from
//! `other_examples/…EvanL1-igw__src-core-traits.rs`, generalized to a full
//! connect/reconnect/stop lifecycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::descriptors::{DeviceDescriptor, PointDescriptor, Protocol};
use crate::error::{ErrorInfo, Result};
use crate::stats::{Statistics, StatisticsSnapshot};
use crate::value::{TimestampedValue, Value};

/// Driver lifecycle state. Transitions are atomic under the registry's
/// per-driver lock; concurrent callers see one consistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Initialized,
    Starting,
    Connected,
    Reconnecting,
    Stopping,
    Stopped,
    Error,
}

impl Default for DriverState {
    fn default() -> Self {
        DriverState::Uninitialized
    }
}

impl DriverState {
    pub fn is_connected(&self) -> bool {
        matches!(self, DriverState::Connected)
    }

    /// Whether a reconnect attempt makes sense from this state. `Error` requires an
    /// explicit `disconnect()` + `initialize()` before retrying.
    pub fn can_retry(&self) -> bool {
        matches!(
            self,
            DriverState::Initialized
                | DriverState::Starting
                | DriverState::Connected
                | DriverState::Reconnecting
        )
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverState::Uninitialized => "uninitialized",
            DriverState::Initialized => "initialized",
            DriverState::Starting => "starting",
            DriverState::Connected => "connected",
            DriverState::Reconnecting => "reconnecting",
            DriverState::Stopping => "stopping",
            DriverState::Stopped => "stopped",
            DriverState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Uniform lifecycle + read/write + stats contract implemented by each protocol.
///
/// ```
/// use async_trait::async_trait;
/// # use pulseone_core::driver::*;
/// # use pulseone_core::descriptors::*;
/// # use pulseone_core::error::Result;
/// # use pulseone_core::stats::Statistics;
/// # use pulseone_core::value::{TimestampedValue, Value};
/// # use pulseone_core::error::ErrorInfo;
/// struct MyDriver { state: DriverState, stats: Statistics }
///
/// #[async_trait]
/// impl ProtocolDriver for MyDriver {
///     async fn initialize(&mut self, _device: &DeviceDescriptor) -> Result<()> {
///         self.state = DriverState::Initialized;
///         Ok(())
///     }
///     async fn connect(&mut self) -> Result<()> {
///         self.state = DriverState::Connected;
///         Ok(())
///     }
///     async fn disconnect(&mut self) -> Result<()> {
///         self.state = DriverState::Stopped;
///         Ok(())
///     }
///     fn is_connected(&self) -> bool { self.state.is_connected() }
///     async fn read_values(&mut self, _points: &[PointDescriptor]) -> Result<Vec<TimestampedValue>> {
///         Ok(vec![])
///     }
///     async fn write_value(&mut self, _point: &PointDescriptor, _value: Value) -> Result<()> {
///         Ok(())
///     }
///     fn statistics(&self) -> Statistics { self.stats.clone() }
///     fn reset_statistics(&mut self) { self.stats.reset(); }
///     fn last_error(&self) -> ErrorInfo { ErrorInfo::success(Protocol::Modbus) }
///     fn status(&self) -> DriverState { self.state }
/// }
/// ```
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// Moves `Uninitialized → Initialized`. Fails with `ConfigurationError` on an
    /// invalid config.
    async fn initialize(&mut self, device: &DeviceDescriptor) -> Result<()>;

    /// Moves `Initialized → Connected`. Idempotent: calling while already connected
    /// succeeds immediately.
    async fn connect(&mut self) -> Result<()>;

    /// Moves any state to `Stopped` and releases the transport. Never fails
    /// observably.
    async fn disconnect(&mut self) -> Result<()>;

    /// Current state snapshot; performs no I/O.
    fn is_connected(&self) -> bool;

    /// Reads `points`, yielding one `TimestampedValue` per point in the same order.
    /// Per-point failures mark `Bad`/`Timeout` quality rather than failing the whole
    /// batch, unless every point fails.
    async fn read_values(&mut self, points: &[PointDescriptor]) -> Result<Vec<TimestampedValue>>;

    /// Writes a single point. Fails with `AccessDenied` if the point's access is
    /// read-only.
    async fn write_value(&mut self, point: &PointDescriptor, value: Value) -> Result<()>;

    /// Live handle to the driver's statistics.
    fn statistics(&self) -> Statistics;

    /// Resets all counters to zero and start-time to now. Does not clear
    /// `last_error`.
    fn reset_statistics(&mut self);

    /// Most recent error, or a `Success` record if none has occurred since the last
    /// successful operation.
    fn last_error(&self) -> ErrorInfo;

    /// Current lifecycle state.
    fn status(&self) -> DriverState;

    /// Protocol-specific diagnostic key/value pairs beyond the fixed `Statistics`
    /// shape. Default empty.
    fn diagnostics(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Protocol-specific capability flags (e.g. "supports_cov", "supports_rpm").
    /// Default empty.
    fn capabilities(&self) -> HashMap<String, bool> {
        HashMap::new()
    }

    /// Pre-flight address-format check. Default permissive; drivers override to
    /// reject malformed addresses before attempting I/O.
    fn validate_address(&self, _point: &PointDescriptor) -> Result<()> {
        Ok(())
    }

    /// Assembles the `{status, protocol, endpoint, statistics, subscriptions, events}`
    /// diagnostic snapshot. Default leaves `subscriptions`/`events` empty; MQTT
    /// overrides to report its live subscription map, and a failover-backed driver
    /// can fold in its recent events.
    async fn diagnostic_report(&self, protocol: Protocol, endpoint: &str) -> DiagnosticReport {
        DiagnosticReport {
            status: self.status().to_string(),
            protocol: protocol.to_string(),
            endpoint: endpoint.to_string(),
            statistics: self.statistics().snapshot(),
            subscriptions: Vec::new(),
            events: Vec::new(),
        }
    }
}

/// Diagnostic JSON snapshot every driver can emit: connection state, the live
/// `Statistics` snapshot, and (protocol-dependent) the current subscription set and
/// recent events. `events` carries free-form JSON so this type doesn't have to depend
/// on the MQTT failover module, which is itself feature-gated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub status: String,
    pub protocol: String,
    pub endpoint: String,
    pub statistics: StatisticsSnapshot,
    pub subscriptions: Vec<String>,
    pub events: Vec<serde_json::Value>,
}

/// Owns multiple driver instances keyed by device id; the seam the (out-of-scope)
/// orchestration layer calls into. Grounded in PETRA's `ProtocolManager`.
pub struct DriverRegistry {
    drivers: Arc<RwLock<HashMap<String, Box<dyn ProtocolDriver>>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_driver(&self, device_id: impl Into<String>, driver: Box<dyn ProtocolDriver>) {
        self.drivers.write().await.insert(device_id.into(), driver);
    }

    pub async fn remove_driver(&self, device_id: &str) -> Option<Box<dyn ProtocolDriver>> {
        self.drivers.write().await.remove(device_id)
    }

    pub async fn connect_all(&self) -> HashMap<String, Result<()>> {
        let mut drivers = self.drivers.write().await;
        let mut results = HashMap::new();
        for (id, driver) in drivers.iter_mut() {
            results.insert(id.clone(), driver.connect().await);
        }
        results
    }

    pub async fn disconnect_all(&self) -> HashMap<String, Result<()>> {
        let mut drivers = self.drivers.write().await;
        let mut results = HashMap::new();
        for (id, driver) in drivers.iter_mut() {
            results.insert(id.clone(), driver.disconnect().await);
        }
        results
    }

    pub async fn connected_devices(&self) -> Vec<String> {
        let drivers = self.drivers.read().await;
        drivers
            .iter()
            .filter(|(_, d)| d.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn all_devices(&self) -> Vec<String> {
        self.drivers.read().await.keys().cloned().collect()
    }

    pub async fn all_diagnostics(&self) -> HashMap<String, HashMap<String, String>> {
        let drivers = self.drivers.read().await;
        drivers
            .iter()
            .map(|(id, d)| (id.clone(), d.diagnostics()))
            .collect()
    }

    pub async fn device_diagnostics(&self, device_id: &str) -> Option<HashMap<String, String>> {
        self.drivers.read().await.get(device_id).map(|d| d.diagnostics())
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::Protocol;
    use async_trait::async_trait;

    struct MockDriver {
        state: DriverState,
        stats: Statistics,
        connected: bool,
    }

    impl MockDriver {
        fn new() -> Self {
            Self {
                state: DriverState::Uninitialized,
                stats: Statistics::new(),
                connected: false,
            }
        }
    }

    #[async_trait]
    impl ProtocolDriver for MockDriver {
        async fn initialize(&mut self, _device: &DeviceDescriptor) -> Result<()> {
            self.state = DriverState::Initialized;
            Ok(())
        }

        async fn connect(&mut self) -> Result<()> {
            self.state = DriverState::Connected;
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.state = DriverState::Stopped;
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn read_values(&mut self, _points: &[PointDescriptor]) -> Result<Vec<TimestampedValue>> {
            Ok(vec![])
        }

        async fn write_value(&mut self, _point: &PointDescriptor, _value: Value) -> Result<()> {
            Ok(())
        }

        fn statistics(&self) -> Statistics {
            self.stats.clone()
        }

        fn reset_statistics(&mut self) {
            self.stats.reset();
        }

        fn last_error(&self) -> ErrorInfo {
            ErrorInfo::success(Protocol::Modbus)
        }

        fn status(&self) -> DriverState {
            self.state
        }
    }

    #[tokio::test]
    async fn registry_connects_and_disconnects_all() {
        let registry = DriverRegistry::new();
        registry.add_driver("dev-1", Box::new(MockDriver::new())).await;
        registry.add_driver("dev-2", Box::new(MockDriver::new())).await;

        let results = registry.connect_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.is_ok()));
        assert_eq!(registry.connected_devices().await.len(), 2);

        registry.disconnect_all().await;
        assert_eq!(registry.connected_devices().await.len(), 0);
    }

    #[tokio::test]
    async fn registry_removes_driver() {
        let registry = DriverRegistry::new();
        registry.add_driver("dev-1", Box::new(MockDriver::new())).await;
        assert_eq!(registry.all_devices().await.len(), 1);
        assert!(registry.remove_driver("dev-1").await.is_some());
        assert_eq!(registry.all_devices().await.len(), 0);
    }

    #[test]
    fn driver_state_display_and_retry() {
        assert_eq!(DriverState::Connected.to_string(), "connected");
        assert!(DriverState::Reconnecting.can_retry());
        assert!(!DriverState::Stopped.can_retry());
        assert!(!DriverState::Error.can_retry());
    }

    #[tokio::test]
    async fn default_diagnostic_report_has_empty_subscriptions_and_events() {
        let mut driver = MockDriver::new();
        driver.connect().await.unwrap();
        let report = driver.diagnostic_report(Protocol::Modbus, "127.0.0.1:502").await;
        assert_eq!(report.status, "connected");
        assert_eq!(report.protocol, "MODBUS");
        assert_eq!(report.endpoint, "127.0.0.1:502");
        assert!(report.subscriptions.is_empty());
        assert!(report.events.is_empty());
    }
}
