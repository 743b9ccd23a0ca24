// src/lib.rs
#![cfg_attr(docsrs, feature(doc_cfg))]

//! PulseOne Core: protocol driver subsystem for the PulseOne industrial gateway.
//!
//! Owns the protocol-agnostic driver interface, the three concrete drivers (Modbus,
//! MQTT, BACnet), the shared statistics/error model, and the MQTT failover/
//! load-balancing layer built on top of the MQTT driver.

pub mod descriptors;
pub mod driver;
pub mod error;
pub mod stats;
pub mod value;

pub mod drivers;

#[cfg(feature = "mqtt")]
#[cfg_attr(docsrs, doc(cfg(feature = "mqtt")))]
pub mod failover;

// Re-exports for convenience
pub use descriptors::{DeviceDescriptor, PointDescriptor, Protocol, ProtocolConfig};
pub use driver::{DriverRegistry, DriverState, ProtocolDriver};
pub use error::{ErrorCategory, ErrorInfo, PulseError, Result};
pub use stats::Statistics;
pub use value::{Quality, TimestampedValue, Value};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

/// Registers this crate's named `metrics` series. Does not install a logging
/// subscriber or a metrics exporter; both are the bootstrap's job.
pub fn init() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!("pulseone_driver_reads_total", "Total read operations issued by a driver");
    describe_counter!("pulseone_driver_writes_total", "Total write operations issued by a driver");
    describe_gauge!("pulseone_driver_connected", "Driver connection state (1=connected, 0=not)");
    describe_histogram!("pulseone_driver_response_time_ms", "Per-operation response time in milliseconds");
}

/// Runtime feature detection.
pub struct Features {
    pub protocols: Protocols,
}

pub struct Protocols {
    pub modbus: bool,
    pub mqtt: bool,
    pub bacnet: bool,
}

impl Features {
    pub fn enabled() -> Self {
        Self {
            protocols: Protocols {
                modbus: cfg!(feature = "modbus-support"),
                mqtt: cfg!(feature = "mqtt"),
                bacnet: cfg!(feature = "bacnet-support"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn feature_detection_reflects_default_features() {
        let features = Features::enabled();
        assert!(features.protocols.modbus);
        assert!(features.protocols.mqtt);
        assert!(features.protocols.bacnet);
    }
}
