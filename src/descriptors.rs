//! Protocol-agnostic device/point configuration plus per-protocol config variants.
//!
//! Grounded on PETRA's `S7Config`/`MqttConfig` (serde derive, per-field `#[serde(default
//! = "...")]`, `Default` impls); `ProtocolConfig` is an exhaustive sum type over the
//! three per-protocol config shapes rather than ad-hoc smart-pointer polymorphism.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Read/write access for a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn is_writable(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    pub fn is_readable(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
}

/// Which wire protocol a device speaks. Normalizes the source's two incompatible
/// `ProtocolType` enums into one set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Modbus,
    Mqtt,
    Bacnet,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Modbus => "MODBUS",
            Protocol::Mqtt => "MQTT",
            Protocol::Bacnet => "BACNET",
        };
        write!(f, "{}", s)
    }
}

/// Scalar data type a point's raw wire representation decodes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
}

fn default_true() -> bool {
    true
}

fn default_scaling_factor() -> f64 {
    1.0
}

/// A single data point on a device. `address_numeric` holds Modbus register addresses
/// and BACnet object instances; `address_string` holds MQTT topics. Exactly one is
/// authoritative per protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointDescriptor {
    pub id: String,
    pub device_id: String,
    pub name: String,
    pub address_numeric: Option<u32>,
    pub address_string: Option<String>,
    pub data_type: DataType,
    pub access: Access,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub unit: Option<String>,
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f64,
    #[serde(default)]
    pub scaling_offset: f64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    #[serde(default = "default_true")]
    pub log_enabled: bool,
    #[serde(default)]
    pub log_interval_ms: u64,
    #[serde(default)]
    pub log_deadband: f64,
    #[serde(default)]
    pub polling_interval_ms: u64,
    #[serde(default)]
    pub protocol_params: HashMap<String, String>,
}

impl PointDescriptor {
    /// `true` if `min_value`/`max_value` form a real bound. When true, scaled values
    /// outside the bound are flagged `Uncertain` rather than `Good`.
    pub fn has_range(&self) -> bool {
        match (self.min_value, self.max_value) {
            (Some(min), Some(max)) => max > min,
            _ => false,
        }
    }

    pub fn in_range(&self, scaled: f64) -> bool {
        if !self.has_range() {
            return true;
        }
        let min = self.min_value.unwrap();
        let max = self.max_value.unwrap();
        scaled >= min && scaled <= max
    }

    /// Reads `property_id` from `protocol_params`, falling back to BACnet's
    /// Present_Value (85).
    pub fn property_id(&self) -> u32 {
        self.protocol_params
            .get("property_id")
            .and_then(|s| s.parse().ok())
            .unwrap_or(85)
    }
}

fn default_max_registers() -> u16 {
    125
}

fn default_parity() -> char {
    'N'
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModbusMode {
    Tcp,
    Rtu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    pub slave_id: u8,
    #[serde(default = "default_max_registers")]
    pub max_registers_per_request: u16,
    pub mode: ModbusMode,
    #[serde(default)]
    pub byte_swap: bool,
    #[serde(default)]
    pub word_swap: bool,
    pub serial_port: Option<String>,
    pub baudrate: Option<u32>,
    #[serde(default = "default_parity")]
    pub parity: char,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

impl ModbusConfig {
    pub fn is_valid(&self) -> bool {
        if !(1..=247).contains(&self.slave_id) {
            return false;
        }
        if self.max_registers_per_request == 0 || self.max_registers_per_request > 125 {
            return false;
        }
        if matches!(self.mode, ModbusMode::Rtu) && self.serial_port.is_none() {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

fn default_qos() -> u8 {
    0
}

fn default_keepalive() -> u64 {
    60
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> i32 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_keepalive")]
    pub keepalive_s: u64,
    #[serde(default)]
    pub use_ssl: bool,
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: i32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    pub last_will: Option<LastWill>,
}

impl MqttConfig {
    pub fn is_valid(&self) -> bool {
        self.qos <= 2
    }
}

fn default_bacnet_port() -> u16 {
    47808
}

fn default_max_apdu() -> u16 {
    1476
}

fn default_priority() -> u8 {
    16
}

fn default_max_segments() -> u8 {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacnetConfig {
    pub device_instance: u32,
    #[serde(default = "default_bacnet_port")]
    pub port: u16,
    #[serde(default = "default_max_apdu")]
    pub max_apdu: u16,
    #[serde(default)]
    pub support_cov: bool,
    #[serde(default = "default_true")]
    pub support_who_is: bool,
    #[serde(default = "default_true")]
    pub support_read_property_multiple: bool,
    #[serde(default)]
    pub segmentation: bool,
    #[serde(default = "default_max_segments")]
    pub max_segments: u8,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub bbmd_address: Option<String>,
    pub bbmd_port: Option<u16>,
}

impl BacnetConfig {
    pub fn is_valid(&self) -> bool {
        if self.device_instance > 4_194_303 {
            return false;
        }
        if !(50..=1476).contains(&self.max_apdu) {
            return false;
        }
        if self.priority == 0 || self.priority > 16 {
            return false;
        }
        true
    }
}

/// Per-protocol configuration, chosen exhaustively by the driver that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol")]
pub enum ProtocolConfig {
    Modbus(ModbusConfig),
    Mqtt(MqttConfig),
    Bacnet(BacnetConfig),
}

impl ProtocolConfig {
    pub fn is_valid(&self) -> bool {
        match self {
            ProtocolConfig::Modbus(c) => c.is_valid(),
            ProtocolConfig::Mqtt(c) => c.is_valid(),
            ProtocolConfig::Bacnet(c) => c.is_valid(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolConfig::Modbus(_) => Protocol::Modbus,
            ProtocolConfig::Mqtt(_) => Protocol::Mqtt,
            ProtocolConfig::Bacnet(_) => Protocol::Bacnet,
        }
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_retry_count() -> u32 {
    3
}

/// A field device the worker owns a single driver instance for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub tenant_id: String,
    pub site_id: String,
    pub name: String,
    pub protocol: Protocol,
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub polling_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    pub protocol_config: ProtocolConfig,
}

impl DeviceDescriptor {
    pub fn is_valid(&self) -> bool {
        self.protocol == self.protocol_config.protocol() && self.protocol_config.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modbus_config() -> ModbusConfig {
        ModbusConfig {
            slave_id: 1,
            max_registers_per_request: 125,
            mode: ModbusMode::Tcp,
            byte_swap: false,
            word_swap: false,
            serial_port: None,
            baudrate: None,
            parity: 'N',
            data_bits: 8,
            stop_bits: 1,
        }
    }

    #[test]
    fn modbus_rejects_out_of_range_slave_id() {
        let mut c = modbus_config();
        c.slave_id = 0;
        assert!(!c.is_valid());
        c.slave_id = 248;
        assert!(!c.is_valid());
    }

    #[test]
    fn modbus_rtu_requires_serial_port() {
        let mut c = modbus_config();
        c.mode = ModbusMode::Rtu;
        assert!(!c.is_valid());
        c.serial_port = Some("/dev/ttyUSB0".into());
        assert!(c.is_valid());
    }

    #[test]
    fn bacnet_rejects_broadcast_instance() {
        let c = BacnetConfig {
            device_instance: 4_194_303,
            port: 47808,
            max_apdu: 1476,
            support_cov: false,
            support_who_is: true,
            support_read_property_multiple: true,
            segmentation: false,
            max_segments: 16,
            priority: 16,
            bbmd_address: None,
            bbmd_port: None,
        };
        assert!(!c.is_valid());
    }

    #[test]
    fn point_range_flags_uncertain_without_clipping() {
        let mut point = PointDescriptor {
            id: "p1".into(),
            device_id: "d1".into(),
            name: "temp".into(),
            address_numeric: Some(100),
            address_string: None,
            data_type: DataType::F64,
            access: Access::Read,
            enabled: true,
            unit: None,
            scaling_factor: 0.1,
            scaling_offset: -40.0,
            min_value: Some(-100.0),
            max_value: Some(100.0),
            log_enabled: true,
            log_interval_ms: 1000,
            log_deadband: 0.0,
            polling_interval_ms: 1000,
            protocol_params: HashMap::new(),
        };
        assert!(point.in_range(10.0));
        assert!(!point.in_range(1960.0));
        point.max_value = None;
        assert!(point.in_range(1960.0));
    }

    fn mqtt_config() -> MqttConfig {
        MqttConfig {
            client_id: "gw-01".into(),
            username: Some("svc".into()),
            password: None,
            qos: 1,
            clean_session: true,
            keepalive_s: 60,
            use_ssl: false,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            auto_reconnect: true,
            max_reconnect_attempts: -1,
            reconnect_delay_ms: 1000,
            last_will: Some(LastWill {
                topic: "gw-01/status".into(),
                payload: "offline".into(),
                qos: 1,
                retain: true,
            }),
        }
    }

    fn bacnet_config() -> BacnetConfig {
        BacnetConfig {
            device_instance: 100,
            port: 47808,
            max_apdu: 1476,
            support_cov: true,
            support_who_is: true,
            support_read_property_multiple: true,
            segmentation: false,
            max_segments: 16,
            priority: 16,
            bbmd_address: None,
            bbmd_port: None,
        }
    }

    #[test]
    fn modbus_config_round_trips_through_yaml() {
        let c = modbus_config();
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: ModbusConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(c.slave_id, back.slave_id);
        assert_eq!(c.mode, back.mode);
        assert_eq!(c.max_registers_per_request, back.max_registers_per_request);
    }

    #[test]
    fn mqtt_config_round_trips_through_yaml() {
        let c = mqtt_config();
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: MqttConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(c.client_id, back.client_id);
        assert_eq!(c.qos, back.qos);
        assert_eq!(c.last_will.unwrap().topic, back.last_will.unwrap().topic);
    }

    #[test]
    fn bacnet_config_round_trips_through_yaml() {
        let c = bacnet_config();
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: BacnetConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(c.device_instance, back.device_instance);
        assert_eq!(c.priority, back.priority);
    }

    #[test]
    fn protocol_config_variant_survives_yaml_through_a_file() {
        let cfg = ProtocolConfig::Bacnet(bacnet_config());
        let yaml = serde_yaml::to_string(&cfg).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(yaml.as_bytes()).unwrap();

        let read_back = std::fs::read_to_string(file.path()).unwrap();
        let back: ProtocolConfig = serde_yaml::from_str(&read_back).unwrap();
        match back {
            ProtocolConfig::Bacnet(c) => assert_eq!(c.device_instance, 100),
            _ => panic!("expected a Bacnet variant after round-tripping through YAML"),
        }
    }
}
