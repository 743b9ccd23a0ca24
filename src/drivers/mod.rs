//! Concrete protocol drivers. Each implements [`crate::driver::ProtocolDriver`] and is
//! constructed from a [`crate::descriptors::DeviceDescriptor`] whose `protocol_config`
//! matches the driver's protocol.

#[cfg(feature = "modbus-support")]
pub mod modbus;

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "bacnet-support")]
pub mod bacnet;
