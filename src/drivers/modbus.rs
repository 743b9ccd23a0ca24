//! Modbus TCP/RTU driver: one connection per device, serialized requests, register-group
//! batching and exception decoding.
//!
//! Grounded on `protocols/modbus.rs` (the `ProtocolDriver` impl skeleton),
//! `s7.rs::optimize_mappings` (contiguous-range grouping, reused here for register
//! batching), and `other_examples/…ifascada__...modbus.rs.rs` (tokio-serial RTU setup,
//! parity/stop-bits conversion).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_modbus::client::{rtu, tcp, Context, Reader, Writer};
use tokio_modbus::slave::Slave;
use tracing::{debug, warn};

use crate::descriptors::{Access, DataType, DeviceDescriptor, ModbusConfig, ModbusMode, PointDescriptor, Protocol, ProtocolConfig};
use crate::driver::{DriverState, ProtocolDriver};
use crate::error::{ErrorInfo, PulseError, Result};
use crate::stats::Statistics;
use crate::value::{Quality, TimestampedValue, Value};

const MAX_HOLDING_REGISTERS: u16 = 125;
const MAX_COILS: u16 = 2000;
/// Gaps larger than this many registers split a contiguous group into separate
/// frames (default 4).
const DEFAULT_GAP_THRESHOLD: u32 = 4;
/// Register width assumed for a `DataType::String` point when
/// `protocol_params["register_count"]` is absent.
const DEFAULT_STRING_REGISTERS: u16 = 8;
const COUNTER_KEYS: &[&str] = &[
    "register_reads",
    "coil_reads",
    "holding_register_writes",
    "coil_writes",
    "timeout_errors",
    "crc_errors",
    "exception_responses",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegisterKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl RegisterKind {
    fn from_params(params: &HashMap<String, String>) -> Self {
        match params.get("register_type").map(String::as_str) {
            Some("coil") => RegisterKind::Coil,
            Some("discrete_input") => RegisterKind::DiscreteInput,
            Some("input_register") => RegisterKind::InputRegister,
            _ => RegisterKind::HoldingRegister,
        }
    }

    fn max_batch(&self) -> u16 {
        match self {
            RegisterKind::Coil | RegisterKind::DiscreteInput => MAX_COILS,
            RegisterKind::HoldingRegister | RegisterKind::InputRegister => MAX_HOLDING_REGISTERS,
        }
    }

    fn word_count(&self, data_type: DataType, params: &HashMap<String, String>) -> u16 {
        match self {
            RegisterKind::Coil | RegisterKind::DiscreteInput => 1,
            RegisterKind::HoldingRegister | RegisterKind::InputRegister => match data_type {
                DataType::Bool | DataType::I16 | DataType::U16 => 1,
                DataType::I32 | DataType::U32 | DataType::F32 => 2,
                DataType::I64 | DataType::U64 | DataType::F64 => 4,
                DataType::String => params.get("register_count").and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_STRING_REGISTERS),
            },
        }
    }
}

/// One read frame: a contiguous address range for a single register kind, at most
/// `max_registers_per_request` registers wide.
struct ReadFrame {
    kind: RegisterKind,
    start: u16,
    count: u16,
    points: Vec<PointDescriptor>,
}

/// Groups points by `(register_kind, contiguity)` into read frames ordered by
/// starting address, splitting on gaps wider than `gap_threshold` registers and on the
/// register-kind's hard cap. Direct generalization of `optimize_mappings` in `s7.rs`.
fn build_read_frames(points: &[PointDescriptor], max_registers: u16, gap_threshold: u32) -> Vec<ReadFrame> {
    let mut by_kind: HashMap<RegisterKind, Vec<&PointDescriptor>> = HashMap::new();
    for p in points {
        if p.address_numeric.is_none() {
            continue;
        }
        by_kind.entry(RegisterKind::from_params(&p.protocol_params)).or_default().push(p);
    }

    let mut frames = Vec::new();
    for (kind, mut group) in by_kind {
        group.sort_by_key(|p| p.address_numeric.unwrap());
        let cap = max_registers.min(kind.max_batch());

        let mut current: Option<ReadFrame> = None;
        for p in group {
            let addr = p.address_numeric.unwrap() as u16;
            let words = kind.word_count(p.data_type, &p.protocol_params);
            match &mut current {
                Some(frame) => {
                    let frame_end = frame.start + frame.count;
                    let gap = addr as i64 - frame_end as i64;
                    let new_count = (addr + words).saturating_sub(frame.start);
                    if gap >= 0 && (gap as u32) <= gap_threshold && new_count <= cap {
                        frame.count = new_count;
                        frame.points.push(p.clone());
                    } else {
                        frames.push(current.take().unwrap());
                        current = Some(ReadFrame { kind, start: addr, count: words, points: vec![p.clone()] });
                    }
                }
                None => {
                    current = Some(ReadFrame { kind, start: addr, count: words, points: vec![p.clone()] });
                }
            }
        }
        if let Some(frame) = current {
            frames.push(frame);
        }
    }

    frames.sort_by_key(|f| f.start);
    frames
}

/// Maps a Modbus exception/negative transport code onto the shared error taxonomy.
fn exception_to_error(code: i32) -> PulseError {
    match code {
        1 => PulseError::UnsupportedFunction("illegal function".into()),
        2 => PulseError::InvalidAddress("illegal data address".into()),
        3 => PulseError::DataOutOfRange("illegal data value".into()),
        4 => PulseError::DeviceNotResponding("device failure".into()),
        5 | 6 => PulseError::DeviceBusy("acknowledge/busy".into()),
        -1 => PulseError::ConnectionFailed("transport error".into()),
        -2 => PulseError::ConnectionTimeout(0),
        -3 => PulseError::Checksum("crc mismatch".into()),
        _ => PulseError::Protocol(format!("exception code {code}")),
    }
}

fn decode_words(words: &[u16], data_type: DataType, byte_swap: bool, word_swap: bool) -> Value {
    let mut words = words.to_vec();
    if word_swap && words.len() > 1 {
        words.reverse();
    }
    if byte_swap {
        for w in &mut words {
            *w = w.swap_bytes();
        }
    }
    match data_type {
        DataType::Bool => Value::Bool(words[0] & 1 != 0),
        DataType::I16 => Value::I16(words[0] as i16),
        DataType::U16 => Value::U16(words[0]),
        DataType::I32 => Value::I32((((words[0] as u32) << 16) | words[1] as u32) as i32),
        DataType::U32 => Value::U32(((words[0] as u32) << 16) | words[1] as u32),
        DataType::F32 => {
            let bits = ((words[0] as u32) << 16) | words[1] as u32;
            Value::F32(f32::from_bits(bits))
        }
        DataType::I64 => {
            let bits = combine_u64(&words);
            Value::I64(bits as i64)
        }
        DataType::U64 => Value::U64(combine_u64(&words)),
        DataType::F64 => Value::F64(f64::from_bits(combine_u64(&words))),
        DataType::String => Value::String(decode_packed_string(&words)),
    }
}

/// Unpacks a run of registers holding two ASCII bytes each (high byte first) into a
/// string, trimming trailing NUL/space padding.
fn decode_packed_string(words: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for w in words {
        bytes.push((w >> 8) as u8);
        bytes.push((w & 0xff) as u8);
    }
    while matches!(bytes.last(), Some(0) | Some(b' ')) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn combine_u64(words: &[u16]) -> u64 {
    let mut out: u64 = 0;
    for w in words.iter().take(4) {
        out = (out << 16) | *w as u64;
    }
    out
}

enum Transport {
    Tcp(Context),
    Rtu(Context),
}

impl Transport {
    fn context(&mut self) -> &mut Context {
        match self {
            Transport::Tcp(ctx) => ctx,
            Transport::Rtu(ctx) => ctx,
        }
    }
}

pub struct ModbusDriver {
    device: Option<DeviceDescriptor>,
    config: Option<ModbusConfig>,
    transport: Option<Transport>,
    state: DriverState,
    stats: Statistics,
    last_error: ErrorInfo,
    gap_threshold: u32,
}

impl ModbusDriver {
    pub fn new() -> Self {
        Self {
            device: None,
            config: None,
            transport: None,
            state: DriverState::Uninitialized,
            stats: Statistics::new().with_counter_keys(COUNTER_KEYS),
            last_error: ErrorInfo::success(Protocol::Modbus),
            gap_threshold: DEFAULT_GAP_THRESHOLD,
        }
    }

    fn config(&self) -> Result<&ModbusConfig> {
        self.config.as_ref().ok_or_else(|| PulseError::Configuration("driver not initialized".into()))
    }

    async fn read_frame(&mut self, frame: &ReadFrame) -> Result<Vec<TimestampedValue>> {
        let config = self.config()?.clone();
        let kind = frame.kind;
        let ctx = self
            .transport
            .as_mut()
            .ok_or_else(|| PulseError::ConnectionLost("no active transport".into()))?
            .context();

        let read_result = match kind {
            RegisterKind::HoldingRegister => ctx.read_holding_registers(frame.start, frame.count).await,
            RegisterKind::InputRegister => ctx.read_input_registers(frame.start, frame.count).await,
            RegisterKind::Coil => ctx.read_coils(frame.start, frame.count).await.map(|bits| {
                bits.into_iter().map(|b| if b { 1u16 } else { 0u16 }).collect()
            }),
            RegisterKind::DiscreteInput => ctx.read_discrete_inputs(frame.start, frame.count).await.map(|bits| {
                bits.into_iter().map(|b| if b { 1u16 } else { 0u16 }).collect()
            }),
        };

        let words: Vec<u16> = match read_result {
            Ok(Ok(w)) => w,
            Ok(Err(exception)) => {
                self.stats.increment_counter("exception_responses");
                return Err(exception_to_error(exception as i32));
            }
            Err(io_err) => {
                self.stats.increment_counter("timeout_errors");
                return Err(PulseError::Io(io_err));
            }
        };

        let counter = match kind {
            RegisterKind::Coil | RegisterKind::DiscreteInput => "coil_reads",
            RegisterKind::HoldingRegister | RegisterKind::InputRegister => "register_reads",
        };
        self.stats.increment_counter(counter);

        let mut values = Vec::with_capacity(frame.points.len());
        for point in &frame.points {
            let addr = point.address_numeric.unwrap() as u16;
            let offset = (addr - frame.start) as usize;
            let words_needed = kind.word_count(point.data_type, &point.protocol_params) as usize;
            if offset + words_needed > words.len() {
                values.push(TimestampedValue::new(
                    point.id.clone(),
                    Value::Bool(false),
                    Quality::Bad,
                    "modbus",
                ));
                continue;
            }
            let raw = decode_words(&words[offset..offset + words_needed], point.data_type, config.byte_swap, config.word_swap);
            let scaled = raw.scale(point.scaling_factor, point.scaling_offset);
            let quality = if scaled.as_f64().map(|v| point.in_range(v)).unwrap_or(true) {
                Quality::Good
            } else {
                Quality::Uncertain
            };
            values.push(TimestampedValue::new(point.id.clone(), scaled, quality, "modbus"));
        }
        Ok(values)
    }
}

impl Default for ModbusDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolDriver for ModbusDriver {
    async fn initialize(&mut self, device: &DeviceDescriptor) -> Result<()> {
        let config = match &device.protocol_config {
            ProtocolConfig::Modbus(c) => c.clone(),
            _ => return Err(PulseError::Configuration("device is not a Modbus device".into())),
        };
        if !config.is_valid() {
            return Err(PulseError::Configuration("invalid Modbus configuration".into()));
        }
        self.device = Some(device.clone());
        self.config = Some(config);
        self.state = DriverState::Initialized;
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        if self.state == DriverState::Connected {
            return Ok(());
        }
        self.state = DriverState::Starting;
        let device = self.device.clone().ok_or_else(|| PulseError::Configuration("not initialized".into()))?;
        let config = self.config()?.clone();

        let connect_result: std::result::Result<Transport, std::io::Error> = match config.mode {
            ModbusMode::Tcp => {
                let addr: SocketAddr = device
                    .endpoint
                    .parse()
                    .map_err(|e| PulseError::Configuration(format!("invalid endpoint: {e}")))?;
                tcp::connect_slave(addr, Slave(config.slave_id)).await.map(Transport::Tcp)
            }
            ModbusMode::Rtu => {
                let port = config
                    .serial_port
                    .clone()
                    .ok_or_else(|| PulseError::Configuration("RTU mode requires serial_port".into()))?;
                let builder = tokio_serial::new(port, config.baudrate.unwrap_or(9600))
                    .data_bits(data_bits_from(config.data_bits))
                    .stop_bits(stop_bits_from(config.stop_bits))
                    .parity(parity_from(config.parity));
                tokio_serial::SerialStream::open(&builder)
                    .map(|serial| Transport::Rtu(rtu::attach_slave(serial, Slave(config.slave_id))))
            }
        };

        match connect_result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state = DriverState::Connected;
                self.stats.record_connection(true);
                self.last_error = ErrorInfo::success(Protocol::Modbus);
                metrics::gauge!("pulseone_driver_connected", "protocol" => "modbus").set(1.0);
                Ok(())
            }
            Err(e) => {
                self.state = DriverState::Error;
                self.stats.record_connection(false);
                metrics::gauge!("pulseone_driver_connected", "protocol" => "modbus").set(0.0);
                let err = PulseError::Io(e);
                self.last_error = err.to_error_info(Protocol::Modbus);
                Err(err)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state = DriverState::Stopping;
        self.transport = None;
        self.state = DriverState::Stopped;
        metrics::gauge!("pulseone_driver_connected", "protocol" => "modbus").set(0.0);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    async fn read_values(&mut self, points: &[PointDescriptor]) -> Result<Vec<TimestampedValue>> {
        if points.is_empty() {
            return Err(PulseError::InvalidParameter("points must be non-empty".into()));
        }
        let max_registers = self.config()?.max_registers_per_request;
        let retry_count = self.device.as_ref().map(|d| d.retry_count).unwrap_or(0);
        let frames = build_read_frames(points, max_registers, self.gap_threshold);

        let mut ordered: HashMap<String, TimestampedValue> = HashMap::new();
        let mut any_success = false;
        let mut last_err: Option<PulseError> = None;
        let started = std::time::Instant::now();

        for frame in &frames {
            let mut attempt = 0;
            loop {
                match self.read_frame(frame).await {
                    Ok(values) => {
                        any_success = true;
                        for v in values {
                            ordered.insert(v.point_id.clone(), v);
                        }
                        break;
                    }
                    Err(e) if e.is_transient() && attempt < retry_count => {
                        attempt += 1;
                        warn!(attempt, "transient modbus read failure, retrying");
                        sleep(Duration::from_millis(200)).await;
                        continue;
                    }
                    Err(e) => {
                        self.last_error = e.to_error_info(Protocol::Modbus);
                        last_err = Some(e);
                        for p in &frame.points {
                            ordered.insert(
                                p.id.clone(),
                                TimestampedValue::new(p.id.clone(), Value::Bool(false), Quality::Bad, "modbus"),
                            );
                        }
                        break;
                    }
                }
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.record_read(any_success);
        self.stats.record_response_time(elapsed_ms);
        metrics::counter!("pulseone_driver_reads_total", "protocol" => "modbus").increment(1);
        metrics::histogram!("pulseone_driver_response_time_ms", "protocol" => "modbus").record(elapsed_ms);

        if !any_success {
            if let Some(e) = last_err {
                self.state = DriverState::Reconnecting;
                return Err(e);
            }
        }

        debug!(frames = frames.len(), points = points.len(), "modbus read batch complete");
        Ok(points.iter().filter_map(|p| ordered.remove(&p.id)).collect())
    }

    async fn write_value(&mut self, point: &PointDescriptor, value: Value) -> Result<()> {
        if !point.access.is_writable() {
            return Err(PulseError::AccessDenied);
        }
        let addr = point.address_numeric.ok_or_else(|| PulseError::InvalidAddress("point has no numeric address".into()))? as u16;
        let kind = RegisterKind::from_params(&point.protocol_params);
        let ctx = self
            .transport
            .as_mut()
            .ok_or_else(|| PulseError::ConnectionLost("no active transport".into()))?
            .context();

        let result = match kind {
            RegisterKind::Coil => {
                let on = value.as_bool().unwrap_or(false);
                ctx.write_single_coil(addr, on).await
            }
            _ => {
                let raw = match &value {
                    Value::String(s) => {
                        let b = s.as_bytes();
                        let hi = *b.first().unwrap_or(&0) as u16;
                        let lo = *b.get(1).unwrap_or(&0) as u16;
                        (hi << 8) | lo
                    }
                    _ => value.as_i64().unwrap_or(0) as u16,
                };
                ctx.write_single_register(addr, raw).await
            }
        };

        metrics::counter!("pulseone_driver_writes_total", "protocol" => "modbus").increment(1);
        match result {
            Ok(Ok(())) => {
                let counter = match kind {
                    RegisterKind::Coil | RegisterKind::DiscreteInput => "coil_writes",
                    _ => "holding_register_writes",
                };
                self.stats.increment_counter(counter);
                self.stats.record_write(true);
                Ok(())
            }
            Ok(Err(exception)) => {
                self.stats.record_write(false);
                let err = exception_to_error(exception as i32);
                self.last_error = err.to_error_info(Protocol::Modbus);
                Err(err)
            }
            Err(io_err) => {
                self.stats.record_write(false);
                let err = PulseError::Io(io_err);
                self.last_error = err.to_error_info(Protocol::Modbus);
                Err(err)
            }
        }
    }

    fn statistics(&self) -> Statistics {
        self.stats.clone()
    }

    fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    fn last_error(&self) -> ErrorInfo {
        self.last_error.clone()
    }

    fn status(&self) -> DriverState {
        self.state
    }

    fn validate_address(&self, point: &PointDescriptor) -> Result<()> {
        match point.address_numeric {
            Some(addr) if addr <= u16::MAX as u32 => Ok(()),
            _ => Err(PulseError::InvalidAddress(format!(
                "modbus address must fit in 16 bits, got {:?}",
                point.address_numeric
            ))),
        }
    }
}

fn data_bits_from(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn stop_bits_from(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn parity_from(parity: char) -> tokio_serial::Parity {
    match parity {
        'E' | 'e' => tokio_serial::Parity::Even,
        'O' | 'o' => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn point(id: &str, addr: u32, data_type: DataType) -> PointDescriptor {
        PointDescriptor {
            id: id.into(),
            device_id: "dev".into(),
            name: id.into(),
            address_numeric: Some(addr),
            address_string: None,
            data_type,
            access: Access::Read,
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
            protocol_params: Map::new(),
        }
    }

    #[test]
    fn contiguous_points_merge_into_one_frame() {
        let points = vec![point("a", 100, DataType::I16), point("b", 101, DataType::I16)];
        let frames = build_read_frames(&points, 125, 4);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].start, 100);
        assert_eq!(frames[0].count, 2);
    }

    #[test]
    fn distant_points_split_into_separate_frames() {
        let points = vec![point("a", 100, DataType::I16), point("b", 200, DataType::I16)];
        let frames = build_read_frames(&points, 125, 4);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn frame_never_exceeds_max_registers_per_request() {
        let points: Vec<_> = (0..130).map(|i| point(&format!("p{i}"), 1000 + i as u32, DataType::U16)).collect();
        let frames = build_read_frames(&points, 125, 4);
        assert!(frames.iter().all(|f| f.count <= 125));
    }

    #[test]
    fn small_gap_within_threshold_still_merges() {
        let points = vec![point("a", 100, DataType::I16), point("b", 103, DataType::I16)];
        let frames = build_read_frames(&points, 125, 4);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn exception_code_2_maps_to_invalid_address() {
        assert_eq!(exception_to_error(2).category(), crate::error::ErrorCategory::InvalidAddress);
    }

    #[test]
    fn decode_i32_spans_two_registers_big_endian() {
        let v = decode_words(&[0x0001, 0x0002], DataType::I32, false, false);
        assert_eq!(v.as_i64(), Some(0x0001_0002));
    }

    #[test]
    fn decode_string_unpacks_ascii_and_trims_padding() {
        let words = [0x4849u16, 0x2000u16]; // "HI" + space + NUL padding
        let v = decode_words(&words, DataType::String, false, false);
        assert_eq!(v, Value::String("HI".to_string()));
    }

    #[test]
    fn string_word_count_honors_register_count_param() {
        let mut params = HashMap::new();
        params.insert("register_count".to_string(), "3".to_string());
        let count = RegisterKind::HoldingRegister.word_count(DataType::String, &params);
        assert_eq!(count, 3);
    }
}
