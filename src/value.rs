// src/value.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tagged union over the ground types a driver can produce or accept. Carries no
/// metadata of its own; quality and timestamp live on [`TimestampedValue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
}

impl Value {
    /// Best-effort coercion to `bool`, matching how Modbus treats the LSB of a
    /// holding register as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::I16(i) => Some(*i != 0),
            Value::U16(u) => Some(*u != 0),
            Value::I32(i) => Some(*i != 0),
            Value::U32(u) => Some(*u != 0),
            Value::I64(i) => Some(*i != 0),
            Value::U64(u) => Some(*u != 0),
            Value::F32(f) => Some(*f != 0.0),
            Value::F64(f) => Some(*f != 0.0),
            Value::String(_) => None,
        }
    }

    /// Best-effort coercion to `f64`, the type scaling math operates on.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::I16(i) => Some(*i as f64),
            Value::U16(u) => Some(*u as f64),
            Value::I32(i) => Some(*i as f64),
            Value::U32(u) => Some(*u as f64),
            Value::I64(i) => Some(*i as f64),
            Value::U64(u) => Some(*u as f64),
            Value::F32(f) => Some(*f as f64),
            Value::F64(f) => Some(*f),
            Value::String(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            Value::I16(i) => Some(*i as i64),
            Value::U16(u) => Some(*u as i64),
            Value::I32(i) => Some(*i as i64),
            Value::U32(u) => Some(*u as i64),
            Value::I64(i) => Some(*i),
            Value::U64(u) => Some(*u as i64),
            Value::F32(f) => Some(*f as i64),
            Value::F64(f) => Some(*f as i64),
            Value::String(_) => None,
        }
    }

    /// Applies `scaled = raw * factor + offset` to numeric values; non-numeric
    /// values (strings) bypass scaling and are returned unchanged.
    pub fn scale(&self, factor: f64, offset: f64) -> Value {
        match self.as_f64() {
            Some(raw) => Value::F64(raw * factor + offset),
            None => self.clone(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::String(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::I16(i) => write!(f, "{}", i),
            Value::U16(u) => write!(f, "{}", u),
            Value::I32(i) => write!(f, "{}", i),
            Value::U32(u) => write!(f, "{}", u),
            Value::I64(i) => write!(f, "{}", i),
            Value::U64(u) => write!(f, "{}", u),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Ordered quality code. `Good` and `Uncertain` are the only qualities on which
/// downstream consumers may trust the numeric value; all others mark the value as a
/// status indicator only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
    NotConnected,
    Timeout,
    Stale,
    UnderMaintenance,
    EngineerOverride,
    Unknown,
}

impl Quality {
    pub fn is_trustworthy(&self) -> bool {
        matches!(self, Quality::Good | Quality::Uncertain)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single reading or write echo produced by a driver. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedValue {
    pub point_id: String,
    pub value: Value,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl TimestampedValue {
    pub fn new(point_id: impl Into<String>, value: Value, quality: Quality, source: impl Into<String>) -> Self {
        Self {
            point_id: point_id.into(),
            value,
            quality,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    pub fn bad(point_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(point_id, Value::Bool(false), Quality::Bad, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn scale_applies_linear_transform() {
        let raw = Value::I32(500);
        let scaled = raw.scale(0.1, -40.0);
        assert_eq!(scaled.as_f64(), Some(10.0));
    }

    #[test]
    fn quality_ordering_places_good_first() {
        assert!(Quality::Good < Quality::Uncertain);
        assert!(Quality::Uncertain < Quality::Bad);
    }

    #[test]
    fn quality_trustworthiness_ordering() {
        assert!(Quality::Good.is_trustworthy());
        assert!(Quality::Uncertain.is_trustworthy());
        assert!(!Quality::Bad.is_trustworthy());
        assert!(!Quality::Stale.is_trustworthy());
    }

    #[test]
    fn value_round_trips_through_json() {
        let v = Value::F64(3.25);
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn bool_coercion_treats_nonzero_as_true() {
        assert_eq!(Value::I16(0).as_bool(), Some(false));
        assert_eq!(Value::I16(7).as_bool(), Some(true));
    }

    #[test]
    fn string_value_bypasses_scaling_and_numeric_coercion() {
        let v = Value::String("door_open".to_string());
        assert_eq!(v.as_f64(), None);
        assert_eq!(v.as_bool(), None);
        assert_eq!(v.scale(0.1, -40.0), v);
        assert_eq!(v.type_name(), "string");
    }

    #[test]
    fn string_value_round_trips_through_json() {
        let v = Value::String("ok".to_string());
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    proptest! {
        #[test]
        fn scale_matches_linear_formula_for_any_numeric_value(raw: i32, factor in -1000.0f64..1000.0, offset in -1000.0f64..1000.0) {
            let v = Value::I32(raw);
            let scaled = v.scale(factor, offset);
            let expected = raw as f64 * factor + offset;
            prop_assert!((scaled.as_f64().unwrap() - expected).abs() < 1e-6);
        }

        #[test]
        fn scale_never_panics_on_string_values(s in ".*", factor in -1000.0f64..1000.0, offset in -1000.0f64..1000.0) {
            let v = Value::String(s);
            let scaled = v.scale(factor, offset);
            prop_assert_eq!(scaled, v);
        }
    }
}
