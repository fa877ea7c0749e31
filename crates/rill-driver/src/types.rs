//! Portable value types crossing the driver boundary
//!
//! Every row value a driver yields is coerced to one of these kinds before it
//! leaves the driver, so the protocol layer never sees backend-specific
//! wrappers. The wire encoding is plain JSON scalars:
//! - integers and floats as JSON numbers
//! - decimals as strings (lossless)
//! - timestamps as RFC 3339 strings, dates as `YYYY-MM-DD`
//! - uuids as hyphenated strings, bytes as base64

use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::ser::{Serialize, Serializer};
use uuid::Uuid;

/// A single column value in its portable form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer (all backend integer widths widen to this)
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Instant in UTC (TIMESTAMP, TIMESTAMPTZ)
    Timestamp(DateTime<Utc>),
    /// Date without time
    Date(NaiveDate),
    /// UUID
    Uuid(Uuid),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Kind name, used in decode-failure messages
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Timestamp(_) => "timestamp",
            Self::Date(_) => "date",
            Self::Uuid(_) => "uuid",
        }
    }

    /// Try to read as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to read as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to read as str
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// The wire representation of this value.
    ///
    /// Encoding a decoded value again yields the same JSON, which is what
    /// lets clients round-trip rows without loss.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("portable values always serialize")
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(n) => serializer.serialize_i64(*n),
            Self::Float(n) => serializer.serialize_f64(*n),
            Self::Decimal(d) => serializer.serialize_str(&d.to_string()),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Bytes(b) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b))
            }
            Self::Timestamp(t) => serializer.serialize_str(&t.to_rfc3339()),
            Self::Date(d) => serializer.serialize_str(&d.format("%Y-%m-%d").to_string()),
            Self::Uuid(u) => serializer.serialize_str(&u.to_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_null() {
        assert!(Value::Null.is_null());
        assert!(!Value::Int(0).is_null());
        assert_eq!(Value::Null.to_wire(), serde_json::Value::Null);
    }

    #[test]
    fn test_from_impls() {
        assert_eq!(Value::from(42_i32), Value::Int(42));
        assert_eq!(Value::from(1.5_f64), Value::Float(1.5));
        assert_eq!(Value::from("x"), Value::Text("x".into()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(7_i64)), Value::Int(7));
    }

    #[test]
    fn test_scalar_wire_encoding() {
        assert_eq!(Value::Int(5).to_wire(), serde_json::json!(5));
        assert_eq!(Value::Bool(true).to_wire(), serde_json::json!(true));
        assert_eq!(Value::Text("alpha".into()).to_wire(), serde_json::json!("alpha"));
        assert_eq!(Value::Float(2.5).to_wire(), serde_json::json!(2.5));
    }

    #[test]
    fn test_temporal_wire_encoding() {
        let ts = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            Value::Timestamp(ts).to_wire(),
            serde_json::json!("2024-06-01T12:00:00+00:00")
        );

        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert_eq!(Value::Date(date).to_wire(), serde_json::json!("2024-06-01"));
    }

    #[test]
    fn test_decimal_is_lossless() {
        let d = Decimal::from_str("12345678901234567890.12345").unwrap();
        assert_eq!(
            Value::Decimal(d).to_wire(),
            serde_json::json!("12345678901234567890.12345")
        );
    }

    #[test]
    fn test_wire_encoding_is_idempotent() {
        let values = vec![
            Value::Null,
            Value::Bool(false),
            Value::Int(-9),
            Value::Float(0.25),
            Value::Decimal(Decimal::from_str("1.50").unwrap()),
            Value::Text("hello".into()),
            Value::Bytes(vec![1, 2, 3]),
            Value::Uuid(Uuid::from_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap()),
        ];
        for v in values {
            let first = v.to_wire();
            let second = v.to_wire();
            assert_eq!(first, second, "{} encoding must be stable", v.kind());
        }
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(3).as_i64(), Some(3));
        assert_eq!(Value::Text("12".into()).as_i64(), Some(12));
        assert_eq!(Value::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::Text("a".into()).as_str(), Some("a"));
        assert_eq!(Value::Bool(true).as_i64(), None);
    }
}
