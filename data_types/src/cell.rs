//! Typed CDC cells and their decoding into native values.
//!
//! The stream transport hands cells over as a type tag plus a wire
//! payload; numeric payloads arrive as strings and are parsed here,
//! once, at the decode boundary. Sinks only ever see [`CellValue`].

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Decoding failures for a single cell.
#[derive(Debug, Error)]
pub enum CellDecodeError {
    /// The transport presented a type tag this consumer does not handle.
    #[error("unsupported cell type: {name}")]
    UnsupportedType { name: String },

    /// The payload does not match the tag's representation.
    #[error("malformed {tag} cell: {message}")]
    Malformed { tag: &'static str, message: String },
}

/// The CQL-like type tag carried by a wire cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellTag {
    Text,
    Ascii,
    Inet,
    Date,
    Int,
    SmallInt,
    TinyInt,
    BigInt,
    Counter,
    Float,
    Decimal,
    Double,
    Boolean,
    Timestamp,
    Blob,
}

impl CellTag {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Ascii => "ASCII",
            Self::Inet => "INET",
            Self::Date => "DATE",
            Self::Int => "INT",
            Self::SmallInt => "SMALLINT",
            Self::TinyInt => "TINYINT",
            Self::BigInt => "BIGINT",
            Self::Counter => "COUNTER",
            Self::Float => "FLOAT",
            Self::Decimal => "DECIMAL",
            Self::Double => "DOUBLE",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::Blob => "BLOB",
        }
    }

    /// Resolves a wire tag name. Unknown names are an
    /// [`CellDecodeError::UnsupportedType`] so the record they belong to
    /// fails rather than being silently mis-typed.
    pub fn parse(name: &str) -> Result<Self, CellDecodeError> {
        match name.to_ascii_uppercase().as_str() {
            "TEXT" => Ok(Self::Text),
            "ASCII" => Ok(Self::Ascii),
            "INET" => Ok(Self::Inet),
            "DATE" => Ok(Self::Date),
            "INT" => Ok(Self::Int),
            "SMALLINT" => Ok(Self::SmallInt),
            "TINYINT" => Ok(Self::TinyInt),
            "BIGINT" => Ok(Self::BigInt),
            "COUNTER" => Ok(Self::Counter),
            "FLOAT" => Ok(Self::Float),
            "DECIMAL" => Ok(Self::Decimal),
            "DOUBLE" => Ok(Self::Double),
            "BOOLEAN" => Ok(Self::Boolean),
            "TIMESTAMP" => Ok(Self::Timestamp),
            "BLOB" => Ok(Self::Blob),
            other => Err(CellDecodeError::UnsupportedType {
                name: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for CellTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The wire representation of a cell's value.
///
/// Text-like, numeric, date, decimal and timestamp cells all arrive as
/// strings; only booleans and blobs have dedicated representations.
#[derive(Debug, Clone, PartialEq)]
pub enum CellPayload {
    Text(String),
    Bool(bool),
    Blob(Vec<u8>),
}

/// One raw cell as fetched from the stream: a tag plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CdcCell {
    pub tag: CellTag,
    pub payload: CellPayload,
}

impl CdcCell {
    pub fn text(tag: CellTag, payload: impl Into<String>) -> Self {
        Self {
            tag,
            payload: CellPayload::Text(payload.into()),
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self {
            tag: CellTag::Boolean,
            payload: CellPayload::Bool(value),
        }
    }

    pub fn blob(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: CellTag::Blob,
            payload: CellPayload::Blob(bytes.into()),
        }
    }

    /// Decodes the wire payload into the native value the tag promises.
    pub fn decode(&self) -> Result<CellValue, CellDecodeError> {
        let tag = self.tag.name();
        match (self.tag, &self.payload) {
            (CellTag::Text | CellTag::Ascii | CellTag::Inet, CellPayload::Text(s)) => {
                Ok(CellValue::Text(s.clone()))
            }
            (CellTag::Date, CellPayload::Text(s)) => NaiveDate::from_str(s)
                .map(CellValue::Date)
                .map_err(|e| malformed(tag, e)),
            (CellTag::Int | CellTag::SmallInt | CellTag::TinyInt, CellPayload::Text(s)) => s
                .parse::<i32>()
                .map(CellValue::Int)
                .map_err(|e| malformed(tag, e)),
            (CellTag::BigInt | CellTag::Counter, CellPayload::Text(s)) => s
                .parse::<i64>()
                .map(CellValue::BigInt)
                .map_err(|e| malformed(tag, e)),
            (CellTag::Float, CellPayload::Text(s)) => s
                .parse::<f32>()
                .map(CellValue::Float)
                .map_err(|e| malformed(tag, e)),
            (CellTag::Decimal, CellPayload::Text(s)) => BigDecimal::from_str(s)
                .map(CellValue::Decimal)
                .map_err(|e| malformed(tag, e)),
            (CellTag::Double, CellPayload::Text(s)) => s
                .parse::<f64>()
                .map(CellValue::Double)
                .map_err(|e| malformed(tag, e)),
            (CellTag::Timestamp, CellPayload::Text(s)) => s
                .parse::<i64>()
                .map(CellValue::Timestamp)
                .map_err(|e| malformed(tag, e)),
            (CellTag::Boolean, CellPayload::Bool(b)) => Ok(CellValue::Boolean(*b)),
            (CellTag::Blob, CellPayload::Blob(b)) => Ok(CellValue::Blob(b.clone())),
            (_, payload) => Err(CellDecodeError::Malformed {
                tag: self.tag.name(),
                message: format!("payload {payload:?} does not match tag"),
            }),
        }
    }
}

fn malformed(tag: &'static str, error: impl fmt::Display) -> CellDecodeError {
    CellDecodeError::Malformed {
        tag,
        message: error.to_string(),
    }
}

/// A decoded, native cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Date(NaiveDate),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Decimal(BigDecimal),
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Blob(Vec<u8>),
}

impl CellValue {
    /// Re-encodes into a wire cell with the canonical tag for the value's
    /// type. Tags that share a native type (ASCII/INET, SMALLINT/TINYINT,
    /// COUNTER) collapse to the canonical one.
    pub fn encode(&self) -> CdcCell {
        match self {
            Self::Text(s) => CdcCell::text(CellTag::Text, s.clone()),
            Self::Date(d) => CdcCell::text(CellTag::Date, d.to_string()),
            Self::Int(v) => CdcCell::text(CellTag::Int, v.to_string()),
            Self::BigInt(v) => CdcCell::text(CellTag::BigInt, v.to_string()),
            Self::Float(v) => CdcCell::text(CellTag::Float, v.to_string()),
            Self::Double(v) => CdcCell::text(CellTag::Double, v.to_string()),
            Self::Decimal(v) => CdcCell::text(CellTag::Decimal, v.to_string()),
            Self::Boolean(v) => CdcCell::boolean(*v),
            Self::Timestamp(v) => CdcCell::text(CellTag::Timestamp, v.to_string()),
            Self::Blob(b) => CdcCell::blob(b.clone()),
        }
    }

    /// A short name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Date(_) => "date",
            Self::Int(_) => "int",
            Self::BigInt(_) => "bigint",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Decimal(_) => "decimal",
            Self::Boolean(_) => "boolean",
            Self::Timestamp(_) => "timestamp",
            Self::Blob(_) => "blob",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the value for JSON payloads. Decimals keep their full
    /// precision as strings; blobs are base64.
    pub fn to_json(&self) -> serde_json::Value {
        use base64::Engine;
        use serde_json::Value;

        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Date(d) => Value::String(d.to_string()),
            Self::Int(v) => Value::Number((*v).into()),
            Self::BigInt(v) => Value::Number((*v).into()),
            Self::Float(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Double(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Decimal(v) => Value::String(v.to_string()),
            Self::Boolean(v) => Value::Bool(*v),
            Self::Timestamp(v) => Value::Number((*v).into()),
            Self::Blob(b) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_every_tag() {
        let cases = [
            (
                CdcCell::text(CellTag::Text, "hello"),
                CellValue::Text("hello".into()),
            ),
            (
                CdcCell::text(CellTag::Ascii, "ascii"),
                CellValue::Text("ascii".into()),
            ),
            (
                CdcCell::text(CellTag::Inet, "10.0.0.1"),
                CellValue::Text("10.0.0.1".into()),
            ),
            (
                CdcCell::text(CellTag::Date, "2024-02-29"),
                CellValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
            ),
            (CdcCell::text(CellTag::Int, "-7"), CellValue::Int(-7)),
            (CdcCell::text(CellTag::SmallInt, "300"), CellValue::Int(300)),
            (CdcCell::text(CellTag::TinyInt, "12"), CellValue::Int(12)),
            (
                CdcCell::text(CellTag::BigInt, "9000000000"),
                CellValue::BigInt(9_000_000_000),
            ),
            (
                CdcCell::text(CellTag::Counter, "41"),
                CellValue::BigInt(41),
            ),
            (CdcCell::text(CellTag::Float, "1.5"), CellValue::Float(1.5)),
            (
                CdcCell::text(CellTag::Decimal, "123456789.000000001"),
                CellValue::Decimal("123456789.000000001".parse().unwrap()),
            ),
            (
                CdcCell::text(CellTag::Double, "2.25"),
                CellValue::Double(2.25),
            ),
            (CdcCell::boolean(true), CellValue::Boolean(true)),
            (
                CdcCell::text(CellTag::Timestamp, "1626432192000"),
                CellValue::Timestamp(1_626_432_192_000),
            ),
            (
                CdcCell::blob(vec![0xde, 0xad]),
                CellValue::Blob(vec![0xde, 0xad]),
            ),
        ];

        for (cell, expected) in cases {
            assert_eq!(cell.decode().unwrap(), expected, "cell {cell:?}");
        }
    }

    #[test]
    fn test_decode_encode_round_trip() {
        let values = [
            CellValue::Text("snowflake".into()),
            CellValue::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
            CellValue::Int(i32::MIN),
            CellValue::BigInt(i64::MAX),
            CellValue::Float(0.1),
            CellValue::Double(-1234.5678),
            CellValue::Decimal("0.100000000000000000001".parse().unwrap()),
            CellValue::Boolean(false),
            CellValue::Timestamp(0),
            CellValue::Blob(vec![1, 2, 3]),
        ];

        for value in values {
            assert_eq!(value.encode().decode().unwrap(), value, "value {value:?}");
        }
    }

    #[test]
    fn test_unknown_tag_is_unsupported() {
        let err = CellTag::parse("duration").unwrap_err();
        assert!(matches!(
            err,
            CellDecodeError::UnsupportedType { name } if name == "DURATION"
        ));
    }

    #[test]
    fn test_malformed_payloads() {
        let bad_int = CdcCell::text(CellTag::Int, "twelve").decode().unwrap_err();
        assert!(matches!(bad_int, CellDecodeError::Malformed { tag: "INT", .. }));

        let mismatched = CdcCell {
            tag: CellTag::Boolean,
            payload: CellPayload::Text("true".into()),
        }
        .decode()
        .unwrap_err();
        assert!(matches!(
            mismatched,
            CellDecodeError::Malformed { tag: "BOOLEAN", .. }
        ));
    }

    #[test]
    fn test_json_rendering() {
        assert_eq!(
            CellValue::Int(7).to_json(),
            serde_json::Value::Number(7.into())
        );
        assert_eq!(
            CellValue::Text("x".into()).to_json(),
            serde_json::Value::String("x".into())
        );
        assert_eq!(
            CellValue::Decimal("1.10".parse().unwrap()).to_json(),
            serde_json::Value::String("1.10".into())
        );
        assert_eq!(
            CellValue::Blob(vec![0xff]).to_json(),
            serde_json::Value::String("/w==".into())
        );
    }
}
