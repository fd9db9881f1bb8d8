//! MySQL value mapping
//!
//! Converts `mysql_async` values, from binlog rows events or from snapshot
//! queries, into the closed [`SqlValue`] set. The INFORMATION_SCHEMA
//! `DATA_TYPE` of the column selects the interpretation of raw bytes.
//!
//! | MySQL type                                  | SqlValue                  |
//! |---------------------------------------------|---------------------------|
//! | TINYINT..BIGINT, YEAR                       | Integer                   |
//! | BIGINT UNSIGNED above i64::MAX              | Decimal                   |
//! | DECIMAL, NUMERIC, FLOAT, DOUBLE             | Decimal                   |
//! | CHAR, VARCHAR, TEXT, ENUM, SET, UTF-8 BLOB  | String                    |
//! | DATE, DATETIME, TIMESTAMP                   | Timestamp (UTC)           |
//! | BIT(1)                                      | Boolean                   |
//! | TIME, JSON, spatial, wider BIT              | decode error              |

use crate::common::{CdcError, Result, SqlValue};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use mysql_async::binlog::value::BinlogValue;
use mysql_async::Value;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Column metadata from INFORMATION_SCHEMA.COLUMNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// `DATA_TYPE`, lowercase (`varchar`, `decimal`, ...)
    pub data_type: String,
    /// `COLUMN_TYPE`, lowercase (`bit(1)`, `enum('a','b')`, ...)
    pub column_type: String,
}

impl ColumnInfo {
    pub fn new(
        name: impl Into<String>,
        data_type: impl Into<String>,
        column_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into().to_ascii_lowercase(),
            column_type: column_type.into().to_ascii_lowercase(),
        }
    }

    fn unsupported(&self, detail: &str) -> CdcError {
        CdcError::decode(format!(
            "unsupported value for column '{}' of type {}: {}",
            self.name, self.column_type, detail
        ))
    }
}

/// Map a binlog row value.
pub fn decode_binlog_value(value: &BinlogValue<'_>, column: &ColumnInfo) -> Result<SqlValue> {
    match value {
        BinlogValue::Value(v) => decode_value(v, column),
        _ => Err(column.unsupported("JSON values are not supported")),
    }
}

/// Map a protocol value.
pub fn decode_value(value: &Value, column: &ColumnInfo) -> Result<SqlValue> {
    match value {
        Value::NULL => Ok(SqlValue::Null),
        Value::Int(i) => decode_int(*i, column),
        Value::UInt(u) => Ok(unsigned(*u)),
        Value::Float(f) => float_to_decimal(f64::from(*f), column),
        Value::Double(f) => float_to_decimal(*f, column),
        // Zero dates (`0000-00-00`, or a zero month/day) have no calendar value
        Value::Date(year, month, day, ..) if *year == 0 || *month == 0 || *day == 0 => Ok(SqlValue::Null),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let ts = NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))
                .and_then(|d| {
                    d.and_hms_micro_opt(u32::from(*hour), u32::from(*minute), u32::from(*second), *micros)
                })
                .ok_or_else(|| column.unsupported("invalid date"))?;
            Ok(SqlValue::Timestamp(ts.and_utc()))
        }
        Value::Time(..) => Err(column.unsupported("TIME values are not supported")),
        Value::Bytes(bytes) => decode_bytes(bytes, column),
    }
}

/// Convert a value back to a query parameter (keyset cursors).
pub fn to_param(value: &SqlValue) -> Value {
    match value {
        SqlValue::String(s) => Value::Bytes(s.as_bytes().to_vec()),
        SqlValue::Integer(i) => Value::Int(*i),
        SqlValue::Decimal(d) => Value::Bytes(d.to_string().into_bytes()),
        SqlValue::Timestamp(ts) => Value::Bytes(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string().into_bytes()),
        SqlValue::Boolean(b) => Value::Int(i64::from(*b)),
        SqlValue::Null => Value::NULL,
    }
}

fn decode_int(i: i64, column: &ColumnInfo) -> Result<SqlValue> {
    match column.data_type.as_str() {
        // Binlog encodes ENUM as the 1-based label index and SET as a bitmask.
        "enum" => enum_label(&column.column_type, i)
            .map(SqlValue::String)
            .ok_or_else(|| column.unsupported(&format!("enum index {i}"))),
        "set" => set_labels(&column.column_type, i)
            .map(SqlValue::String)
            .ok_or_else(|| column.unsupported(&format!("set bitmask {i}"))),
        _ if column.column_type.contains("unsigned") && i < 0 => {
            // Unsigned column delivered through a signed wire type.
            let width = unsigned_width(&column.data_type);
            let u = (i as u64) & width;
            Ok(unsigned(u))
        }
        _ => Ok(SqlValue::Integer(i)),
    }
}

fn unsigned_width(data_type: &str) -> u64 {
    match data_type {
        "tinyint" => u64::from(u8::MAX),
        "smallint" => u64::from(u16::MAX),
        "mediumint" => 0x00FF_FFFF,
        "int" | "integer" => u64::from(u32::MAX),
        _ => u64::MAX,
    }
}

fn unsigned(u: u64) -> SqlValue {
    match i64::try_from(u) {
        Ok(i) => SqlValue::Integer(i),
        Err(_) => SqlValue::Decimal(Decimal::from(u)),
    }
}

fn float_to_decimal(f: f64, column: &ColumnInfo) -> Result<SqlValue> {
    Decimal::try_from(f)
        .map(SqlValue::Decimal)
        .map_err(|_| column.unsupported(&format!("float {f} has no exact decimal form")))
}

fn decode_bytes(bytes: &[u8], column: &ColumnInfo) -> Result<SqlValue> {
    match column.data_type.as_str() {
        "bit" => {
            if column.column_type != "bit(1)" {
                return Err(column.unsupported("only BIT(1) is supported"));
            }
            Ok(SqlValue::Boolean(bytes.iter().any(|b| *b != 0)))
        }
        "json" => Err(column.unsupported("JSON values are not supported")),
        "time" => Err(column.unsupported("TIME values are not supported")),
        "geometry" | "point" | "linestring" | "polygon" | "multipoint" | "multilinestring"
        | "multipolygon" | "geometrycollection" | "geomcollection" => {
            Err(column.unsupported("spatial values are not supported"))
        }
        _ => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| column.unsupported("bytes are not valid UTF-8"))?;
            decode_text(text, column)
        }
    }
}

fn decode_text(text: &str, column: &ColumnInfo) -> Result<SqlValue> {
    match column.data_type.as_str() {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => {
            if let Ok(i) = text.parse::<i64>() {
                Ok(SqlValue::Integer(i))
            } else {
                text.parse::<u64>()
                    .map(unsigned)
                    .map_err(|_| column.unsupported(&format!("integer text '{text}'")))
            }
        }
        "decimal" | "numeric" | "float" | "double" | "real" => Decimal::from_str(text)
            .or_else(|_| Decimal::from_scientific(text))
            .map(SqlValue::Decimal)
            .map_err(|_| column.unsupported(&format!("decimal text '{text}'"))),
        "timestamp" | "datetime" | "date" if is_zero_date(text) => Ok(SqlValue::Null),
        "timestamp" | "datetime" | "date" => parse_timestamp(text)
            .map(SqlValue::Timestamp)
            .ok_or_else(|| column.unsupported(&format!("timestamp text '{text}'"))),
        _ => Ok(SqlValue::String(text.to_string())),
    }
}

/// `YYYY-MM-DD...` text with a zero year, month or day.
fn is_zero_date(text: &str) -> bool {
    let date = text.split(' ').next().unwrap_or_default();
    let parts: Vec<&str> = date.split('-').collect();
    parts.len() == 3 && parts.iter().any(|p| p.parse::<u32>() == Ok(0))
}

/// Parse the textual timestamp forms MySQL produces.
///
/// Binlog TIMESTAMP columns arrive as `seconds[.fraction]` since the epoch;
/// text-protocol results arrive as `YYYY-MM-DD[ HH:MM:SS[.ffffff]]`.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if !text.contains('-') {
        let (secs, frac) = text.split_once('.').unwrap_or((text, ""));
        let secs: i64 = secs.parse().ok()?;
        let micros = if frac.is_empty() {
            0
        } else {
            let digits: String = frac.chars().chain(std::iter::repeat('0')).take(6).collect();
            digits.parse::<u32>().ok()?
        };
        return DateTime::from_timestamp(secs, micros * 1_000);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn type_labels(column_type: &str) -> Option<Vec<String>> {
    let inner = column_type
        .split_once('(')
        .and_then(|(_, rest)| rest.strip_suffix(')'))?;
    let labels = inner
        .trim_matches('\'')
        .split("','")
        .map(|s| s.replace("''", "'"))
        .collect();
    Some(labels)
}

fn enum_label(column_type: &str, index: i64) -> Option<String> {
    let labels = type_labels(column_type)?;
    if index == 0 {
        return Some(String::new());
    }
    let idx = usize::try_from(index - 1).ok()?;
    labels.get(idx).cloned()
}

fn set_labels(column_type: &str, mask: i64) -> Option<String> {
    let labels = type_labels(column_type)?;
    let mask = mask as u64;
    if labels.len() < 64 && mask >> labels.len() != 0 {
        return None;
    }
    let picked: Vec<&str> = labels
        .iter()
        .enumerate()
        .filter(|(i, _)| mask & (1u64 << i) != 0)
        .map(|(_, l)| l.as_str())
        .collect();
    Some(picked.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(data_type: &str, column_type: &str) -> ColumnInfo {
        ColumnInfo::new("c", data_type, column_type)
    }

    #[test]
    fn test_integers() {
        let int = col("int", "int");
        assert_eq!(decode_value(&Value::Int(-5), &int).unwrap(), SqlValue::Integer(-5));
        assert_eq!(
            decode_value(&Value::UInt(u64::MAX), &col("bigint", "bigint unsigned")).unwrap(),
            SqlValue::Decimal(Decimal::from(u64::MAX))
        );
        assert_eq!(
            decode_value(&Value::Int(-1), &col("int", "int unsigned")).unwrap(),
            SqlValue::Integer(i64::from(u32::MAX))
        );
        assert_eq!(
            decode_value(&Value::Bytes(b"42".to_vec()), &int).unwrap(),
            SqlValue::Integer(42)
        );
    }

    #[test]
    fn test_decimal_text_is_exact() {
        let value = decode_value(&Value::Bytes(b"12345.6789".to_vec()), &col("decimal", "decimal(10,4)")).unwrap();
        assert_eq!(value, SqlValue::Decimal(Decimal::from_str("12345.6789").unwrap()));
    }

    #[test]
    fn test_timestamps() {
        let dt = decode_value(&Value::Date(2024, 3, 1, 12, 30, 0, 250), &col("datetime", "datetime(6)")).unwrap();
        assert_eq!(dt.to_json(), serde_json::json!("2024-03-01T12:30:00.000250Z"));

        let ts = decode_value(&Value::Bytes(b"1700000000.5".to_vec()), &col("timestamp", "timestamp(1)")).unwrap();
        assert_eq!(ts.to_json(), serde_json::json!("2023-11-14T22:13:20.500000Z"));

        assert!(decode_value(&Value::Date(2024, 2, 30, 0, 0, 0, 0), &col("date", "date")).is_err());
    }

    #[test]
    fn test_zero_dates_are_null() {
        let date = col("date", "date");
        let datetime = col("datetime", "datetime");
        assert_eq!(decode_value(&Value::Date(0, 0, 0, 0, 0, 0, 0), &date).unwrap(), SqlValue::Null);
        assert_eq!(decode_value(&Value::Date(2024, 0, 0, 0, 0, 0, 0), &datetime).unwrap(), SqlValue::Null);
        assert_eq!(
            decode_value(&Value::Bytes(b"0000-00-00 00:00:00".to_vec()), &datetime).unwrap(),
            SqlValue::Null
        );
        assert_eq!(decode_value(&Value::Bytes(b"2024-05-00".to_vec()), &date).unwrap(), SqlValue::Null);
        assert!(decode_value(&Value::Bytes(b"2024-05-01".to_vec()), &date).unwrap() != SqlValue::Null);
    }

    #[test]
    fn test_bit_and_strings() {
        assert_eq!(
            decode_value(&Value::Bytes(vec![1]), &col("bit", "bit(1)")).unwrap(),
            SqlValue::Boolean(true)
        );
        assert!(decode_value(&Value::Bytes(vec![1, 0]), &col("bit", "bit(16)")).is_err());
        assert_eq!(
            decode_value(&Value::Bytes(b"hello".to_vec()), &col("varchar", "varchar(20)")).unwrap(),
            SqlValue::String("hello".into())
        );
        assert!(decode_value(&Value::Bytes(vec![0xff, 0xfe]), &col("blob", "blob")).is_err());
    }

    #[test]
    fn test_enum_and_set() {
        let e = col("enum", "enum('new','paid','it''s')");
        assert_eq!(decode_value(&Value::Int(2), &e).unwrap(), SqlValue::String("paid".into()));
        assert_eq!(decode_value(&Value::Int(3), &e).unwrap(), SqlValue::String("it's".into()));
        assert!(decode_value(&Value::Int(9), &e).is_err());

        let s = col("set", "set('a','b','c')");
        assert_eq!(decode_value(&Value::Int(0b101), &s).unwrap(), SqlValue::String("a,c".into()));
    }

    #[test]
    fn test_unsupported_types_fail() {
        assert!(decode_value(&Value::Time(false, 0, 1, 2, 3, 0), &col("time", "time")).is_err());
        let err = decode_value(&Value::Bytes(b"{}".to_vec()), &col("json", "json")).unwrap_err();
        assert!(matches!(err, CdcError::Decode(_)));
    }

    #[test]
    fn test_to_param() {
        assert_eq!(to_param(&SqlValue::Integer(7)), Value::Int(7));
        assert_eq!(to_param(&SqlValue::String("k".into())), Value::Bytes(b"k".to_vec()));
        assert_eq!(to_param(&SqlValue::Null), Value::NULL);
    }
}
