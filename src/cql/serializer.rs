use chrono::{Duration, NaiveDate, NaiveTime};
use num_bigint::BigInt;
use scylla::frame::response::result::{CqlValue, Row};
use serde_json::{Map, Value};

use super::{ColumnMeta, CqlTypeTag};
use crate::error::ReplicationError;

/// Field-by-field rendering of a driver row into the JSON payload shape the
/// target accepts, used when the server-side `SELECT JSON` representation is
/// lossy for the configured types. Dispatch is a single switch over the
/// schema type tag, mirroring the literal codec.
pub fn row_to_json(
    columns: &[ColumnMeta],
    row: &Row,
) -> Result<Map<String, Value>, ReplicationError> {
    let mut payload = Map::with_capacity(columns.len());
    for (meta, cell) in columns.iter().zip(row.columns.iter()) {
        let rendered = match cell {
            Some(value) => cql_value_to_json(&meta.tag, value)?,
            None => Value::Null,
        };
        payload.insert(meta.name.clone(), rendered);
    }
    Ok(payload)
}

fn cql_value_to_json(tag: &CqlTypeTag, value: &CqlValue) -> Result<Value, ReplicationError> {
    if matches!(value, CqlValue::Empty) {
        return Ok(Value::Null);
    }

    let mismatch = || {
        ReplicationError::CassandraType(format!(
            "driver value {value:?} does not match declared type {tag:?}"
        ))
    };

    Ok(match (tag, value) {
        (CqlTypeTag::Ascii | CqlTypeTag::Text | CqlTypeTag::Varchar, CqlValue::Ascii(s))
        | (CqlTypeTag::Ascii | CqlTypeTag::Text | CqlTypeTag::Varchar, CqlValue::Text(s)) => {
            Value::String(s.clone())
        }
        (CqlTypeTag::Int, CqlValue::Int(n)) => Value::from(*n),
        (CqlTypeTag::Smallint, CqlValue::SmallInt(n)) => Value::from(*n),
        (CqlTypeTag::Tinyint, CqlValue::TinyInt(n)) => Value::from(*n),
        (CqlTypeTag::Bigint, CqlValue::BigInt(n)) => Value::from(*n),
        (CqlTypeTag::Float, CqlValue::Float(f)) => {
            serde_json::Number::from_f64(*f as f64).map(Value::Number).unwrap_or(Value::Null)
        }
        (CqlTypeTag::Double, CqlValue::Double(f)) => {
            serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
        }
        (CqlTypeTag::Boolean, CqlValue::Boolean(b)) => Value::Bool(*b),
        (CqlTypeTag::Blob, CqlValue::Blob(bytes)) => {
            Value::String(format!("0x{}", hex::encode(bytes)))
        }
        (CqlTypeTag::Uuid, CqlValue::Uuid(u)) => Value::String(u.to_string()),
        (CqlTypeTag::Timeuuid, CqlValue::Timeuuid(u)) => Value::String(u.to_string()),
        (CqlTypeTag::Inet, CqlValue::Inet(addr)) => Value::String(addr.to_string()),
        (CqlTypeTag::Timestamp, CqlValue::Timestamp(ts)) => Value::from(ts.0),
        (CqlTypeTag::Date, CqlValue::Date(d)) => {
            let days = d.0 as i64 - (1i64 << 31);
            let date = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap() + Duration::days(days);
            Value::String(date.format("%Y-%m-%d").to_string())
        }
        (CqlTypeTag::Time, CqlValue::Time(t)) => {
            let secs = (t.0 / 1_000_000_000) as u32;
            let nanos = (t.0 % 1_000_000_000) as u32;
            let time = NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                .ok_or_else(mismatch)?;
            Value::String(time.format("%H:%M:%S%.9f").to_string())
        }
        (CqlTypeTag::Varint, CqlValue::Varint(v)) => {
            Value::String(BigInt::from_signed_bytes_be(v.as_signed_bytes_be_slice()).to_string())
        }
        (CqlTypeTag::Decimal, CqlValue::Decimal(d)) => {
            let (bytes, scale) = d.as_signed_be_bytes_slice_and_exponent();
            Value::String(format_decimal(BigInt::from_signed_bytes_be(bytes), scale))
        }
        (CqlTypeTag::List(inner), CqlValue::List(items)) => Value::Array(
            items
                .iter()
                .map(|item| cql_value_to_json(inner, item))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        _ => return Err(mismatch()),
    })
}

/// `unscaled * 10^(-scale)` as plain decimal text.
fn format_decimal(unscaled: BigInt, scale: i32) -> String {
    if scale <= 0 {
        let mut s = unscaled.to_string();
        s.extend(std::iter::repeat('0').take((-scale) as usize));
        return s;
    }

    let negative = unscaled.sign() == num_bigint::Sign::Minus;
    let mut digits = unscaled.magnitude().to_string();
    let scale = scale as usize;
    if digits.len() <= scale {
        digits = format!("{}{}", "0".repeat(scale - digits.len() + 1), digits);
    }
    let point = digits.len() - scale;
    let rendered = format!("{}.{}", &digits[..point], &digits[point..]);
    if negative {
        format!("-{rendered}")
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scylla::frame::value::{CqlTimestamp, CqlTimeuuid};

    fn render(tag: CqlTypeTag, v: CqlValue) -> Value {
        cql_value_to_json(&tag, &v).unwrap()
    }

    #[test]
    fn scalar_values_round_trip() {
        assert_eq!(render(CqlTypeTag::Text, CqlValue::Text("x".into())), Value::from("x"));
        assert_eq!(render(CqlTypeTag::Bigint, CqlValue::BigInt(-7)), Value::from(-7));
        assert_eq!(render(CqlTypeTag::Boolean, CqlValue::Boolean(true)), Value::from(true));
        assert_eq!(
            render(CqlTypeTag::Timestamp, CqlValue::Timestamp(CqlTimestamp(1700000000000))),
            Value::from(1700000000000_i64)
        );
    }

    #[test]
    fn blobs_render_as_prefixed_hex() {
        assert_eq!(
            render(CqlTypeTag::Blob, CqlValue::Blob(vec![0xde, 0xad])),
            Value::from("0xdead")
        );
        assert_eq!(render(CqlTypeTag::Blob, CqlValue::Blob(vec![])), Value::from("0x"));
    }

    #[test]
    fn timeuuid_renders_as_uuid_text() {
        let u = CqlTimeuuid::from(uuid::Uuid::from_bytes([0x11; 16]));
        assert_eq!(
            render(CqlTypeTag::Timeuuid, CqlValue::Timeuuid(u)),
            Value::from("11111111-1111-1111-1111-111111111111")
        );
    }

    #[test]
    fn lists_recurse_on_the_element_type() {
        let v = CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2)]);
        assert_eq!(
            render(CqlTypeTag::List(Box::new(CqlTypeTag::Int)), v),
            serde_json::json!([1, 2])
        );
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let err = cql_value_to_json(&CqlTypeTag::Int, &CqlValue::Text("x".into())).unwrap_err();
        assert!(matches!(err, ReplicationError::CassandraType(_)));
    }

    #[test]
    fn decimal_formatting_places_the_point() {
        assert_eq!(format_decimal(BigInt::from(1234), 2), "12.34");
        assert_eq!(format_decimal(BigInt::from(-5), 3), "-0.005");
        assert_eq!(format_decimal(BigInt::from(7), 0), "7");
        assert_eq!(format_decimal(BigInt::from(7), -2), "700");
    }
}
