use chrono::DateTime;
use serde_json::Value;

use super::{ColumnMeta, CqlTypeTag, PrimaryKey};
use crate::error::ReplicationError;

/// Render a row value into CQL literal text for a WHERE clause. Quoting and
/// escaping follow the type family; unknown shapes surface as
/// `CassandraType` so a bad schema mapping fails loudly.
pub fn render_literal(tag: &CqlTypeTag, value: &Value) -> Result<String, ReplicationError> {
    if value.is_null() {
        return Ok("NULL".to_string());
    }

    Ok(match tag {
        CqlTypeTag::Ascii
        | CqlTypeTag::Text
        | CqlTypeTag::Varchar
        | CqlTypeTag::Inet
        | CqlTypeTag::Time
        | CqlTypeTag::Uuid
        | CqlTypeTag::Timeuuid
        | CqlTypeTag::Date => format!("'{}'", escape_squote(&string_form(value))),
        CqlTypeTag::Timestamp => timestamp_millis(value)?.to_string(),
        CqlTypeTag::Int
        | CqlTypeTag::Smallint
        | CqlTypeTag::Tinyint
        | CqlTypeTag::Bigint
        | CqlTypeTag::Varint
        | CqlTypeTag::Float
        | CqlTypeTag::Double
        | CqlTypeTag::Decimal
        | CqlTypeTag::Boolean => string_form(value),
        CqlTypeTag::Blob => blob_literal(&string_form(value)),
        CqlTypeTag::List(inner) => {
            let elements = value.as_array().ok_or_else(|| {
                ReplicationError::CassandraType(format!("expected a list value, got {value}"))
            })?;
            let rendered = elements
                .iter()
                .map(|e| {
                    if inner.quoted_in_list() {
                        Ok(format!("'{}'", escape_squote(&string_form(e))))
                    } else {
                        render_literal(inner, e)
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            format!("[{}]", rendered.join(","))
        }
    })
}

/// `WHERE pk1 = v1 AND pk2 = v2 …` over the declared key order.
pub fn where_clause(pk_meta: &[ColumnMeta], pk: &PrimaryKey) -> Result<String, ReplicationError> {
    let mut parts = Vec::with_capacity(pk_meta.len());
    for meta in pk_meta {
        let value = pk.get(&meta.name).ok_or_else(|| {
            ReplicationError::CassandraType(format!("missing primary key column {}", meta.name))
        })?;
        parts.push(format!("{} = {}", meta.name, render_literal(&meta.tag, value)?));
    }
    Ok(parts.join(" AND "))
}

/// The WHERE-clause value fragments without quoting, used to derive the
/// large-object offload key (`v1:v2:…`).
pub fn pk_fragments(pk_meta: &[ColumnMeta], pk: &PrimaryKey) -> Result<Vec<String>, ReplicationError> {
    pk_meta
        .iter()
        .map(|meta| {
            let value = pk.get(&meta.name).ok_or_else(|| {
                ReplicationError::CassandraType(format!("missing primary key column {}", meta.name))
            })?;
            Ok(render_literal(&meta.tag, value)?
                .trim_matches('\'')
                .to_string())
        })
        .collect()
}

/// Rewrite empty-string blob columns to the protocol-level canonical empty
/// blob `"0x"` before the payload goes to the target.
pub fn canonicalize_blobs(columns: &[ColumnMeta], payload: &mut serde_json::Map<String, Value>) {
    for meta in columns {
        if meta.tag != CqlTypeTag::Blob {
            continue;
        }
        if let Some(v) = payload.get_mut(&meta.name) {
            if v.as_str() == Some("") {
                *v = Value::String("0x".to_string());
            }
        }
    }
}

/// Epoch milliseconds from either a native number or a
/// `yyyy-MM-dd'T'HH:mm:ss.SSSZ` string (`Z` → `+0000`, short fractions
/// right-padded with zeros).
pub fn timestamp_millis(value: &Value) -> Result<i64, ReplicationError> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    let raw = value.as_str().ok_or_else(|| {
        ReplicationError::CassandraType(format!("unsupported timestamp value {value}"))
    })?;
    let normalized = normalize_timestamp(raw);
    DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.3f%z")
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| ReplicationError::CassandraType(format!("bad timestamp {raw:?}: {e}")))
}

fn normalize_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    let (body, offset) = if let Some(stripped) = raw.strip_suffix('Z') {
        (stripped.to_string(), "+0000".to_string())
    } else if let Some(pos) = raw.rfind(['+', '-']).filter(|&p| p > 10) {
        (raw[..pos].to_string(), raw[pos..].replace(':', ""))
    } else {
        (raw.to_string(), "+0000".to_string())
    };

    let (datetime, fraction) = match body.split_once('.') {
        Some((dt, frac)) => (dt.to_string(), frac.to_string()),
        None => (body, String::new()),
    };
    let mut fraction = fraction;
    fraction.truncate(3);
    while fraction.len() < 3 {
        fraction.push('0');
    }

    format!("{datetime}.{fraction}{offset}")
}

pub fn escape_squote(s: &str) -> String {
    s.replace('\'', "''")
}

fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn blob_literal(raw: &str) -> String {
    if raw.is_empty() {
        return "0x".to_string();
    }
    if let Some(hex_part) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        format!("0x{}", hex_part.to_lowercase())
    } else {
        format!("0x{}", hex::encode(raw.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quotes_text_family_and_doubles_quotes() {
        assert_eq!(
            render_literal(&CqlTypeTag::Text, &json!("it's")).unwrap(),
            "'it''s'"
        );
        assert_eq!(
            render_literal(&CqlTypeTag::Inet, &json!("10.0.0.1")).unwrap(),
            "'10.0.0.1'"
        );
        assert_eq!(
            render_literal(&CqlTypeTag::Date, &json!("2024-03-01")).unwrap(),
            "'2024-03-01'"
        );
    }

    #[test]
    fn numerics_and_booleans_are_bare() {
        assert_eq!(render_literal(&CqlTypeTag::Int, &json!(42)).unwrap(), "42");
        assert_eq!(
            render_literal(&CqlTypeTag::Double, &json!(1.5)).unwrap(),
            "1.5"
        );
        assert_eq!(
            render_literal(&CqlTypeTag::Boolean, &json!(true)).unwrap(),
            "true"
        );
        assert_eq!(
            render_literal(&CqlTypeTag::Decimal, &json!("12.34")).unwrap(),
            "12.34"
        );
    }

    #[test]
    fn timestamps_render_as_epoch_millis() {
        let expected = DateTime::parse_from_str("2024-03-01T10:11:12.500+0000", "%Y-%m-%dT%H:%M:%S%.3f%z")
            .unwrap()
            .timestamp_millis();
        // short fraction is right-padded, Z maps to +0000
        assert_eq!(
            render_literal(&CqlTypeTag::Timestamp, &json!("2024-03-01T10:11:12.5Z")).unwrap(),
            expected.to_string()
        );
        assert_eq!(
            render_literal(&CqlTypeTag::Timestamp, &json!(1700000000000_i64)).unwrap(),
            "1700000000000"
        );
    }

    #[test]
    fn blob_literals_are_lowercase_hex() {
        assert_eq!(
            render_literal(&CqlTypeTag::Blob, &json!("0xDEADBEEF")).unwrap(),
            "0xdeadbeef"
        );
        assert_eq!(render_literal(&CqlTypeTag::Blob, &json!("")).unwrap(), "0x");
        assert_eq!(render_literal(&CqlTypeTag::Blob, &json!("ab")).unwrap(), "0x6162");
    }

    #[test]
    fn lists_quote_by_element_family() {
        assert_eq!(
            render_literal(&CqlTypeTag::List(Box::new(CqlTypeTag::Int)), &json!([1, 2, 3])).unwrap(),
            "[1,2,3]"
        );
        assert_eq!(
            render_literal(
                &CqlTypeTag::List(Box::new(CqlTypeTag::Text)),
                &json!(["a", "b"])
            )
            .unwrap(),
            "['a','b']"
        );
    }

    #[test]
    fn where_clause_follows_key_order() {
        let meta = vec![
            ColumnMeta { name: "id".into(), tag: CqlTypeTag::Text },
            ColumnMeta { name: "seq".into(), tag: CqlTypeTag::Bigint },
        ];
        let mut pk = PrimaryKey::new();
        pk.push("id", json!("k1"));
        pk.push("seq", json!(9));
        assert_eq!(where_clause(&meta, &pk).unwrap(), "id = 'k1' AND seq = 9");
        assert_eq!(pk_fragments(&meta, &pk).unwrap(), vec!["k1", "9"]);
    }

    #[test]
    fn empty_blob_payload_becomes_canonical() {
        let columns = vec![ColumnMeta { name: "body".into(), tag: CqlTypeTag::Blob }];
        let mut payload = serde_json::Map::new();
        payload.insert("body".into(), json!(""));
        canonicalize_blobs(&columns, &mut payload);
        assert_eq!(payload["body"], json!("0x"));
    }
}
