pub mod serializer;
pub mod value;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scylla::transport::ExecutionProfile;
use scylla::{Session, SessionBuilder};
use tracing::info;

use crate::config::ClusterSettings;
use crate::error::ReplicationError;

/// Supported CQL types, populated from `system_schema` metadata. The codec
/// and the custom serializer both dispatch on this tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CqlTypeTag {
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Date,
    Decimal,
    Double,
    Float,
    Inet,
    Int,
    Smallint,
    Text,
    Time,
    Timestamp,
    Timeuuid,
    Tinyint,
    Uuid,
    Varchar,
    Varint,
    List(Box<CqlTypeTag>),
}

impl CqlTypeTag {
    pub fn parse(raw: &str) -> Result<CqlTypeTag, ReplicationError> {
        let raw = raw.trim();
        let raw = raw
            .strip_prefix("frozen<")
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(raw);

        if let Some(inner) = raw.strip_prefix("list<").and_then(|s| s.strip_suffix('>')) {
            return Ok(CqlTypeTag::List(Box::new(CqlTypeTag::parse(inner)?)));
        }

        Ok(match raw {
            "ascii" => CqlTypeTag::Ascii,
            "bigint" => CqlTypeTag::Bigint,
            "blob" => CqlTypeTag::Blob,
            "boolean" => CqlTypeTag::Boolean,
            "date" => CqlTypeTag::Date,
            "decimal" => CqlTypeTag::Decimal,
            "double" => CqlTypeTag::Double,
            "float" => CqlTypeTag::Float,
            "inet" => CqlTypeTag::Inet,
            "int" => CqlTypeTag::Int,
            "smallint" => CqlTypeTag::Smallint,
            "text" => CqlTypeTag::Text,
            "time" => CqlTypeTag::Time,
            "timestamp" => CqlTypeTag::Timestamp,
            "timeuuid" => CqlTypeTag::Timeuuid,
            "tinyint" => CqlTypeTag::Tinyint,
            "uuid" => CqlTypeTag::Uuid,
            "varchar" => CqlTypeTag::Varchar,
            "varint" => CqlTypeTag::Varint,
            other => return Err(ReplicationError::CassandraType(other.to_string())),
        })
    }

    /// Types whose literals are single-quoted in a WHERE clause.
    pub fn is_quoted(&self) -> bool {
        matches!(
            self,
            CqlTypeTag::Ascii
                | CqlTypeTag::Text
                | CqlTypeTag::Varchar
                | CqlTypeTag::Inet
                | CqlTypeTag::Time
                | CqlTypeTag::Uuid
                | CqlTypeTag::Timeuuid
                | CqlTypeTag::Date
        )
    }

    /// Types whose list elements are single-quoted: the text, temporal and
    /// inet families.
    pub fn quoted_in_list(&self) -> bool {
        self.is_quoted() || matches!(self, CqlTypeTag::Timestamp)
    }
}

#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub tag: CqlTypeTag,
}

/// Column layout of one replicated table, read from `system_schema.columns`.
/// Primary-key columns keep their declared order: partition keys first, then
/// clustering keys, each by position.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub keyspace: String,
    pub table: String,
    /// Partition-key columns only, in declared order; `token()` selectors
    /// are built from these.
    pub partition_key: Vec<ColumnMeta>,
    /// Partition keys followed by clustering keys.
    pub primary_key: Vec<ColumnMeta>,
    pub regular: Vec<ColumnMeta>,
}

impl TableSchema {
    pub async fn load(session: &Session, keyspace: &str, table: &str) -> Result<TableSchema> {
        let result = session
            .query(
                "SELECT column_name, kind, position, type FROM system_schema.columns \
                 WHERE keyspace_name = ? AND table_name = ?",
                (keyspace, table),
            )
            .await
            .context("failed to read system_schema.columns")?;

        let mut partition: Vec<(i32, ColumnMeta)> = Vec::new();
        let mut clustering: Vec<(i32, ColumnMeta)> = Vec::new();
        let mut regular: Vec<ColumnMeta> = Vec::new();

        for row in result.rows_typed::<(String, String, i32, String)>()? {
            let (name, kind, position, raw_type) = row?;
            let meta = ColumnMeta {
                tag: CqlTypeTag::parse(&raw_type)?,
                name,
            };
            match kind.as_str() {
                "partition_key" => partition.push((position, meta)),
                "clustering" => clustering.push((position, meta)),
                _ => regular.push(meta),
            }
        }

        if partition.is_empty() {
            anyhow::bail!(ReplicationError::Preflight(format!(
                "table {keyspace}.{table} not found in system_schema"
            )));
        }

        partition.sort_by_key(|(pos, _)| *pos);
        clustering.sort_by_key(|(pos, _)| *pos);
        regular.sort_by(|a, b| a.name.cmp(&b.name));

        let partition_key: Vec<ColumnMeta> = partition.into_iter().map(|(_, meta)| meta).collect();
        let primary_key: Vec<ColumnMeta> = partition_key
            .iter()
            .cloned()
            .chain(clustering.into_iter().map(|(_, meta)| meta))
            .collect();

        info!(
            "Loaded schema for {}.{}: {} pk columns, {} regular columns",
            keyspace,
            table,
            primary_key.len(),
            regular.len()
        );

        Ok(TableSchema {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            partition_key,
            primary_key,
            regular,
        })
    }

    pub fn pk_names(&self) -> Vec<&str> {
        self.primary_key.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.primary_key
            .iter()
            .chain(self.regular.iter())
            .find(|c| c.name == name)
    }

    /// Every column name, primary keys first. This is the projection used
    /// for row fetches; `SELECT *` cannot be combined with the extra
    /// `ttl()` / `writetime()` selectors so the list is always explicit.
    pub fn all_names(&self) -> Vec<String> {
        self.primary_key
            .iter()
            .chain(self.regular.iter())
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Ordered primary-key value: `(column name, JSON value)` pairs in declared
/// key order. Iteration order is stable so the WHERE clause, the tile hash
/// and the offload key all see the same sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKey {
    entries: Vec<(String, serde_json::Value)>,
}

impl PrimaryKey {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compact JSON fragments of the key values joined with `:`. Used as
    /// the dedup/join key and as the hash input for tile assignment.
    pub fn join_key(&self) -> String {
        self.entries
            .iter()
            .map(|(_, v)| v.to_string())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl Default for PrimaryKey {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn connect(settings: &ClusterSettings) -> Result<Arc<Session>> {
    let profile = ExecutionProfile::builder()
        .request_timeout(Some(Duration::from_secs(settings.request_timeout_secs)))
        .build();

    let mut builder = SessionBuilder::new()
        .known_nodes(&settings.contact_points)
        .connection_timeout(Duration::from_secs(10))
        .default_execution_profile_handle(profile.into_handle());

    if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
        builder = builder.user(user.as_str(), pass.as_str());
    }

    let session = builder.build().await.context("failed to open CQL session")?;
    Ok(Arc::new(session))
}

/// Preflight existence check against `system_schema`; materialized views
/// count because discovery may scan through one.
pub async fn table_exists(session: &Session, keyspace: &str, table: &str) -> Result<bool> {
    let result = session
        .query(
            "SELECT table_name FROM system_schema.tables \
             WHERE keyspace_name = ? AND table_name = ?",
            (keyspace, table),
        )
        .await?;
    if result.rows_typed::<(String,)>()?.next().is_some() {
        return Ok(true);
    }

    let result = session
        .query(
            "SELECT view_name FROM system_schema.views \
             WHERE keyspace_name = ? AND view_name = ?",
            (keyspace, table),
        )
        .await?;
    Ok(result.rows_typed::<(String,)>()?.next().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalar_and_list_types() {
        assert_eq!(CqlTypeTag::parse("text").unwrap(), CqlTypeTag::Text);
        assert_eq!(CqlTypeTag::parse("bigint").unwrap(), CqlTypeTag::Bigint);
        assert_eq!(
            CqlTypeTag::parse("list<int>").unwrap(),
            CqlTypeTag::List(Box::new(CqlTypeTag::Int))
        );
        assert_eq!(
            CqlTypeTag::parse("frozen<list<timestamp>>").unwrap(),
            CqlTypeTag::List(Box::new(CqlTypeTag::Timestamp))
        );
    }

    #[test]
    fn unknown_type_is_an_error() {
        let err = CqlTypeTag::parse("map<int, text>").unwrap_err();
        assert!(matches!(err, ReplicationError::CassandraType(_)));
    }

    #[test]
    fn primary_key_join_is_order_stable() {
        let mut pk = PrimaryKey::new();
        pk.push("a", serde_json::json!("x"));
        pk.push("b", serde_json::json!(7));
        assert_eq!(pk.join_key(), "\"x\":7");
        assert_eq!(pk.get("b"), Some(&serde_json::json!(7)));
    }
}
