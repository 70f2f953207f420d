pub mod applier;
pub mod cdc;
pub mod discovery;
pub mod dlq;
pub mod orchestrator;
pub mod retry;

use std::hash::Hasher;
use std::sync::Arc;

use anyhow::Result;
use scylla::Session;
use twox_hash::XxHash64;

use crate::config::{JsonMapping, ReplicatorSettings};
use crate::cql::TableSchema;
use crate::ledger::Ledger;
use crate::storage::StagingClient;
use crate::transform::PayloadTransformer;

const TILE_HASH_SEED: u64 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    Discovery,
    Replication,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Discovery => "discovery",
            ProcessType::Replication => "replication",
        }
    }

    pub fn parse(raw: &str) -> Result<ProcessType> {
        match raw {
            "discovery" => Ok(ProcessType::Discovery),
            "replication" => Ok(ProcessType::Replication),
            other => anyhow::bail!("unknown process type {other:?}"),
        }
    }
}

/// Everything the per-tile job was invoked with.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_name: String,
    pub tile: i32,
    pub total_tiles: i32,
    pub process: ProcessType,
    pub source_keyspace: String,
    pub source_table: String,
    pub target_keyspace: String,
    pub target_table: String,
    pub writetime_column: Option<String>,
    pub ttl_column: Option<String>,
    pub landing_zone: String,
    pub replication_point_in_time: i64,
    pub safe_mode: bool,
    pub cleanup_requested: bool,
    pub replay_log: bool,
}

/// Shared handles for one orchestrator loop: sessions, staging, ledger,
/// schema and the payload transformer. Created once at startup and passed
/// by `Arc` instead of living in globals.
pub struct ReplicatorContext {
    pub spec: JobSpec,
    pub mapping: JsonMapping,
    pub settings: ReplicatorSettings,
    pub source: Arc<Session>,
    pub target: Arc<Session>,
    pub staging: StagingClient,
    pub schema: Arc<TableSchema>,
    pub ledger: Ledger,
    pub transformer: PayloadTransformer,
}

impl ReplicatorContext {
    pub fn source_table_ref(&self) -> String {
        format!("{}.{}", self.spec.source_keyspace, self.spec.source_table)
    }

    pub fn target_table_ref(&self) -> String {
        format!("{}.{}", self.spec.target_keyspace, self.spec.target_table)
    }
}

/// Tile assignment: `abs(xxhash64(joined pk fragments; seed=42)) % N`.
/// Stable across processes so every operation for a key lands on one tile.
pub fn tile_for_key(join_key: &str, total_tiles: i32) -> i32 {
    let mut hasher = XxHash64::with_seed(TILE_HASH_SEED);
    hasher.write(join_key.as_bytes());
    ((hasher.finish() as i64).unsigned_abs() % total_tiles.max(1) as u64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::PrimaryKey;

    #[test]
    fn tile_assignment_is_stable() {
        let mut pk = PrimaryKey::new();
        pk.push("id", serde_json::json!("a"));
        pk.push("seq", serde_json::json!(1));

        let first = tile_for_key(&pk.join_key(), 8);
        for _ in 0..10 {
            assert_eq!(tile_for_key(&pk.join_key(), 8), first);
        }
        assert!((0..8).contains(&first));
    }

    #[test]
    fn tiles_partition_the_key_space() {
        // every key lands on exactly one tile and the union covers all keys
        let keys: Vec<String> = (0..64).map(|i| format!("\"k{i}\"")).collect();
        let mut per_tile = vec![0usize; 4];
        for key in &keys {
            per_tile[tile_for_key(key, 4) as usize] += 1;
        }
        assert_eq!(per_tile.iter().sum::<usize>(), keys.len());
        assert!(per_tile.iter().filter(|&&n| n > 0).count() > 1);
    }

    #[test]
    fn process_type_parses_both_modes() {
        assert_eq!(ProcessType::parse("discovery").unwrap(), ProcessType::Discovery);
        assert_eq!(ProcessType::parse("replication").unwrap(), ProcessType::Replication);
        assert!(ProcessType::parse("repair").is_err());
    }
}
