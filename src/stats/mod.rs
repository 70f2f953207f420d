use chrono::Utc;
use serde::Serialize;

use crate::error::ReplicationError;
use crate::storage::StagingClient;

#[derive(Debug, Serialize)]
pub struct DiscoveryStats {
    pub tile: i32,
    pub primary_keys: u64,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct ReplicationStats {
    pub tile: i32,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub updated_at: String,
}

/// A failed write surfaces as `StatsWrite`; callers log it and carry on,
/// stats are never worth a cycle.
pub async fn write_discovery_stats(
    staging: &StagingClient,
    tile: i32,
    primary_keys: u64,
) -> Result<(), ReplicationError> {
    let stats = DiscoveryStats {
        tile,
        primary_keys,
        updated_at: Utc::now().to_rfc3339(),
    };
    emit(staging, "discovery", tile, &stats).await
}

/// Replication counters are only persisted when at least one of them is
/// zero, preserving the long-standing emission condition of this pipeline.
pub async fn write_replication_stats(
    staging: &StagingClient,
    tile: i32,
    inserted: u64,
    updated: u64,
    deleted: u64,
) -> Result<(), ReplicationError> {
    if inserted != 0 && updated != 0 && deleted != 0 {
        return Ok(());
    }
    let stats = ReplicationStats {
        tile,
        inserted,
        updated,
        deleted,
        updated_at: Utc::now().to_rfc3339(),
    };
    emit(staging, "replication", tile, &stats).await
}

async fn emit<T: Serialize>(
    staging: &StagingClient,
    process: &str,
    tile: i32,
    stats: &T,
) -> Result<(), ReplicationError> {
    let path = staging.stats_object(process, tile);
    let body = serde_json::to_vec(stats)
        .map_err(|e| ReplicationError::StatsWrite(format!("{process} stats: {e}")))?;
    staging
        .put_bytes(&path, body)
        .await
        .map_err(|e| ReplicationError::StatsWrite(format!("{path}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discovery_stats_land_under_the_tile() {
        let staging = StagingClient::in_memory("ks1", "t1");
        write_discovery_stats(&staging, 4, 123).await.unwrap();

        let body = staging.get_bytes(&staging.stats_object("discovery", 4)).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["primary_keys"], 123);
        assert_eq!(parsed["tile"], 4);
    }

    #[tokio::test]
    async fn replication_stats_skip_all_nonzero_cycles() {
        let staging = StagingClient::in_memory("ks1", "t1");

        write_replication_stats(&staging, 1, 5, 3, 2).await.unwrap();
        assert!(!staging.exists(&staging.stats_object("replication", 1)).await.unwrap());

        write_replication_stats(&staging, 1, 5, 0, 2).await.unwrap();
        let body = staging.get_bytes(&staging.stats_object("replication", 1)).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["inserted"], 5);
        assert_eq!(parsed["deleted"], 2);
    }
}
