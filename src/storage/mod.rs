pub mod snapshot;

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tracing::info;

/// One client owns the whole landing-zone layout for a replicated table:
/// snapshots, CDC staging, pointers, DLQ, stats and stop flags. Key
/// construction lives here and nowhere else.
#[derive(Clone)]
pub struct StagingClient {
    store: Arc<dyn ObjectStore>,
    root: Path,
}

impl StagingClient {
    /// `landing_zone` is `s3://bucket/prefix`, `file:///dir`, or `mem://`
    /// (tests). The per-table root is `<prefix>/<ks>/<tbl>`.
    pub fn open(landing_zone: &str, keyspace: &str, table: &str) -> Result<Self> {
        let (store, prefix) = open_store(landing_zone)?;
        let root = join(&Path::from(prefix), &[keyspace, table]);
        info!("Staging root: {}/{}", landing_zone.trim_end_matches('/'), root);
        Ok(Self { store, root })
    }

    pub fn with_store(store: Arc<dyn ObjectStore>, keyspace: &str, table: &str) -> Self {
        Self {
            store,
            root: join(&Path::from(""), &[keyspace, table]),
        }
    }

    pub fn in_memory(keyspace: &str, table: &str) -> Self {
        Self::with_store(Arc::new(InMemory::new()), keyspace, table)
    }

    // -- snapshot slots -----------------------------------------------------

    pub fn snapshot_object(&self, tile: i32, ver: &str) -> Path {
        join(&self.root, &["primaryKeys", &format!("tile_{tile}.{ver}"), "snapshot.parquet"])
    }

    /// Promote the tail snapshot object into the head slot (swap step one).
    pub async fn promote_tail_snapshot(&self, tile: i32) -> Result<()> {
        let tail = self.snapshot_object(tile, "tail");
        let head = self.snapshot_object(tile, "head");
        self.store.copy(&tail, &head).await.context("failed to promote tail snapshot")?;
        Ok(())
    }

    // -- cdc staging --------------------------------------------------------

    pub fn cdc_part(&self, tile: i32, epoch: i64, dt: &str, seq: i32) -> Path {
        join(
            &self.root,
            &[
                "cdc",
                "primaryKeys",
                &tile.to_string(),
                &epoch.to_string(),
                &format!("dt={dt}"),
                &format!("seq={seq}"),
                "events.parquet",
            ],
        )
    }

    pub fn cdc_pointer(&self, tile: i32, epoch: i64) -> Path {
        join(&self.root, &["cdc", "pointers", &tile.to_string(), &epoch.to_string()])
    }

    /// Pointer epochs for a tile, oldest first.
    pub async fn list_cdc_pointers(&self, tile: i32) -> Result<Vec<i64>> {
        let prefix = join(&self.root, &["cdc", "pointers", &tile.to_string()]);
        let mut epochs: Vec<i64> = self
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|p| p.filename().and_then(|f| f.parse().ok()))
            .collect();
        epochs.sort_unstable();
        Ok(epochs)
    }

    pub async fn list_cdc_parts(&self, tile: i32, epoch: i64) -> Result<Vec<Path>> {
        let prefix = join(
            &self.root,
            &["cdc", "primaryKeys", &tile.to_string(), &epoch.to_string()],
        );
        let mut parts = self.list(&prefix).await?;
        parts.sort_by_key(|p| p.to_string());
        Ok(parts)
    }

    // -- dlq ----------------------------------------------------------------

    pub fn dlq_object(&self, tile: i32, op: &str, timestamp: &str) -> Path {
        join(&self.root, &["dlq", &tile.to_string(), op, &format!("log-{timestamp}.msg")])
    }

    pub async fn list_dlq(&self, tile: i32, op: &str) -> Result<Vec<Path>> {
        let prefix = join(&self.root, &["dlq", &tile.to_string(), op]);
        let mut objects = self.list(&prefix).await?;
        objects.sort_by_key(|p| p.to_string());
        Ok(objects)
    }

    // -- stats --------------------------------------------------------------

    pub fn stats_object(&self, process: &str, tile: i32) -> Path {
        join(&self.root, &["stats", process, &tile.to_string(), "count.json"])
    }

    // -- stop flags ---------------------------------------------------------

    /// Check for the per-process or per-tile stop flag; delete whichever is
    /// found so the signal does not fire twice.
    pub async fn check_and_clear_stop(&self, process: &str, tile: i32) -> Result<bool> {
        for flag in [
            join(&self.root, &[process, "stopRequested"]),
            join(&self.root, &[process, &tile.to_string(), "stopRequested"]),
        ] {
            if self.exists(&flag).await? {
                self.delete(&flag).await?;
                info!("Stop flag observed at {flag}, shutting down");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn request_stop_flag(&self, process: &str) -> Path {
        join(&self.root, &[process, "stopRequested"])
    }

    // -- raw object operations ----------------------------------------------

    pub async fn put_bytes(&self, path: &Path, bytes: Vec<u8>) -> Result<()> {
        self.store
            .put(path, PutPayload::from(Bytes::from(bytes)))
            .await
            .with_context(|| format!("failed to write {path}"))?;
        Ok(())
    }

    pub async fn get_bytes(&self, path: &Path) -> Result<Bytes> {
        let result = self
            .store
            .get(path)
            .await
            .with_context(|| format!("failed to read {path}"))?;
        Ok(result.bytes().await?)
    }

    pub async fn delete(&self, path: &Path) -> Result<()> {
        self.store
            .delete(path)
            .await
            .with_context(|| format!("failed to delete {path}"))?;
        Ok(())
    }

    pub async fn exists(&self, path: &Path) -> Result<bool> {
        match self.store.head(path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &Path) -> Result<Vec<Path>> {
        let mut stream = self.store.list(Some(prefix));
        let mut paths = Vec::new();
        while let Some(meta) = stream.next().await {
            paths.push(meta?.location);
        }
        Ok(paths)
    }
}

/// Open the blob-side store for large-object offload; the offload bucket is
/// configured separately from the landing zone.
pub fn open_offload_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    if bucket == "mem" || bucket.is_empty() {
        return Ok(Arc::new(InMemory::new()));
    }
    Ok(Arc::new(
        AmazonS3Builder::from_env().with_bucket_name(bucket).build()?,
    ))
}

fn open_store(landing_zone: &str) -> Result<(Arc<dyn ObjectStore>, String)> {
    if let Some(rest) = landing_zone.strip_prefix("s3://") {
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        let store = AmazonS3Builder::from_env().with_bucket_name(bucket).build()?;
        return Ok((Arc::new(store), prefix.trim_matches('/').to_string()));
    }
    if let Some(dir) = landing_zone.strip_prefix("file://") {
        let store = LocalFileSystem::new_with_prefix(dir)?;
        return Ok((Arc::new(store), String::new()));
    }
    if landing_zone.starts_with("mem://") {
        return Ok((Arc::new(InMemory::new()), String::new()));
    }
    anyhow::bail!("unsupported landing zone url: {landing_zone}")
}

fn join(base: &Path, parts: &[&str]) -> Path {
    let mut segments: Vec<&str> = base.as_ref().split('/').filter(|s| !s.is_empty()).collect();
    segments.extend(parts.iter().copied());
    Path::from(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_the_landing_zone_contract() {
        let staging = StagingClient::in_memory("ks1", "t1");
        assert_eq!(
            staging.snapshot_object(3, "head").to_string(),
            "ks1/t1/primaryKeys/tile_3.head/snapshot.parquet"
        );
        assert_eq!(
            staging.cdc_part(3, 1700, "2026-08-01", 7).to_string(),
            "ks1/t1/cdc/primaryKeys/3/1700/dt=2026-08-01/seq=7/events.parquet"
        );
        assert_eq!(staging.cdc_pointer(3, 1700).to_string(), "ks1/t1/cdc/pointers/3/1700");
        assert_eq!(
            staging.dlq_object(0, "insert", "2026-08-01T00:00:00").to_string(),
            "ks1/t1/dlq/0/insert/log-2026-08-01T00:00:00.msg"
        );
        assert_eq!(
            staging.stats_object("discovery", 2).to_string(),
            "ks1/t1/stats/discovery/2/count.json"
        );
    }

    #[tokio::test]
    async fn stop_flag_is_checked_and_cleared() {
        let staging = StagingClient::in_memory("ks1", "t1");
        let flag = staging.request_stop_flag("replication");

        assert!(!staging.check_and_clear_stop("replication", 0).await.unwrap());

        staging.put_bytes(&flag, Vec::new()).await.unwrap();
        assert!(staging.check_and_clear_stop("replication", 0).await.unwrap());
        // deleted on observation, a second check is clean
        assert!(!staging.check_and_clear_stop("replication", 0).await.unwrap());
    }

    #[tokio::test]
    async fn cdc_pointers_list_oldest_first() {
        let staging = StagingClient::in_memory("ks1", "t1");
        for epoch in [300, 100, 200] {
            staging
                .put_bytes(&staging.cdc_pointer(1, epoch), Vec::new())
                .await
                .unwrap();
        }
        assert_eq!(staging.list_cdc_pointers(1).await.unwrap(), vec![100, 200, 300]);
    }
}
