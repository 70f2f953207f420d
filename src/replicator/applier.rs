use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{retry, ReplicatorContext};
use crate::cql::serializer::row_to_json;
use crate::cql::{value, ColumnMeta, PrimaryKey};
use crate::error::ReplicationError;
use crate::ledger::{VER_HEAD, VER_TAIL};
use crate::stats;
use crate::storage::snapshot::{decode_cdc_events, CdcEvent, MutationKind, SnapshotData};

/// Consumes staged snapshots and CDC pointers: fetches full rows from the
/// source, runs the payload transformer, and applies the result to the
/// target through the retry/DLQ writer.
pub struct Applier {
    ctx: Arc<ReplicatorContext>,
}

/// Operation sets computed between two discovery snapshots.
#[derive(Debug, Default)]
pub struct Delta {
    pub inserts: Vec<PrimaryKey>,
    pub updates: Vec<PrimaryKey>,
    pub deletes: Vec<PrimaryKey>,
}

impl Applier {
    pub fn new(ctx: Arc<ReplicatorContext>) -> Self {
        Self { ctx }
    }

    pub async fn run_cycle(&self) -> Result<()> {
        let tile = self.ctx.spec.tile;
        let head = self.ctx.ledger.read_slot(tile, VER_HEAD).await?;
        let tail = self.ctx.ledger.read_slot(tile, VER_TAIL).await?;

        match (&head, &tail) {
            (Some(h), None) if h.offloaded() && !h.loaded() => self.backfill(tile).await?,
            (Some(h), Some(t)) if h.offloaded() && t.offloaded() && !t.loaded() => {
                self.delta_apply(tile).await?
            }
            _ => debug!("Tile {tile} has no pending snapshot to apply"),
        }

        if self.ctx.settings.cdc_enabled {
            self.apply_cdc(tile).await?;
        }
        Ok(())
    }

    /// Head-only state: the snapshot is an insert-only batch covering the
    /// whole tile.
    async fn backfill(&self, tile: i32) -> Result<()> {
        let data = self.load_snapshot(tile, VER_HEAD).await?;
        info!("Backfill for tile {tile}: {} primary keys", data.rows.len());

        let pks: Vec<PrimaryKey> = data.rows.iter().map(|r| data.primary_key(r)).collect();
        let inserted = self.apply_batch(pks, MutationKind::Insert, true).await?;

        if let Err(e) = stats::write_replication_stats(&self.ctx.staging, tile, inserted, 0, 0).await {
            warn!("{e}");
        }
        self.ctx.ledger.mark_loaded(tile, VER_HEAD).await?;

        if self.ctx.settings.cdc_enabled {
            self.ctx
                .ledger
                .set_backfill_completed(tile, Utc::now().timestamp_millis())
                .await?;
        }
        info!("Backfill for tile {tile} applied {inserted} rows");
        Ok(())
    }

    /// Both slots present: inserts and updates first, deletes last, so a
    /// delete-then-reinsert of the same key within one cycle cannot leave
    /// the target empty.
    async fn delta_apply(&self, tile: i32) -> Result<()> {
        let head = self.load_snapshot(tile, VER_HEAD).await?;
        let tail = self.load_snapshot(tile, VER_TAIL).await?;

        let delta = compute_delta(&head, &tail, self.ctx.spec.writetime_column.is_some());
        info!(
            "Delta for tile {tile}: {} inserts, {} updates, {} deletes",
            delta.inserts.len(),
            delta.updates.len(),
            delta.deletes.len()
        );

        let inserted = self.apply_batch(delta.inserts, MutationKind::Insert, false).await?;
        let updated = self.apply_batch(delta.updates, MutationKind::Update, false).await?;
        let deleted = self.apply_batch(delta.deletes, MutationKind::Delete, false).await?;

        if let Err(e) =
            stats::write_replication_stats(&self.ctx.staging, tile, inserted, updated, deleted).await
        {
            warn!("{e}");
        }
        self.ctx.ledger.mark_loaded(tile, VER_HEAD).await?;
        self.ctx.ledger.mark_loaded(tile, VER_TAIL).await?;
        Ok(())
    }

    /// Pointer-driven apply of staged CDC snapshots, oldest epoch first.
    /// Events are applied strictly in `ts` order, sequentially: one key can
    /// appear more than once in a snapshot (delete then reinsert), so each
    /// event dispatches to its insert or delete path in place.
    async fn apply_cdc(&self, tile: i32) -> Result<()> {
        for epoch in self.ctx.staging.list_cdc_pointers(tile).await? {
            let mut events: Vec<CdcEvent> = Vec::new();
            for part in self.ctx.staging.list_cdc_parts(tile, epoch).await? {
                events.extend(decode_cdc_events(self.ctx.staging.get_bytes(&part).await?)?);
            }
            events.sort_by_key(|e| e.ts);
            info!("Applying CDC snapshot {epoch} for tile {tile}: {} events", events.len());

            for event in &events {
                let pk = self.event_primary_key(event)?;
                let result = self.apply_one(pk, event.op, false).await;
                self.settle_row(result)?;
            }

            self.ctx.staging.delete(&self.ctx.staging.cdc_pointer(tile, epoch)).await?;
            self.ctx.ledger.mark_snapshot_processed(tile, epoch).await?;
        }
        Ok(())
    }

    /// Shuffle-on-apply: rows fan out over a bounded worker pool; each
    /// batch holds distinct keys so completion order does not matter.
    async fn apply_batch(
        &self,
        pks: Vec<PrimaryKey>,
        kind: MutationKind,
        token_filter: bool,
    ) -> Result<u64> {
        let results: Vec<Result<bool>> = futures::stream::iter(
            pks.into_iter().map(|pk| self.apply_one(pk, kind, token_filter)),
        )
        .buffer_unordered(self.ctx.settings.workers.max(1))
        .collect()
        .await;

        let mut applied = 0;
        for result in results {
            if self.settle_row(result)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Per-row error policy: transform failures drop the row and the batch
    /// continues; anything else terminates the tile cycle (the next loop
    /// retries from ledger state).
    fn settle_row(&self, result: Result<bool>) -> Result<bool> {
        match result {
            Ok(applied) => Ok(applied),
            Err(e) => match e.downcast_ref::<ReplicationError>() {
                Some(ReplicationError::Compression)
                | Some(ReplicationError::LargeObject(_))
                | Some(ReplicationError::RetryExhausted(_)) => {
                    warn!("Dropping row: {e}");
                    Ok(false)
                }
                _ => Err(e),
            },
        }
    }

    async fn apply_one(&self, pk: PrimaryKey, kind: MutationKind, token_filter: bool) -> Result<bool> {
        match kind {
            MutationKind::Delete => self.delete_row(&pk).await.map(|_| true),
            _ => self.upsert_row(&pk, kind, token_filter).await,
        }
    }

    async fn upsert_row(&self, pk: &PrimaryKey, kind: MutationKind, token_filter: bool) -> Result<bool> {
        let schema = &self.ctx.schema;
        let wc = value::where_clause(&schema.primary_key, pk)?;

        if token_filter && self.ctx.mapping.replication.filtering_by_token_ranges.enabled {
            let ranges = self.ctx.mapping.replication.filtering_by_token_ranges.parsed_ranges();
            match self.fetch_token(&wc).await? {
                Some(token) if token_in_ranges(&ranges, token) => {}
                _ => return Ok(false),
            }
        }

        let fetched = if self.ctx.mapping.replication.use_custom_serializer {
            self.fetch_row_typed(&wc).await?
        } else {
            self.fetch_row_json(&wc).await?
        };
        // absent row: deleted concurrently, nothing to replay
        let Some((mut payload, ttl)) = fetched else {
            return Ok(false);
        };

        let fragments = value::pk_fragments(&schema.primary_key, pk)?;
        self.ctx.transformer.transform(&mut payload, &fragments).await?;
        value::canonicalize_blobs(&schema.primary_key, &mut payload);
        value::canonicalize_blobs(&schema.regular, &mut payload);

        let escaped = value::escape_squote(&Value::Object(payload).to_string());
        let mut cql = format!("INSERT INTO {} JSON '{}'", self.ctx.target_table_ref(), escaped);

        match ttl {
            Some(ttl) if ttl > 0 => {
                // TTL writes are retried but never diverted to the DLQ
                cql.push_str(&format!(" USING TTL {ttl}"));
                retry::execute_with_retry(&self.ctx.target, &cql).await?;
            }
            _ => {
                retry::execute_with_dlq(
                    &self.ctx.target,
                    &self.ctx.staging,
                    self.ctx.spec.tile,
                    kind,
                    &cql,
                )
                .await?;
            }
        }
        Ok(true)
    }

    async fn delete_row(&self, pk: &PrimaryKey) -> Result<()> {
        let wc = value::where_clause(&self.ctx.schema.primary_key, pk)?;
        let cql = format!("DELETE FROM {} WHERE {wc}", self.ctx.target_table_ref());
        retry::execute_with_dlq(
            &self.ctx.target,
            &self.ctx.staging,
            self.ctx.spec.tile,
            MutationKind::Delete,
            &cql,
        )
        .await
    }

    /// `SELECT JSON` fetch with the optional `ttl()` / `writetime()`
    /// selectors; their synthetic keys are stripped from the payload.
    async fn fetch_row_json(&self, wc: &str) -> Result<Option<(Map<String, Value>, Option<i64>)>> {
        let mut selectors = self.projection_columns().join(", ");
        if let Some(ttl_col) = &self.ctx.spec.ttl_column {
            selectors.push_str(&format!(", ttl({ttl_col}) AS ttl_value"));
        }
        if let Some(wt_col) = &self.ctx.spec.writetime_column {
            selectors.push_str(&format!(", writetime({wt_col}) AS wt_value"));
        }

        let text = format!("SELECT JSON {selectors} FROM {} WHERE {wc}", self.ctx.source_table_ref());
        let result = self.ctx.source.query(text, ()).await.context("source row fetch failed")?;
        let Some((json_text,)) = result.maybe_first_row_typed::<(String,)>()? else {
            return Ok(None);
        };

        let mut payload: Map<String, Value> =
            serde_json::from_str(&json_text).context("source returned malformed row json")?;
        let ttl = payload.remove("ttl_value").and_then(|v| v.as_i64());
        payload.remove("wt_value");
        Ok(Some((payload, ttl)))
    }

    /// Typed fetch for the custom serializer: the row is rendered to JSON
    /// field by field through the schema type map.
    async fn fetch_row_typed(&self, wc: &str) -> Result<Option<(Map<String, Value>, Option<i64>)>> {
        let names = self.projection_columns();
        let metas: Vec<ColumnMeta> = names
            .iter()
            .map(|name| {
                self.ctx.schema.column(name).cloned().ok_or_else(|| {
                    ReplicationError::CassandraType(format!("unknown projected column {name}"))
                })
            })
            .collect::<Result<_, _>>()?;

        let mut selectors = names.join(", ");
        let wants_ttl = self.ctx.spec.ttl_column.is_some();
        if let Some(ttl_col) = &self.ctx.spec.ttl_column {
            selectors.push_str(&format!(", ttl({ttl_col})"));
        }

        let text = format!("SELECT {selectors} FROM {} WHERE {wc}", self.ctx.source_table_ref());
        let result = self.ctx.source.query(text, ()).await.context("source row fetch failed")?;
        let Some(mut row) = result.rows.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };

        let ttl = if wants_ttl {
            row.columns.pop().flatten().and_then(|v| v.as_int()).map(|n| n as i64)
        } else {
            None
        };

        let payload = row_to_json(&metas, &row)?;
        Ok(Some((payload, ttl)))
    }

    async fn fetch_token(&self, wc: &str) -> Result<Option<i64>> {
        let partition_cols = self
            .ctx
            .schema
            .partition_key
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let text = format!(
            "SELECT token({partition_cols}) FROM {} WHERE {wc}",
            self.ctx.source_table_ref()
        );
        let result = self.ctx.source.query(text, ()).await?;
        Ok(result.maybe_first_row_typed::<(i64,)>()?.map(|(t,)| t))
    }

    fn projection_columns(&self) -> Vec<String> {
        let replication = &self.ctx.mapping.replication;
        if replication.all_columns {
            return self.ctx.schema.all_names();
        }
        // primary keys always travel, whatever the configured column set
        let mut names: Vec<String> =
            self.ctx.schema.pk_names().iter().map(|s| s.to_string()).collect();
        for name in &replication.columns {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    fn event_primary_key(&self, event: &CdcEvent) -> Result<PrimaryKey> {
        let mut pk = PrimaryKey::new();
        for meta in &self.ctx.schema.primary_key {
            let value = event.pk.get(&meta.name).cloned().ok_or_else(|| {
                ReplicationError::CassandraType(format!(
                    "cdc event is missing primary key column {}",
                    meta.name
                ))
            })?;
            pk.push(meta.name.clone(), value);
        }
        Ok(pk)
    }

    async fn load_snapshot(&self, tile: i32, ver: &str) -> Result<SnapshotData> {
        let path = self.ctx.staging.snapshot_object(tile, ver);
        SnapshotData::decode(self.ctx.staging.get_bytes(&path).await?)
    }
}

/// Set difference over the pk join key: inserts are `tail \ head`, deletes
/// `head \ tail`, updates the intersection where the tail writetime is
/// newer. Without a writetime column no updates are generated.
pub fn compute_delta(head: &SnapshotData, tail: &SnapshotData, use_writetime: bool) -> Delta {
    let join = |row: &crate::storage::snapshot::SnapshotRow| {
        row.values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(":")
    };

    let head_by_key: HashMap<String, i64> =
        head.rows.iter().map(|r| (join(r), r.ts)).collect();
    let tail_keys: std::collections::HashSet<String> = tail.rows.iter().map(join).collect();

    let mut delta = Delta::default();
    for row in &tail.rows {
        match head_by_key.get(&join(row)) {
            None => delta.inserts.push(tail.primary_key(row)),
            Some(&head_ts) if use_writetime && row.ts > head_ts => {
                delta.updates.push(tail.primary_key(row))
            }
            Some(_) => {}
        }
    }
    for row in &head.rows {
        if !tail_keys.contains(&join(row)) {
            delta.deletes.push(head.primary_key(row));
        }
    }
    delta
}

/// Half-open range check: a token is included iff `lo < t <= hi` for any
/// configured range.
pub fn token_in_ranges(ranges: &[(i64, i64)], token: i64) -> bool {
    ranges.iter().any(|(lo, hi)| token > *lo && token <= *hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::snapshot::SnapshotRow;
    use serde_json::json;

    fn snapshot(rows: &[(&str, i64)]) -> SnapshotData {
        let mut data = SnapshotData::new(vec!["id".into()]);
        for (key, ts) in rows {
            data.rows.push(SnapshotRow { values: vec![json!(key)], ts: *ts });
        }
        data
    }

    #[test]
    fn delta_splits_inserts_updates_deletes() {
        let head = snapshot(&[("k1", 10), ("k2", 10)]);
        let tail = snapshot(&[("k1", 20), ("k3", 5)]);

        let delta = compute_delta(&head, &tail, true);
        let names = |pks: &[PrimaryKey]| {
            pks.iter().map(|pk| pk.get("id").unwrap().as_str().unwrap().to_string()).collect::<Vec<_>>()
        };
        assert_eq!(names(&delta.inserts), vec!["k3"]);
        assert_eq!(names(&delta.updates), vec!["k1"]);
        assert_eq!(names(&delta.deletes), vec!["k2"]);
    }

    #[test]
    fn no_writetime_means_no_updates() {
        let head = snapshot(&[("k1", 10)]);
        let tail = snapshot(&[("k1", 20)]);

        let delta = compute_delta(&head, &tail, false);
        assert!(delta.inserts.is_empty());
        assert!(delta.updates.is_empty());
        assert!(delta.deletes.is_empty());
    }

    #[test]
    fn stale_tail_writetime_is_not_an_update() {
        let head = snapshot(&[("k1", 30)]);
        let tail = snapshot(&[("k1", 20)]);
        let delta = compute_delta(&head, &tail, true);
        assert!(delta.updates.is_empty());
    }

    #[test]
    fn token_ranges_are_half_open() {
        let ranges = vec![(-100, 100)];
        assert!(!token_in_ranges(&ranges, -100)); // lo excluded
        assert!(token_in_ranges(&ranges, -99));
        assert!(token_in_ranges(&ranges, 100)); // hi included
        assert!(!token_in_ranges(&ranges, 101));
        assert!(token_in_ranges(&[(-10, 0), (50, 60)], 55));
    }
}
