use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use scylla::query::Query;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::cdc::CdcEngine;
use super::{tile_for_key, ReplicatorContext};
use crate::ledger::{Slot, VER_HEAD, VER_TAIL};
use crate::stats;
use crate::storage::snapshot::{SnapshotData, SnapshotRow};

/// Produces per-tile primary-key snapshots from the source and walks the
/// head/tail slot machine. Once CDC takes over for the tile, discovery
/// stops writing snapshots and only stages change events.
pub struct DiscoveryEngine {
    ctx: Arc<ReplicatorContext>,
}

impl DiscoveryEngine {
    pub fn new(ctx: Arc<ReplicatorContext>) -> Self {
        Self { ctx }
    }

    pub async fn run_cycle(&self) -> Result<()> {
        let tile = self.ctx.spec.tile;

        if self.ctx.settings.cdc_enabled {
            let cdc_state = self.ctx.ledger.get_cdc(tile).await?;
            if cdc_state.map(|s| s.backfill_completed).unwrap_or(false) {
                // discovery is frozen for this tile; CDC is authoritative
                return CdcEngine::new(Arc::clone(&self.ctx)).poll_cycle().await;
            }
        }

        let head = self.ctx.ledger.read_slot(tile, VER_HEAD).await?;
        let tail = self.ctx.ledger.read_slot(tile, VER_TAIL).await?;

        match (head, tail) {
            (None, _) => self.first_round(tile).await,
            (Some(head), _) if !head.offloaded() => self.first_round(tile).await,
            (Some(head), None) if head.loaded() => self.write_tail(tile).await,
            (Some(head), Some(tail)) if head.loaded() && tail.loaded() => {
                self.swap(tile, &tail).await
            }
            _ => {
                // a slot is still being applied; try again next cycle
                debug!("Tile {tile} has an unapplied snapshot, skipping discovery write");
                Ok(())
            }
        }
    }

    async fn first_round(&self, tile: i32) -> Result<()> {
        let data = self.scan_tile().await?;
        info!("First-round discovery for tile {tile}: {} primary keys", data.rows.len());

        let location = self.write_snapshot(tile, VER_HEAD, &data).await?;
        self.ctx.ledger.mark_offloaded(tile, VER_HEAD, &location).await?;
        if let Err(e) = stats::write_discovery_stats(&self.ctx.staging, tile, data.rows.len() as u64).await {
            warn!("{e}");
        }
        Ok(())
    }

    async fn write_tail(&self, tile: i32) -> Result<()> {
        let data = self.scan_tile().await?;
        info!("Tail discovery for tile {tile}: {} primary keys", data.rows.len());

        let location = self.write_snapshot(tile, VER_TAIL, &data).await?;
        self.ctx.ledger.mark_offloaded(tile, VER_TAIL, &location).await?;
        if let Err(e) = stats::write_discovery_stats(&self.ctx.staging, tile, data.rows.len() as u64).await {
            warn!("{e}");
        }
        Ok(())
    }

    /// Both slots are fully applied: promote the tail snapshot into the head
    /// slot, scan a fresh tail, then advance both ledger rows in one batch.
    async fn swap(&self, tile: i32, tail: &Slot) -> Result<()> {
        self.ctx.staging.promote_tail_snapshot(tile).await?;
        let head_location = self.ctx.staging.snapshot_object(tile, VER_HEAD).to_string();

        let data = self.scan_tile().await?;
        let tail_location = self.write_snapshot(tile, VER_TAIL, &data).await?;
        debug!("Tile {tile} swap: previous tail {} becomes head", tail.location);

        self.ctx.ledger.swap_slots(tile, &head_location, &tail_location).await?;
        if let Err(e) = stats::write_discovery_stats(&self.ctx.staging, tile, data.rows.len() as u64).await {
            warn!("{e}");
        }
        Ok(())
    }

    async fn write_snapshot(&self, tile: i32, ver: &str, data: &SnapshotData) -> Result<String> {
        let path = self.ctx.staging.snapshot_object(tile, ver);
        self.ctx.staging.put_bytes(&path, data.encode()?).await?;
        Ok(path.to_string())
    }

    /// Full primary-key scan of the source (or the configured materialized
    /// view), grouped by tile hash and filtered down to this tile.
    async fn scan_tile(&self) -> Result<SnapshotData> {
        let spec = &self.ctx.spec;
        let schema = &self.ctx.schema;

        let scanned_table = {
            let mv = &self.ctx.mapping.replication.use_materialized_view;
            if mv.enabled {
                format!("{}.{}", spec.source_keyspace, mv.mv_name)
            } else {
                self.ctx.source_table_ref()
            }
        };

        let mut projection = schema.pk_names().join(", ");
        if let Some(wt) = &spec.writetime_column {
            projection.push_str(&format!(", writetime({wt}) AS ts"));
        }

        let mut text = format!("SELECT JSON {projection} FROM {scanned_table}");
        let transformation = &self.ctx.mapping.keyspaces.transformation;
        if transformation.enabled && !transformation.filter_expression.is_empty() {
            text.push_str(&format!(
                " WHERE {} ALLOW FILTERING",
                transformation.filter_expression
            ));
        }

        let query = Query::new(text).with_page_size(self.ctx.settings.page_size);
        let mut rows = self
            .ctx
            .source
            .query_iter(query, ())
            .await
            .context("discovery scan failed")?
            .into_typed::<(String,)>();

        let pk_names: Vec<String> = schema.pk_names().iter().map(|s| s.to_string()).collect();
        let mut data = SnapshotData::new(pk_names);

        while let Some(row) = rows.next().await {
            let (json_text,) = row?;
            let mut parsed: serde_json::Map<String, Value> =
                serde_json::from_str(&json_text).context("source returned malformed json")?;

            let ts = parsed.remove("ts").and_then(|v| v.as_i64());
            if spec.replication_point_in_time > 0 {
                // point-in-time restore: only keys written after the cutoff
                match ts {
                    Some(ts) if ts > spec.replication_point_in_time => {}
                    _ => continue,
                }
            }

            let values: Vec<Value> = data
                .pk_columns
                .iter()
                .map(|name| parsed.get(name).cloned().unwrap_or(Value::Null))
                .collect();
            let join_key = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(":");
            if tile_for_key(&join_key, spec.total_tiles) != spec.tile {
                continue;
            }

            data.rows.push(SnapshotRow { values, ts: ts.unwrap_or(0) });
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::value::render_literal;
    use crate::cql::CqlTypeTag;

    #[test]
    fn snapshot_fragments_match_codec_input() {
        // a fragment stored by discovery must render back through the codec
        let fragment: Value = serde_json::from_str("\"it's\"").unwrap();
        assert_eq!(
            render_literal(&CqlTypeTag::Text, &fragment).unwrap(),
            "'it''s'"
        );
    }
}
