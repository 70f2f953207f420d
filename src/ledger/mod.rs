use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use scylla::batch::Batch;
use scylla::frame::value::CqlTimestamp;
use scylla::Session;
use tracing::info;

pub const VER_HEAD: &str = "head";
pub const VER_TAIL: &str = "tail";
pub const STATUS_SUCCESS: &str = "SUCCESS";

/// Durable per-tile replication state, kept in two tables on the target
/// cluster. One orchestrator process owns each `(tile, ver)` row, so plain
/// upserts are safe; the slot swap is the only multi-row write and goes
/// through a logged batch.
#[derive(Clone)]
pub struct Ledger {
    session: Arc<Session>,
    ledger_keyspace: String,
    keyspace: String,
    table: String,
}

#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub load_status: String,
    pub offload_status: String,
    pub location: String,
}

impl Slot {
    pub fn offloaded(&self) -> bool {
        self.offload_status == STATUS_SUCCESS
    }

    pub fn loaded(&self) -> bool {
        self.load_status == STATUS_SUCCESS
    }
}

#[derive(Debug, Clone, Default)]
pub struct CdcState {
    pub backfill_completed: bool,
    pub max_ts: Option<i64>,
    pub last_processed_snapshot: Option<i64>,
}

impl Ledger {
    pub fn new(session: Arc<Session>, ledger_keyspace: &str, keyspace: &str, table: &str) -> Self {
        Self {
            session,
            ledger_keyspace: ledger_keyspace.to_string(),
            keyspace: keyspace.to_string(),
            table: table.to_string(),
        }
    }

    fn cdc_key(&self) -> String {
        format!("{}.{}", self.keyspace, self.table)
    }

    pub async fn ensure_tables(&self) -> Result<()> {
        let ks = &self.ledger_keyspace;
        self.session
            .query(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {ks} WITH replication = \
                     {{'class': 'SimpleStrategy', 'replication_factor': '3'}}"
                ),
                (),
            )
            .await
            .context("failed to create the ledger keyspace")?;
        self.session
            .query(
                format!(
                    "CREATE TABLE IF NOT EXISTS {ks}.ledger ( \
                     ks text, tbl text, tile int, ver text, \
                     load_status text, dt_load timestamp, \
                     offload_status text, dt_offload timestamp, \
                     location text, \
                     PRIMARY KEY ((ks, tbl), tile, ver))"
                ),
                (),
            )
            .await
            .context("failed to create the ledger table")?;
        self.session
            .query(
                format!(
                    "CREATE TABLE IF NOT EXISTS {ks}.cdc_ledger ( \
                     key text, tile int, \
                     backfill_completed boolean, backfill_ts timestamp, \
                     max_ts bigint, last_processed_snapshot bigint, \
                     PRIMARY KEY (key, tile))"
                ),
                (),
            )
            .await
            .context("failed to create the cdc ledger table")?;
        Ok(())
    }

    /// Cleanup hook: a discovery process started with `cleanup_requested`
    /// wipes every ledger row for this table so tiling restarts from the
    /// first round.
    pub async fn initialize_if_requested(&self) -> Result<()> {
        let ks = &self.ledger_keyspace;
        self.session
            .query(
                format!("DELETE FROM {ks}.ledger WHERE ks = ? AND tbl = ?"),
                (&self.keyspace, &self.table),
            )
            .await?;
        self.session
            .query(
                format!("DELETE FROM {ks}.cdc_ledger WHERE key = ?"),
                (self.cdc_key(),),
            )
            .await?;
        info!("Ledger rows cleared for {}.{}", self.keyspace, self.table);
        Ok(())
    }

    pub async fn read_slot(&self, tile: i32, ver: &str) -> Result<Option<Slot>> {
        let result = self
            .session
            .query(
                format!(
                    "SELECT load_status, offload_status, location FROM {}.ledger \
                     WHERE ks = ? AND tbl = ? AND tile = ? AND ver = ?",
                    self.ledger_keyspace
                ),
                (&self.keyspace, &self.table, tile, ver),
            )
            .await?;

        let row = result.maybe_first_row_typed::<(Option<String>, Option<String>, Option<String>)>()?;
        Ok(row.map(|(load, offload, location)| Slot {
            load_status: load.unwrap_or_default(),
            offload_status: offload.unwrap_or_default(),
            location: location.unwrap_or_default(),
        }))
    }

    /// Record a freshly written snapshot for a slot. Arms the slot as
    /// unloaded; the applier flips it with `mark_loaded`.
    pub async fn mark_offloaded(&self, tile: i32, ver: &str, location: &str) -> Result<()> {
        self.session
            .query(
                format!(
                    "UPDATE {}.ledger SET offload_status = ?, dt_offload = ?, \
                     location = ?, load_status = '' \
                     WHERE ks = ? AND tbl = ? AND tile = ? AND ver = ?",
                    self.ledger_keyspace
                ),
                (
                    STATUS_SUCCESS,
                    CqlTimestamp(Utc::now().timestamp_millis()),
                    location,
                    &self.keyspace,
                    &self.table,
                    tile,
                    ver,
                ),
            )
            .await?;
        Ok(())
    }

    pub async fn mark_loaded(&self, tile: i32, ver: &str) -> Result<()> {
        self.session
            .query(
                format!(
                    "UPDATE {}.ledger SET load_status = ?, dt_load = ? \
                     WHERE ks = ? AND tbl = ? AND tile = ? AND ver = ?",
                    self.ledger_keyspace
                ),
                (
                    STATUS_SUCCESS,
                    CqlTimestamp(Utc::now().timestamp_millis()),
                    &self.keyspace,
                    &self.table,
                    tile,
                    ver,
                ),
            )
            .await?;
        Ok(())
    }

    /// Promote `head ← tail` and arm a fresh tail in one logged batch, so a
    /// crash can never leave one slot advanced and the other behind.
    pub async fn swap_slots(&self, tile: i32, head_location: &str, tail_location: &str) -> Result<()> {
        let stmt = format!(
            "UPDATE {}.ledger SET offload_status = ?, dt_offload = ?, \
             location = ?, load_status = '' \
             WHERE ks = ? AND tbl = ? AND tile = ? AND ver = ?",
            self.ledger_keyspace
        );
        let mut batch = Batch::default();
        batch.append_statement(stmt.as_str());
        batch.append_statement(stmt.as_str());

        let now = CqlTimestamp(Utc::now().timestamp_millis());
        self.session
            .batch(
                &batch,
                (
                    (
                        STATUS_SUCCESS,
                        now,
                        head_location,
                        &self.keyspace,
                        &self.table,
                        tile,
                        VER_HEAD,
                    ),
                    (
                        STATUS_SUCCESS,
                        now,
                        tail_location,
                        &self.keyspace,
                        &self.table,
                        tile,
                        VER_TAIL,
                    ),
                ),
            )
            .await
            .context("slot swap batch failed")?;
        info!("Swapped snapshot slots for tile {tile}");
        Ok(())
    }

    pub async fn get_cdc(&self, tile: i32) -> Result<Option<CdcState>> {
        let result = self
            .session
            .query(
                format!(
                    "SELECT backfill_completed, max_ts, last_processed_snapshot \
                     FROM {}.cdc_ledger WHERE key = ? AND tile = ?",
                    self.ledger_keyspace
                ),
                (self.cdc_key(), tile),
            )
            .await?;

        let row = result.maybe_first_row_typed::<(Option<bool>, Option<i64>, Option<i64>)>()?;
        Ok(row.map(|(completed, max_ts, last)| CdcState {
            backfill_completed: completed.unwrap_or(false),
            max_ts,
            last_processed_snapshot: last,
        }))
    }

    pub async fn set_backfill_completed(&self, tile: i32, ts_millis: i64) -> Result<()> {
        self.session
            .query(
                format!(
                    "UPDATE {}.cdc_ledger SET backfill_completed = true, backfill_ts = ? \
                     WHERE key = ? AND tile = ?",
                    self.ledger_keyspace
                ),
                (CqlTimestamp(ts_millis), self.cdc_key(), tile),
            )
            .await?;
        info!("Backfill completed for tile {tile}");
        Ok(())
    }

    /// `max_ts` is the CDC high-water mark and only moves forward.
    pub async fn advance_max_ts(&self, tile: i32, ts: i64) -> Result<()> {
        let current = self.get_cdc(tile).await?.and_then(|s| s.max_ts).unwrap_or(i64::MIN);
        if ts <= current {
            return Ok(());
        }
        self.session
            .query(
                format!(
                    "UPDATE {}.cdc_ledger SET max_ts = ? WHERE key = ? AND tile = ?",
                    self.ledger_keyspace
                ),
                (ts, self.cdc_key(), tile),
            )
            .await?;
        Ok(())
    }

    pub async fn mark_snapshot_processed(&self, tile: i32, epoch: i64) -> Result<()> {
        self.session
            .query(
                format!(
                    "UPDATE {}.cdc_ledger SET last_processed_snapshot = ? \
                     WHERE key = ? AND tile = ?",
                    self.ledger_keyspace
                ),
                (epoch, self.cdc_key(), tile),
            )
            .await?;
        Ok(())
    }

    pub async fn all_backfills_completed(&self, total_tiles: i32) -> Result<bool> {
        let result = self
            .session
            .query(
                format!(
                    "SELECT tile, backfill_completed FROM {}.cdc_ledger WHERE key = ?",
                    self.ledger_keyspace
                ),
                (self.cdc_key(),),
            )
            .await?;

        let mut completed = 0;
        for row in result.rows_typed::<(i32, Option<bool>)>()? {
            let (_, done) = row?;
            if done.unwrap_or(false) {
                completed += 1;
            }
        }
        Ok(completed >= total_tiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_status_helpers() {
        let empty = Slot::default();
        assert!(!empty.offloaded());
        assert!(!empty.loaded());

        let armed = Slot {
            offload_status: STATUS_SUCCESS.into(),
            load_status: String::new(),
            location: "ks/t/primaryKeys/tile_0.head".into(),
        };
        assert!(armed.offloaded());
        assert!(!armed.loaded());
    }
}
