use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::ReplicatorContext;
use crate::storage::snapshot::{encode_cdc_events, CdcEvent, MutationKind};

/// Per-partition scan cap on the CDC support table.
const SCAN_LIMIT: u32 = 20_000;

/// After backfill, polls the source-side CDC support table past the
/// `max_ts` cursor, stages the new events as partitioned Parquet under a
/// fresh epoch folder, and drops a pointer for the applier.
pub struct CdcEngine {
    ctx: Arc<ReplicatorContext>,
}

impl CdcEngine {
    pub fn new(ctx: Arc<ReplicatorContext>) -> Self {
        Self { ctx }
    }

    fn support_table(&self) -> String {
        format!("{}.cdc_events", self.ctx.settings.ledger_keyspace)
    }

    fn cdc_key(&self) -> String {
        format!("{}.{}", self.ctx.spec.source_keyspace, self.ctx.spec.source_table)
    }

    pub async fn poll_cycle(&self) -> Result<()> {
        let tile = self.ctx.spec.tile;

        if !self
            .ctx
            .ledger
            .all_backfills_completed(self.ctx.spec.total_tiles)
            .await?
        {
            debug!("Backfill is still running on some tiles, CDC staging deferred");
            return Ok(());
        }

        let state = self.ctx.ledger.get_cdc(tile).await?.unwrap_or_default();
        let events = self.fetch_events(state.max_ts).await?;
        if events.is_empty() {
            return Ok(());
        }

        let epoch = Utc::now().timestamp();
        let mut grouped: BTreeMap<(String, i32), Vec<CdcEvent>> = BTreeMap::new();
        let mut high_water = i64::MIN;
        for event in events {
            high_water = high_water.max(event.ts);
            grouped.entry((event.dt.clone(), event.seq)).or_default().push(event);
        }

        let mut staged = 0usize;
        for ((dt, seq), group) in &grouped {
            let path = self.ctx.staging.cdc_part(tile, epoch, dt, *seq);
            self.ctx.staging.put_bytes(&path, encode_cdc_events(group)?).await?;
            staged += group.len();
        }

        self.ctx.ledger.advance_max_ts(tile, high_water).await?;
        let pointer = self.ctx.staging.cdc_pointer(tile, epoch);
        self.ctx.staging.put_bytes(&pointer, Vec::new()).await?;

        info!(
            "Staged {staged} CDC events for tile {tile} at epoch {epoch} ({} partitions)",
            grouped.len()
        );
        Ok(())
    }

    /// One query per cursor regime; an unset cursor scans the whole tile
    /// partition. Results are deduplicated on `(op, pk, dt, seq)`.
    async fn fetch_events(&self, cursor: Option<i64>) -> Result<Vec<CdcEvent>> {
        let clauses = match cursor {
            None => vec![String::new()],
            Some(cur) => cursor_clauses(cur, Utc::now())
                .into_iter()
                .map(|c| format!(" AND {c}"))
                .collect(),
        };

        let mut seen: HashSet<(MutationKind, String, String, i32)> = HashSet::new();
        let mut events = Vec::new();

        for clause in clauses {
            let text = format!(
                "SELECT JSON op, pk, ts, dt, seq FROM {} \
                 WHERE key = '{}' AND tile = {}{clause} \
                 PER PARTITION LIMIT {SCAN_LIMIT} ALLOW FILTERING",
                self.support_table(),
                self.cdc_key(),
                self.ctx.spec.tile,
            );
            let result = self
                .ctx
                .source
                .query(text, ())
                .await
                .context("cdc support table scan failed")?;

            for row in result.rows_typed::<(String,)>()? {
                let (json_text,) = row?;
                let event = parse_event(&json_text)?;
                if seen.insert(event.dedup_key()) {
                    events.push(event);
                }
            }
        }

        Ok(events)
    }
}

/// The three cursor regimes over `(dt, seq, ts)`, where `seq` is the UTC
/// hour-of-day of `ts` and `dt` the UTC date. The cross-date regime keeps
/// `min(now.seq, cur.seq)` to catch seq rollover across midnight.
pub fn cursor_clauses(cur: i64, now: DateTime<Utc>) -> Vec<String> {
    let cur_time = DateTime::<Utc>::from_timestamp_millis(cur).unwrap_or(now);
    let cur_dt = cur_time.format("%Y-%m-%d").to_string();
    let cur_seq = cur_time.hour() as i32;
    let now_seq = now.hour() as i32;

    vec![
        format!("dt = '{cur_dt}' AND seq = {cur_seq} AND ts > {cur}"),
        format!("dt = '{cur_dt}' AND seq >= {cur_seq} AND ts > {cur}"),
        format!("dt >= '{cur_dt}' AND seq >= {}", now_seq.min(cur_seq)),
    ]
}

fn parse_event(raw: &str) -> Result<CdcEvent> {
    let parsed: serde_json::Map<String, Value> =
        serde_json::from_str(raw).context("cdc support row is not json")?;

    let op = parsed
        .get("op")
        .and_then(|v| v.as_str())
        .and_then(MutationKind::parse)
        .with_context(|| format!("cdc row carries an unknown op: {raw}"))?;

    let pk = match parsed.get("pk") {
        Some(Value::String(s)) => match serde_json::from_str(s)? {
            Value::Object(map) => map,
            other => anyhow::bail!("cdc pk is not a json object: {other}"),
        },
        Some(Value::Object(map)) => map.clone(),
        other => anyhow::bail!("cdc pk column is missing or malformed: {other:?}"),
    };

    Ok(CdcEvent {
        op,
        pk,
        ts: parsed.get("ts").and_then(|v| v.as_i64()).unwrap_or(0),
        dt: parsed.get("dt").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        seq: parsed.get("seq").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cursor_regimes_cover_same_hour_same_day_and_rollover() {
        // cursor at 2026-08-01 10:30:00 UTC, "now" at 13:00 the same day
        let cur = Utc.with_ymd_and_hms(2026, 8, 1, 10, 30, 0).unwrap().timestamp_millis();
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();

        let clauses = cursor_clauses(cur, now);
        assert_eq!(clauses[0], format!("dt = '2026-08-01' AND seq = 10 AND ts > {cur}"));
        assert_eq!(clauses[1], format!("dt = '2026-08-01' AND seq >= 10 AND ts > {cur}"));
        assert_eq!(clauses[2], "dt >= '2026-08-01' AND seq >= 10");
    }

    #[test]
    fn cross_midnight_takes_the_smaller_seq() {
        // cursor at 23:xx, now just past midnight: min(0, 23) = 0
        let cur = Utc.with_ymd_and_hms(2026, 8, 1, 23, 50, 0).unwrap().timestamp_millis();
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 0, 10, 0).unwrap();

        let clauses = cursor_clauses(cur, now);
        assert_eq!(clauses[2], "dt >= '2026-08-01' AND seq >= 0");
    }

    #[test]
    fn parses_support_rows_with_embedded_pk_text() {
        let event = parse_event(
            r#"{"op":"INSERT","pk":"{\"id\":\"k1\"}","ts":77,"dt":"2026-08-01","seq":4}"#,
        )
        .unwrap();
        assert_eq!(event.op, MutationKind::Insert);
        assert_eq!(event.pk["id"], serde_json::json!("k1"));
        assert_eq!(event.ts, 77);
        assert_eq!(event.seq, 4);
    }
}
