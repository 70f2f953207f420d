use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::Value;

use crate::cql::PrimaryKey;

/// Insert/update/delete, shared by CDC events, DLQ folders and the retry
/// writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl MutationKind {
    pub const ALL: [MutationKind; 3] = [MutationKind::Insert, MutationKind::Update, MutationKind::Delete];

    /// Folder name under the DLQ prefix.
    pub fn dlq_dir(&self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }

    /// Label stored in the CDC support table and event snapshots.
    pub fn cdc_label(&self) -> &'static str {
        match self {
            MutationKind::Insert => "INSERT",
            MutationKind::Update => "UPDATE",
            MutationKind::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str) -> Option<MutationKind> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(MutationKind::Insert),
            "UPDATE" => Some(MutationKind::Update),
            "DELETE" => Some(MutationKind::Delete),
            _ => None,
        }
    }
}

/// A staged primary-key snapshot: one column per pk column holding the
/// value's JSON fragment, plus the writetime (`ts`, 0 when no writetime
/// column is configured). Stored as a single Parquet object per slot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotData {
    pub pk_columns: Vec<String>,
    pub rows: Vec<SnapshotRow>,
}

#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub values: Vec<Value>,
    pub ts: i64,
}

impl SnapshotData {
    pub fn new(pk_columns: Vec<String>) -> Self {
        Self { pk_columns, rows: Vec::new() }
    }

    pub fn primary_key(&self, row: &SnapshotRow) -> PrimaryKey {
        let mut pk = PrimaryKey::new();
        for (name, value) in self.pk_columns.iter().zip(row.values.iter()) {
            pk.push(name.clone(), value.clone());
        }
        pk
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut fields: Vec<Field> = self
            .pk_columns
            .iter()
            .map(|name| Field::new(name.as_str(), DataType::Utf8, false))
            .collect();
        fields.push(Field::new("ts", DataType::Int64, false));
        let schema = Arc::new(Schema::new(fields));

        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.pk_columns.len() + 1);
        for (idx, _) in self.pk_columns.iter().enumerate() {
            let column: Vec<String> = self.rows.iter().map(|r| r.values[idx].to_string()).collect();
            arrays.push(Arc::new(StringArray::from(column)));
        }
        arrays.push(Arc::new(Int64Array::from(
            self.rows.iter().map(|r| r.ts).collect::<Vec<_>>(),
        )));

        let batch = RecordBatch::try_new(schema.clone(), arrays)?;
        write_parquet(schema, batch)
    }

    pub fn decode(bytes: Bytes) -> Result<SnapshotData> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .context("failed to open snapshot parquet")?;
        let pk_columns: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .filter(|n| n != "ts")
            .collect();

        let mut data = SnapshotData::new(pk_columns);
        for batch in builder.build()? {
            let batch = batch?;
            let ts = int64_column(&batch, "ts")?;
            let columns: Vec<&StringArray> = data
                .pk_columns
                .iter()
                .map(|name| utf8_column(&batch, name))
                .collect::<Result<_>>()?;
            for row_idx in 0..batch.num_rows() {
                let values = columns
                    .iter()
                    .map(|col| parse_fragment(col.value(row_idx)))
                    .collect();
                data.rows.push(SnapshotRow { values, ts: ts.value(row_idx) });
            }
        }
        Ok(data)
    }
}

/// One change event staged from the CDC support table.
#[derive(Debug, Clone)]
pub struct CdcEvent {
    pub op: MutationKind,
    pub pk: serde_json::Map<String, Value>,
    pub ts: i64,
    pub dt: String,
    pub seq: i32,
}

impl CdcEvent {
    /// Dedup identity within one staged snapshot.
    pub fn dedup_key(&self) -> (MutationKind, String, String, i32) {
        (self.op, Value::Object(self.pk.clone()).to_string(), self.dt.clone(), self.seq)
    }
}

pub fn encode_cdc_events(events: &[CdcEvent]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("op", DataType::Utf8, false),
        Field::new("pk", DataType::Utf8, false),
        Field::new("ts", DataType::Int64, false),
        Field::new("dt", DataType::Utf8, false),
        Field::new("seq", DataType::Int32, false),
    ]));

    let ops: Vec<&str> = events.iter().map(|e| e.op.cdc_label()).collect();
    let pks: Vec<String> = events.iter().map(|e| Value::Object(e.pk.clone()).to_string()).collect();
    let arrays: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(ops)),
        Arc::new(StringArray::from(pks)),
        Arc::new(Int64Array::from(events.iter().map(|e| e.ts).collect::<Vec<_>>())),
        Arc::new(StringArray::from(events.iter().map(|e| e.dt.as_str()).collect::<Vec<_>>())),
        Arc::new(Int32Array::from(events.iter().map(|e| e.seq).collect::<Vec<_>>())),
    ];

    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    write_parquet(schema, batch)
}

pub fn decode_cdc_events(bytes: Bytes) -> Result<Vec<CdcEvent>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .context("failed to open cdc event parquet")?;

    let mut events = Vec::new();
    for batch in builder.build()? {
        let batch = batch?;
        let ops = utf8_column(&batch, "op")?;
        let pks = utf8_column(&batch, "pk")?;
        let ts = int64_column(&batch, "ts")?;
        let dts = utf8_column(&batch, "dt")?;
        let seqs = int32_column(&batch, "seq")?;

        for idx in 0..batch.num_rows() {
            let op = MutationKind::parse(ops.value(idx))
                .with_context(|| format!("unknown cdc op {}", ops.value(idx)))?;
            let pk = match serde_json::from_str(pks.value(idx))? {
                Value::Object(map) => map,
                other => anyhow::bail!("cdc pk is not a json object: {other}"),
            };
            events.push(CdcEvent {
                op,
                pk,
                ts: ts.value(idx),
                dt: dts.value(idx).to_string(),
                seq: seqs.value(idx),
            });
        }
    }
    Ok(events)
}

fn write_parquet(schema: Arc<Schema>, batch: RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}

fn parse_fragment(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn utf8_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    column(batch, name)?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("column {name} is not utf8"))
}

fn int64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    column(batch, name)?
        .as_any()
        .downcast_ref::<Int64Array>()
        .with_context(|| format!("column {name} is not int64"))
}

fn int32_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int32Array> {
    column(batch, name)?
        .as_any()
        .downcast_ref::<Int32Array>()
        .with_context(|| format!("column {name} is not int32"))
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .with_context(|| format!("column {name} missing from staged parquet"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_survives_encode_decode() {
        let mut data = SnapshotData::new(vec!["id".into(), "seq".into()]);
        data.rows.push(SnapshotRow { values: vec![json!("a"), json!(1)], ts: 10 });
        data.rows.push(SnapshotRow { values: vec![json!("b"), json!(2)], ts: 0 });

        let decoded = SnapshotData::decode(Bytes::from(data.encode().unwrap())).unwrap();
        assert_eq!(decoded.pk_columns, vec!["id", "seq"]);
        assert_eq!(decoded.rows.len(), 2);
        assert_eq!(decoded.rows[0].values, vec![json!("a"), json!(1)]);
        assert_eq!(decoded.rows[0].ts, 10);

        let pk = decoded.primary_key(&decoded.rows[1]);
        assert_eq!(pk.get("id"), Some(&json!("b")));
        assert_eq!(pk.get("seq"), Some(&json!(2)));
    }

    #[test]
    fn cdc_events_survive_encode_decode() {
        let mut pk = serde_json::Map::new();
        pk.insert("id".into(), json!("k"));
        let events = vec![
            CdcEvent { op: MutationKind::Insert, pk: pk.clone(), ts: 5, dt: "2026-08-01".into(), seq: 3 },
            CdcEvent { op: MutationKind::Delete, pk, ts: 6, dt: "2026-08-01".into(), seq: 3 },
        ];

        let decoded = decode_cdc_events(Bytes::from(encode_cdc_events(&events).unwrap())).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].op, MutationKind::Insert);
        assert_eq!(decoded[1].op, MutationKind::Delete);
        assert_eq!(decoded[0].pk["id"], json!("k"));
        assert_eq!(decoded[1].ts, 6);
    }

    #[test]
    fn mutation_kind_labels() {
        assert_eq!(MutationKind::Insert.dlq_dir(), "insert");
        assert_eq!(MutationKind::Update.cdc_label(), "UPDATE");
        assert_eq!(MutationKind::parse("delete"), Some(MutationKind::Delete));
        assert_eq!(MutationKind::parse("upsert"), None);
    }
}
