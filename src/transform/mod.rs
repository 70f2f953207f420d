use std::sync::Arc;

use bytes::Bytes;
use lz4_flex::block::compress_prepend_size;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde_json::{Map, Value};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::debug;
use uuid::Uuid;

use crate::config::KeyspacesMapping;
use crate::error::ReplicationError;

const OFFLOAD_NODE: [u8; 6] = [0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f];

/// Rewrites a row payload before it is rendered into `INSERT JSON`:
/// large-value offload to the blob bucket first, then column-set
/// compression over what remains.
pub struct PayloadTransformer {
    mapping: KeyspacesMapping,
    offload_store: Option<Arc<dyn ObjectStore>>,
    pk_names: Vec<String>,
}

impl PayloadTransformer {
    pub fn new(
        mapping: KeyspacesMapping,
        offload_store: Option<Arc<dyn ObjectStore>>,
        pk_names: Vec<String>,
    ) -> Self {
        Self { mapping, offload_store, pk_names }
    }

    pub fn is_noop(&self) -> bool {
        !self.mapping.compression_config.enabled && !self.mapping.large_objects_config.enabled
    }

    /// `pk_fragments` are the unquoted WHERE-clause value fragments, used to
    /// derive the offload key when uuid references are disabled.
    pub async fn transform(
        &self,
        payload: &mut Map<String, Value>,
        pk_fragments: &[String],
    ) -> Result<(), ReplicationError> {
        if self.mapping.large_objects_config.enabled {
            self.offload_large_object(payload, pk_fragments).await?;
        }
        if self.mapping.compression_config.enabled {
            self.compress_columns(payload)?;
        }
        Ok(())
    }

    async fn offload_large_object(
        &self,
        payload: &mut Map<String, Value>,
        pk_fragments: &[String],
    ) -> Result<(), ReplicationError> {
        let config = &self.mapping.large_objects_config;
        let value = match payload.remove(&config.column) {
            Some(Value::Null) | None => return Ok(()),
            Some(value) => value,
        };

        let scalar = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let body = Bytes::from(compress_prepend_size(scalar.as_bytes()));

        let (path, reference) = if config.enable_ref_by_time_uuid {
            let id = Uuid::now_v1(&OFFLOAD_NODE);
            (
                Path::from(format!("{}/{}", config.prefix.trim_matches('/'), id)),
                Some(id.to_string()),
            )
        } else {
            (
                Path::from(format!(
                    "{}/key={}/payload",
                    config.prefix.trim_matches('/'),
                    pk_fragments.join(":")
                )),
                None,
            )
        };

        let store = self
            .offload_store
            .as_ref()
            .ok_or_else(|| ReplicationError::LargeObject("offload bucket not opened".into()))?;

        let strategy = ExponentialBackoff::from_millis(10).map(jitter).take(5);
        Retry::spawn(strategy, || {
            let store = Arc::clone(store);
            let path = path.clone();
            let body = body.clone();
            async move { store.put(&path, PutPayload::from(body)).await }
        })
        .await
        .map_err(|e| ReplicationError::LargeObject(e.to_string()))?;

        debug!("Offloaded column {} to {path}", config.column);
        if let Some(id) = reference {
            payload.insert(config.xref.clone(), Value::String(id));
        }
        Ok(())
    }

    fn compress_columns(&self, payload: &mut Map<String, Value>) -> Result<(), ReplicationError> {
        let config = &self.mapping.compression_config;
        let chosen: Vec<String> = if config.compress_all_non_primary_columns {
            payload
                .keys()
                .filter(|name| !self.pk_names.iter().any(|pk| pk == *name))
                .cloned()
                .collect()
        } else {
            config.compress_non_primary_columns.clone()
        };

        let mut subtree = Map::new();
        for name in chosen {
            if let Some(value) = payload.remove(&name) {
                subtree.insert(name, value);
            }
        }
        if subtree.is_empty() {
            return Err(ReplicationError::Compression);
        }

        let serialized = Value::Object(subtree).to_string();
        let compressed = compress_prepend_size(serialized.as_bytes());
        payload.insert(
            config.target_name_column.clone(),
            Value::String(format!("0x{}", hex::encode(compressed))),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionMapping, LargeObjectsMapping};
    use lz4_flex::block::decompress_size_prepended;
    use object_store::memory::InMemory;
    use serde_json::json;

    fn payload() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".into(), json!("k1"));
        map.insert("v".into(), json!("value"));
        map.insert("photo".into(), json!("binary-ish"));
        map
    }

    fn compression(all: bool, columns: Vec<&str>) -> KeyspacesMapping {
        KeyspacesMapping {
            compression_config: CompressionMapping {
                enabled: true,
                compress_all_non_primary_columns: all,
                compress_non_primary_columns: columns.into_iter().map(String::from).collect(),
                target_name_column: "packed".into(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn compresses_the_chosen_columns() {
        let t = PayloadTransformer::new(compression(false, vec!["v"]), None, vec!["id".into()]);
        let mut p = payload();
        t.transform(&mut p, &[]).await.unwrap();

        assert!(p.get("v").is_none());
        assert_eq!(p["id"], json!("k1"));

        let packed = p["packed"].as_str().unwrap().strip_prefix("0x").unwrap().to_string();
        let decompressed = decompress_size_prepended(&hex::decode(packed).unwrap()).unwrap();
        let restored: Value = serde_json::from_slice(&decompressed).unwrap();
        assert_eq!(restored, json!({"v": "value"}));
    }

    #[tokio::test]
    async fn all_non_primary_spares_the_key_columns() {
        let t = PayloadTransformer::new(compression(true, vec![]), None, vec!["id".into()]);
        let mut p = payload();
        t.transform(&mut p, &[]).await.unwrap();

        assert_eq!(p["id"], json!("k1"));
        assert!(p.get("v").is_none());
        assert!(p.get("photo").is_none());
        assert!(p.get("packed").is_some());
    }

    #[tokio::test]
    async fn empty_column_set_is_a_compression_error() {
        let t = PayloadTransformer::new(compression(false, vec!["absent"]), None, vec!["id".into()]);
        let mut p = payload();
        let err = t.transform(&mut p, &[]).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Compression));
    }

    fn offload(uuid_ref: bool) -> KeyspacesMapping {
        KeyspacesMapping {
            large_objects_config: LargeObjectsMapping {
                enabled: true,
                column: "photo".into(),
                bucket: "blobs".into(),
                prefix: "offload".into(),
                enable_ref_by_time_uuid: uuid_ref,
                xref: "photo_ref".into(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn offload_by_uuid_rewrites_the_xref() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let t = PayloadTransformer::new(offload(true), Some(Arc::clone(&store)), vec!["id".into()]);
        let mut p = payload();
        t.transform(&mut p, &["k1".into()]).await.unwrap();

        assert!(p.get("photo").is_none());
        let id = p["photo_ref"].as_str().unwrap().to_string();
        let staged = store.get(&Path::from(format!("offload/{id}"))).await.unwrap();
        let bytes = staged.bytes().await.unwrap();
        let original = decompress_size_prepended(&bytes).unwrap();
        assert_eq!(original, b"binary-ish");
    }

    #[tokio::test]
    async fn offload_by_key_uses_the_where_fragments() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let t = PayloadTransformer::new(offload(false), Some(Arc::clone(&store)), vec!["id".into()]);
        let mut p = payload();
        t.transform(&mut p, &["k1".into(), "7".into()]).await.unwrap();

        assert!(p.get("photo").is_none());
        assert!(p.get("photo_ref").is_none());
        assert!(store.get(&Path::from("offload/key=k1:7/payload")).await.is_ok());
    }

    #[tokio::test]
    async fn offload_runs_before_compression() {
        let mut mapping = offload(true);
        mapping.compression_config = compression(true, vec![]).compression_config;
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let t = PayloadTransformer::new(mapping, Some(store), vec!["id".into()]);

        let mut p = payload();
        t.transform(&mut p, &["k1".into()]).await.unwrap();

        // photo went to the bucket, everything else non-pk was packed,
        // including the freshly written xref
        assert_eq!(p.keys().collect::<Vec<_>>(), vec!["id", "packed"]);
    }
}
