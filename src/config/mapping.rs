use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tracing::warn;

/// Job mapping passed on the command line as one base64-encoded JSON blob.
/// Anything missing or unparseable falls back to the defaults, matching the
/// contract that a bad mapping behaves like no mapping at all.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JsonMapping {
    pub replication: ReplicationMapping,
    pub keyspaces: KeyspacesMapping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplicationMapping {
    pub all_columns: bool,
    pub columns: Vec<String>,
    pub use_custom_serializer: bool,
    pub use_materialized_view: MaterializedViewMapping,
    pub filtering_by_token_ranges: TokenRangesMapping,
}

impl Default for ReplicationMapping {
    fn default() -> Self {
        Self {
            all_columns: true,
            columns: Vec::new(),
            use_custom_serializer: false,
            use_materialized_view: MaterializedViewMapping::default(),
            filtering_by_token_ranges: TokenRangesMapping::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MaterializedViewMapping {
    pub enabled: bool,
    pub mv_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TokenRangesMapping {
    pub enabled: bool,
    pub token_ranges: Vec<String>,
}

impl TokenRangesMapping {
    /// Parse the configured `"lo,hi"` strings into half-open `(lo, hi]`
    /// ranges, dropping any that do not parse.
    pub fn parsed_ranges(&self) -> Vec<(i64, i64)> {
        self.token_ranges
            .iter()
            .filter_map(|raw| {
                let (lo, hi) = raw.split_once(',')?;
                Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyspacesMapping {
    pub compression_config: CompressionMapping,
    pub large_objects_config: LargeObjectsMapping,
    pub transformation: TransformationMapping,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionMapping {
    pub enabled: bool,
    pub compress_non_primary_columns: Vec<String>,
    pub compress_all_non_primary_columns: bool,
    pub target_name_column: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LargeObjectsMapping {
    pub enabled: bool,
    pub column: String,
    pub bucket: String,
    pub prefix: String,
    #[serde(rename = "enableRefByTimeUUID")]
    pub enable_ref_by_time_uuid: bool,
    pub xref: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransformationMapping {
    pub enabled: bool,
    pub filter_expression: String,
}

impl JsonMapping {
    /// Decode the base64-wrapped JSON mapping argument. The sentinel value
    /// `"None"` and any decode or parse failure yield the default mapping.
    pub fn from_base64(raw: &str) -> Self {
        if raw.is_empty() || raw == "None" {
            return Self::default();
        }

        let decoded = match BASE64.decode(raw.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to base64-decode the json mapping: {e}; using defaults");
                return Self::default();
            }
        };

        match serde_json::from_slice(&decoded) {
            Ok(mapping) => mapping,
            Err(e) => {
                warn!("Failed to parse the json mapping: {e}; using defaults");
                Self::default()
            }
        }
    }
}

/// The CLI uses the literal string "None" to disable optional column
/// mappings such as the writetime and TTL columns.
pub fn optional_column(raw: &str) -> Option<String> {
    if raw.is_empty() || raw == "None" {
        None
    } else {
        Some(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_on_sentinel_and_garbage() {
        let m = JsonMapping::from_base64("None");
        assert!(m.replication.all_columns);
        assert!(!m.keyspaces.compression_config.enabled);

        let m = JsonMapping::from_base64("!!not-base64!!");
        assert!(!m.replication.use_custom_serializer);
    }

    #[test]
    fn parses_full_mapping() {
        let json = serde_json::json!({
            "replication": {
                "allColumns": false,
                "columns": ["pk", "v"],
                "useCustomSerializer": true,
                "useMaterializedView": {"enabled": true, "mvName": "t_mv"},
                "filteringByTokenRanges": {"enabled": true, "tokenRanges": ["-100,100", "200,300"]}
            },
            "keyspaces": {
                "compressionConfig": {
                    "enabled": true,
                    "compressNonPrimaryColumns": ["v"],
                    "compressAllNonPrimaryColumns": false,
                    "targetNameColumn": "packed"
                },
                "largeObjectsConfig": {
                    "enabled": true,
                    "column": "photo",
                    "bucket": "blobs",
                    "prefix": "offload",
                    "enableRefByTimeUUID": true,
                    "xref": "photo_ref"
                },
                "transformation": {"enabled": true, "filterExpression": "v > 5"}
            }
        });
        let encoded = BASE64.encode(serde_json::to_vec(&json).unwrap());
        let m = JsonMapping::from_base64(&encoded);

        assert!(!m.replication.all_columns);
        assert_eq!(m.replication.columns, vec!["pk", "v"]);
        assert!(m.replication.use_custom_serializer);
        assert_eq!(m.replication.use_materialized_view.mv_name, "t_mv");
        assert_eq!(
            m.replication.filtering_by_token_ranges.parsed_ranges(),
            vec![(-100, 100), (200, 300)]
        );
        assert_eq!(m.keyspaces.compression_config.target_name_column, "packed");
        assert_eq!(m.keyspaces.large_objects_config.xref, "photo_ref");
        assert!(m.keyspaces.large_objects_config.enable_ref_by_time_uuid);
        assert_eq!(m.keyspaces.transformation.filter_expression, "v > 5");
    }

    #[test]
    fn optional_column_sentinel() {
        assert_eq!(optional_column("None"), None);
        assert_eq!(optional_column(""), None);
        assert_eq!(optional_column("ts_col"), Some("ts_col".to_string()));
    }
}
