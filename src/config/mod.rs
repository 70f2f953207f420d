mod mapping;
mod settings;

pub use mapping::{
    optional_column, CompressionMapping, JsonMapping, KeyspacesMapping, LargeObjectsMapping,
    MaterializedViewMapping, ReplicationMapping, TokenRangesMapping, TransformationMapping,
};
pub use settings::{ClusterSettings, ReplicatorSettings, Settings};
