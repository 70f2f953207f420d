use thiserror::Error;

/// Error kinds that cross component boundaries. Per-row failures are
/// downgraded where the applier loop continues; startup failures abort.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("preflight failed: {0}")]
    Preflight(String),

    #[error("unknown cassandra type: {0}")]
    CassandraType(String),

    #[error("compression produced an empty column set")]
    Compression,

    #[error("large object upload failed: {0}")]
    LargeObject(String),

    #[error("target write retries exhausted: {0}")]
    RetryExhausted(String),

    #[error("stats write failed: {0}")]
    StatsWrite(String),
}
