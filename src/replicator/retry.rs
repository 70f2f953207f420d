use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use scylla::transport::errors::{DbError, QueryError};
use scylla::Session;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ReplicationError;
use crate::storage::snapshot::MutationKind;
use crate::storage::StagingClient;

const MAX_ATTEMPTS: u32 = 64;
const INITIAL_BACKOFF_MS: f64 = 25.0;
const BACKOFF_MULTIPLIER: f64 = 1.1;

enum Disposition {
    Retry,
    Fail,
}

/// Execute one target statement with bounded exponential backoff; when the
/// budget is exhausted or the error is not retryable, divert the raw CQL
/// text to the DLQ and report success so the applier moves on.
pub async fn execute_with_dlq(
    target: &Session,
    staging: &StagingClient,
    tile: i32,
    kind: MutationKind,
    cql: &str,
) -> Result<()> {
    match run_with_backoff(target, cql).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("Diverting failed {} statement to DLQ: {e}", kind.dlq_dir());
            let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
            let path = staging.dlq_object(tile, kind.dlq_dir(), &timestamp);
            staging
                .put_bytes(&path, cql.as_bytes().to_vec())
                .await
                .context("failed to persist statement to DLQ")?;
            Ok(())
        }
    }
}

/// Retry-only path used for TTL writes, which are not diverted to the DLQ.
pub async fn execute_with_retry(target: &Session, cql: &str) -> Result<()> {
    run_with_backoff(target, cql)
        .await
        .map_err(|e| ReplicationError::RetryExhausted(e.to_string()))?;
    Ok(())
}

async fn run_with_backoff(target: &Session, cql: &str) -> Result<(), QueryError> {
    let mut delay_ms = INITIAL_BACKOFF_MS;
    let mut attempt = 1;
    loop {
        match target.query(cql, ()).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                if matches!(classify(&e), Disposition::Fail) {
                    return Err(e);
                }
                if attempt >= MAX_ATTEMPTS {
                    warn!("Target write failed after {MAX_ATTEMPTS} attempts: {e}");
                    return Err(e);
                }
                debug!("Retryable target write failure (attempt {attempt}): {e}");
                sleep(Duration::from_millis(delay_ms as u64)).await;
                delay_ms *= BACKOFF_MULTIPLIER;
                attempt += 1;
            }
        }
    }
}

/// Write failures, timeouts, unavailability and generic driver errors are
/// retried; statement-level rejections go straight to the DLQ.
fn classify(error: &QueryError) -> Disposition {
    match error {
        QueryError::DbError(db, _) => match db {
            DbError::SyntaxError
            | DbError::Invalid
            | DbError::Unauthorized
            | DbError::AuthenticationError
            | DbError::ProtocolError
            | DbError::AlreadyExists { .. }
            | DbError::Unprepared { .. }
            | DbError::FunctionFailure { .. } => Disposition::Fail,
            _ => Disposition::Retry,
        },
        QueryError::BadQuery(_) => Disposition::Fail,
        _ => Disposition::Retry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db(err: DbError) -> QueryError {
        QueryError::DbError(err, "test".to_string())
    }

    #[test]
    fn transient_write_errors_are_retried() {
        for err in [
            db(DbError::Overloaded),
            db(DbError::ServerError),
            db(DbError::IsBootstrapping),
            db(DbError::TruncateError),
        ] {
            assert!(matches!(classify(&err), Disposition::Retry));
        }
    }

    #[test]
    fn statement_rejections_fail_immediately() {
        for err in [db(DbError::SyntaxError), db(DbError::Invalid), db(DbError::Unauthorized)] {
            assert!(matches!(classify(&err), Disposition::Fail));
        }
    }
}
