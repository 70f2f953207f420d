use anyhow::Result;
use scylla::Session;
use tracing::{info, warn};

use crate::storage::snapshot::MutationKind;
use crate::storage::StagingClient;

/// Replay dead-lettered statements with an `IF NOT EXISTS` guard so a
/// replayed insert can never clobber a row the pipeline has since moved
/// past. Objects are deleted only after a successful execution; failures
/// stay queued for the next loop.
pub async fn replay(target: &Session, staging: &StagingClient, tile: i32) -> Result<()> {
    for kind in MutationKind::ALL {
        for path in staging.list_dlq(tile, kind.dlq_dir()).await? {
            let body = staging.get_bytes(&path).await?;
            let Ok(cql) = String::from_utf8(body.to_vec()) else {
                warn!("DLQ object {path} is not utf-8, leaving in place");
                continue;
            };

            match target.query(replay_statement(kind, &cql), ()).await {
                Ok(_) => {
                    staging.delete(&path).await?;
                    info!("Replayed DLQ statement from {path}");
                }
                Err(e) => {
                    warn!("DLQ replay of {path} failed, leaving in place: {e}");
                }
            }
        }
    }
    Ok(())
}

/// Deletes are idempotent on their own; the conditional guard only exists
/// for the insert-shaped statements.
fn replay_statement(kind: MutationKind, cql: &str) -> String {
    match kind {
        MutationKind::Delete => cql.trim_end().to_string(),
        _ => format!("{} IF NOT EXISTS", cql.trim_end()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_replay_with_the_existence_guard() {
        assert_eq!(
            replay_statement(MutationKind::Insert, "INSERT INTO k.t JSON '{\"pk\":1}'  "),
            "INSERT INTO k.t JSON '{\"pk\":1}' IF NOT EXISTS"
        );
        assert_eq!(
            replay_statement(MutationKind::Update, "INSERT INTO k.t JSON '{\"pk\":1}'"),
            "INSERT INTO k.t JSON '{\"pk\":1}' IF NOT EXISTS"
        );
    }

    #[test]
    fn deletes_replay_verbatim() {
        assert_eq!(
            replay_statement(MutationKind::Delete, "DELETE FROM k.t WHERE pk = 1\n"),
            "DELETE FROM k.t WHERE pk = 1"
        );
    }
}
