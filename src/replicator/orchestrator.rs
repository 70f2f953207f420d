use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use scylla::Session;
use tokio::time::sleep;
use tracing::{error, info};

use super::applier::Applier;
use super::discovery::DiscoveryEngine;
use super::{dlq, JobSpec, ProcessType, ReplicatorContext};
use crate::cql::table_exists;
use crate::error::ReplicationError;
use crate::ledger::Ledger;

/// Cooldown between cycles in safe mode.
const WAIT_TIME: Duration = Duration::from_secs(20);

/// Top-level loop for one tile and process type. Each pass checks the stop
/// flag, runs the engine for this process, and sleeps if safe mode asks
/// for a cooldown. Cycle failures are logged and retried from ledger state
/// on the next pass.
pub struct Orchestrator {
    ctx: Arc<ReplicatorContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<ReplicatorContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> Result<()> {
        let spec = &self.ctx.spec;
        let discovery = DiscoveryEngine::new(Arc::clone(&self.ctx));
        let applier = Applier::new(Arc::clone(&self.ctx));

        info!(
            "Starting {} loop for {} tile {}/{}",
            spec.process.as_str(),
            self.ctx.source_table_ref(),
            spec.tile,
            spec.total_tiles
        );

        loop {
            if self
                .ctx
                .staging
                .check_and_clear_stop(spec.process.as_str(), spec.tile)
                .await?
            {
                break;
            }

            let cycle = match spec.process {
                ProcessType::Discovery => discovery.run_cycle().await,
                ProcessType::Replication => {
                    if spec.replay_log {
                        dlq::replay(&self.ctx.target, &self.ctx.staging, spec.tile).await
                    } else {
                        Ok(())
                    }
                    .and(applier.run_cycle().await)
                }
            };

            if let Err(e) = cycle {
                error!("Cycle failed for tile {}: {e:#}", spec.tile);
            }

            if spec.safe_mode {
                sleep(WAIT_TIME).await;
            }
        }

        info!("Stop flag honored, {} loop for tile {} done", spec.process.as_str(), spec.tile);
        Ok(())
    }
}

/// Startup checks: both sessions answer, the replicated table exists on
/// each side (and the materialized view when configured), the ledger
/// tables are in place, and a requested cleanup has run.
pub async fn preflight(
    source: &Session,
    target: &Session,
    spec: &JobSpec,
    mv_name: Option<&str>,
    ledger: &Ledger,
) -> Result<()> {
    if !table_exists(source, &spec.source_keyspace, &spec.source_table).await? {
        anyhow::bail!(ReplicationError::Preflight(format!(
            "source table {}.{} does not exist",
            spec.source_keyspace, spec.source_table
        )));
    }
    if let Some(mv) = mv_name {
        if !table_exists(source, &spec.source_keyspace, mv).await? {
            anyhow::bail!(ReplicationError::Preflight(format!(
                "materialized view {}.{mv} does not exist",
                spec.source_keyspace
            )));
        }
    }
    if !table_exists(target, &spec.target_keyspace, &spec.target_table).await? {
        anyhow::bail!(ReplicationError::Preflight(format!(
            "target table {}.{} does not exist",
            spec.target_keyspace, spec.target_table
        )));
    }

    ledger.ensure_tables().await?;

    if spec.cleanup_requested && spec.process == ProcessType::Discovery {
        ledger.initialize_if_requested().await?;
    }

    info!("Preflight passed for {}.{}", spec.source_keyspace, spec.source_table);
    Ok(())
}
