use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser};
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tilesync::config::{optional_column, JsonMapping, Settings};
use tilesync::cql::{self, TableSchema};
use tilesync::ledger::Ledger;
use tilesync::replicator::orchestrator::{preflight, Orchestrator};
use tilesync::replicator::{JobSpec, ProcessType, ReplicatorContext};
use tilesync::storage::{open_offload_store, StagingClient};
use tilesync::transform::PayloadTransformer;

#[derive(Parser)]
#[command(name = "tilesync", about = "Tile-parallel CQL table replicator")]
struct Args {
    #[arg(long)]
    job_name: String,

    /// Tile handled by this process, 0 <= tile < total_tiles
    #[arg(long)]
    tile: i32,

    #[arg(long)]
    total_tiles: i32,

    /// "discovery" or "replication"
    #[arg(long)]
    process_type: String,

    #[arg(long)]
    source_ks: String,

    #[arg(long)]
    source_tbl: String,

    #[arg(long)]
    target_ks: String,

    #[arg(long)]
    target_tbl: String,

    /// Column whose writetime() drives conflict resolution ("None" disables)
    #[arg(long, default_value = "None")]
    writetime_column: String,

    /// Column whose ttl() is replayed as USING TTL ("None" disables)
    #[arg(long, default_value = "None")]
    ttl_column: String,

    /// Staging root, e.g. s3://bucket/prefix
    #[arg(long)]
    s3_landing_zone: String,

    /// Epoch millis; > 0 restricts discovery to keys written after it
    #[arg(long, default_value_t = 0)]
    replication_point_in_time: i64,

    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    safe_mode: bool,

    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    cleanup_requested: bool,

    /// Base64-encoded JSON mapping ("None" for defaults)
    #[arg(long, default_value = "None")]
    json_mapping: String,

    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    replay_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::new().unwrap_or_else(|e| {
        error!("Failed to load configuration: {:?}", e);
        std::process::exit(1);
    });

    let process = ProcessType::parse(&args.process_type).unwrap_or_else(|e| {
        error!("{e:?}");
        std::process::exit(1);
    });

    let spec = JobSpec {
        job_name: args.job_name,
        tile: args.tile,
        total_tiles: args.total_tiles,
        process,
        source_keyspace: args.source_ks,
        source_table: args.source_tbl,
        target_keyspace: args.target_ks,
        target_table: args.target_tbl,
        writetime_column: optional_column(&args.writetime_column),
        ttl_column: optional_column(&args.ttl_column),
        landing_zone: args.s3_landing_zone,
        replication_point_in_time: args.replication_point_in_time,
        safe_mode: args.safe_mode,
        cleanup_requested: args.cleanup_requested,
        replay_log: args.replay_log,
    };
    let mapping = JsonMapping::from_base64(&args.json_mapping);

    info!(
        "Starting job {} ({} tile {}/{}) for {}.{} -> {}.{}",
        spec.job_name,
        spec.process.as_str(),
        spec.tile,
        spec.total_tiles,
        spec.source_keyspace,
        spec.source_table,
        spec.target_keyspace,
        spec.target_table
    );

    // Everything up to and including preflight is fatal: exit -1 so the job
    // runtime can tell a misconfigured tile from a clean stop.
    let ctx = match bootstrap(spec, mapping, settings).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Preflight failed: {e:#}");
            std::process::exit(-1);
        }
    };

    Orchestrator::new(ctx).run().await?;

    info!("Replicator stopped cleanly");
    Ok(())
}

async fn bootstrap(
    spec: JobSpec,
    mapping: JsonMapping,
    settings: Settings,
) -> Result<Arc<ReplicatorContext>> {
    let source = cql::connect(&settings.source).await?;
    let target = cql::connect(&settings.target).await?;
    info!("Connected to source and target clusters");

    let ledger = Ledger::new(
        Arc::clone(&target),
        &settings.replicator.ledger_keyspace,
        &spec.source_keyspace,
        &spec.source_table,
    );

    let mv = &mapping.replication.use_materialized_view;
    let mv_name = mv.enabled.then_some(mv.mv_name.as_str());
    preflight(&source, &target, &spec, mv_name, &ledger).await?;

    let schema = Arc::new(TableSchema::load(&source, &spec.source_keyspace, &spec.source_table).await?);
    let staging = StagingClient::open(&spec.landing_zone, &spec.source_keyspace, &spec.source_table)?;

    let large_objects = &mapping.keyspaces.large_objects_config;
    let offload_store = if large_objects.enabled {
        Some(open_offload_store(&large_objects.bucket)?)
    } else {
        None
    };
    let transformer = PayloadTransformer::new(
        mapping.keyspaces.clone(),
        offload_store,
        schema.pk_names().iter().map(|s| s.to_string()).collect(),
    );

    Ok(Arc::new(ReplicatorContext {
        spec,
        mapping,
        settings: settings.replicator,
        source,
        target,
        staging,
        schema,
        ledger,
        transformer,
    }))
}
