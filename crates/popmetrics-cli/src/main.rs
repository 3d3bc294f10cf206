use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use popmetrics_storage::{AnalyticsStore, MemoryAnalyticsStore, PgAnalyticsStore, SqliteSourceStore};
use popmetrics_sync::{
    connect_cycle, invalidate_after, sync_task, CycleSummary, Scheduler, SyncConfig, SyncCycle,
    SystemClock, DEFAULT_TASK_NAME,
};
use popmetrics_web::{AppState, WebConfig, AGGREGATED_CACHE_KEY};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "popmetrics-cli")]
#[command(about = "Model popularity metrics sync and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and print its summary.
    Sync {
        /// Reconcile against an empty in-process store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply migrations and provision the aggregate view.
    Migrate,
    /// Run the scheduled sync alongside the read API until Ctrl-C.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let summary = if dry_run {
                let source = SqliteSourceStore::connect(&config.source_database_url)
                    .context("opening source store")?;
                let cycle = SyncCycle::new(
                    Arc::new(source),
                    Arc::new(MemoryAnalyticsStore::new()),
                    Arc::new(SystemClock),
                    &config,
                );
                cycle.run_once().await?
            } else {
                let (cycle, _) = connect_cycle(&config, Arc::new(SystemClock)).await?;
                cycle.run_once().await?
            };
            print_summary(&summary, dry_run);
        }
        Commands::Migrate => {
            let store = PgAnalyticsStore::connect(&config.database_url, config.max_connections)
                .await
                .context("connecting to analytics store")?;
            store.migrate().await.context("applying migrations")?;
            store
                .provision_aggregate_view()
                .await
                .context("provisioning aggregate view")?;
            println!("migrations applied, aggregate view provisioned");
        }
        Commands::Serve => serve(config).await?,
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let web_config = WebConfig::from_env();
    let (cycle, analytics) = connect_cycle(&config, Arc::new(SystemClock)).await?;

    let state = AppState::new(analytics as Arc<dyn AnalyticsStore>, web_config.cache_ttl);

    let task = invalidate_after(
        sync_task(Arc::new(cycle)),
        Arc::clone(&state.cache),
        AGGREGATED_CACHE_KEY,
    );
    let mut scheduler = Scheduler::new(Arc::new(SystemClock));
    scheduler.register_task(DEFAULT_TASK_NAME, task, config.sync_interval);
    let started_at = scheduler.start_all();
    info!(%started_at, tasks = ?scheduler.list_task_names(), "background sync running");

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "could not listen for Ctrl-C");
        }
        info!("shutdown requested");
    };
    let served = popmetrics_web::serve(state, &web_config, shutdown).await;

    scheduler.stop_all().await;
    served
}

fn print_summary(summary: &CycleSummary, dry_run: bool) {
    println!(
        "sync complete{}: run_id={} extracted={} discarded={} groups={} skipped={} late={} new_members={} new_buckets={} conflicts={}/{} view_refreshed={}",
        if dry_run { " (dry run)" } else { "" },
        summary.run_id,
        summary.extracted,
        summary.discarded,
        summary.groups,
        summary.skipped_groups,
        summary.late_members,
        summary.new_members,
        summary.new_buckets,
        summary.members_conflicted,
        summary.buckets_conflicted,
        summary.view_refreshed,
    );
}
