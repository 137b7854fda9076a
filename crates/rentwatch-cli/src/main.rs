use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rentwatch_core::Furnishing;
use rentwatch_storage::ReconcileAction;
use rentwatch_sync::{
    maybe_build_scheduler, MirrorStatus, Pipeline, RunConfig, RunSummary, Settings,
};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rentwatch")]
#[command(about = "Harvest rental listings into a historical table and a DynamoDB mirror")]
struct Cli {
    /// Run configuration file.
    #[arg(long, global = true, default_value = "rentwatch.yaml")]
    config: PathBuf,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest once, reconcile the history and mirror the batch.
    Run {
        /// Date stamped on harvested rows (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Print the search request for one facet and page without sending it.
    ShowQuery {
        #[arg(long, default_value = "furnished")]
        facet: Furnishing,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter);
    if json {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init();
    } else {
        builder.init();
    }
}

async fn load_settings(path: &Path) -> Result<Settings> {
    Settings::load(path)
        .await
        .with_context(|| format!("loading settings from {}", path.display()))
}

fn describe_reconcile(action: &ReconcileAction) -> String {
    match action {
        ReconcileAction::Created { rows, .. } => format!("created ({rows} rows)"),
        ReconcileAction::Merged {
            persisted_rows,
            duplicates_removed,
            ..
        } => format!("merged ({persisted_rows} rows, {duplicates_removed} duplicates dropped)"),
        ReconcileAction::SideFile { path, rows, .. } => {
            format!("schema mismatch, {rows} rows written to {}", path.display())
        }
        ReconcileAction::Skipped => "unchanged (nothing harvested)".to_string(),
    }
}

fn describe_mirror(status: &MirrorStatus) -> String {
    match status {
        MirrorStatus::Disabled => "disabled".to_string(),
        MirrorStatus::Written {
            succeeded, failed, ..
        } => format!("{succeeded} written, {failed} failed"),
        MirrorStatus::Unavailable { reason } => format!("unavailable: {reason}"),
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run complete: run_id={} date={} rows={} history={} mirror={}",
        summary.run_id,
        summary.run_date,
        summary.harvested_rows,
        describe_reconcile(&summary.reconcile.action),
        describe_mirror(&summary.mirror)
    );
    for count in &summary.facets {
        println!("  {}: {} pages, {} rows", count.facet, count.pages, count.records);
    }
    for failure in &summary.facet_failures {
        println!("  {} failed at page {}: {}", failure.facet, failure.page, failure.message);
    }
    if let Some(backup) = &summary.reconcile.backup {
        println!("  backup: {}", backup.display());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command.unwrap_or(Commands::Run { date: None }) {
        Commands::Run { date } => {
            let settings = load_settings(&cli.config).await?;
            let pipeline = Pipeline::from_settings(&settings).await?;
            let run_date = date.unwrap_or_else(|| Local::now().date_naive());
            let summary = pipeline.run_once(run_date).await?;
            print_summary(&summary);
        }
        Commands::Schedule => {
            let settings = load_settings(&cli.config).await?;
            let pipeline = Arc::new(Pipeline::from_settings(&settings).await?);
            let Some(mut sched) = maybe_build_scheduler(pipeline, &settings.run.scheduler).await?
            else {
                bail!("scheduler is disabled in {}", cli.config.display());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::ShowQuery { facet, page } => {
            let run = RunConfig::load(&cli.config)
                .await
                .with_context(|| format!("loading {}", cli.config.display()))?;
            run.validate()?;
            println!(
                "POST {}?{}",
                run.api.search_url(),
                run.query.encode(run.page_size, Some(facet), Some(page))
            );
        }
    }

    Ok(())
}
