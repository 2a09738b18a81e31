// src/main.rs
//
// =============================================================================
// RAGKEEPER: CLI ENTRY POINT
// =============================================================================
//
// Three subcommands: a single pipeline run, the scheduler + control surface
// service, and a config-only sanity check. Exit codes follow SPEC_FULL §6:
// 0 success, 1 partial success, 2 pipeline failure, 3 configuration error,
// 4 unrecoverable system error.

use anyhow::Result;
use clap::{Parser, Subcommand};
use ragkeeper::clock::SystemClock;
use ragkeeper::config::PipelineConfig;
use ragkeeper::control::{self, AppState};
use ragkeeper::error::IndexError;
use ragkeeper::perf::PerformanceMonitor;
use ragkeeper::pipeline::PipelineEngine;
use ragkeeper::report::RunStatus;
use ragkeeper::scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ragkeeper", version, about = "Incremental RAG corpus indexing pipeline")]
struct Cli {
    /// Path to a YAML config file. Falls back to RAGKEEPER_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the indexing pipeline once and exit.
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        collection: Option<String>,
        #[arg(long)]
        force_recreate: bool,
        #[arg(long, default_value = "manual")]
        job_id: String,
    },
    /// Start the scheduler and the HTTP control surface.
    Serve {
        #[arg(long, default_value = "data/scheduler_jobs.db")]
        jobs_db: PathBuf,
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
    },
    /// Load and validate a config file without running anything.
    Validate,
}

fn load_config(cli_path: Option<&PathBuf>) -> Result<PipelineConfig, IndexError> {
    let path = cli_path
        .cloned()
        .or_else(|| std::env::var("RAGKEEPER_CONFIG").ok().map(PathBuf::from));
    match path {
        Some(p) => PipelineConfig::from_yaml_file(p),
        None => {
            let cfg = PipelineConfig::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

fn apply_overrides(mut config: PipelineConfig, data_dir: Option<PathBuf>, collection: Option<String>, force_recreate: bool) -> PipelineConfig {
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    if let Some(name) = collection {
        config.collection_name = name;
    }
    if force_recreate {
        config.force_recreate = true;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let code = match cli.command {
        Commands::Run {
            data_dir,
            collection,
            force_recreate,
            job_id,
        } => run_once(cli.config.as_ref(), data_dir, collection, force_recreate, job_id).await,
        Commands::Serve { jobs_db, listen } => serve(cli.config.as_ref(), jobs_db, listen).await,
        Commands::Validate => validate(cli.config.as_ref()),
    };

    std::process::exit(code);
}

async fn run_once(
    config_path: Option<&PathBuf>,
    data_dir: Option<PathBuf>,
    collection: Option<String>,
    force_recreate: bool,
    job_id: String,
) -> i32 {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration error: {e}");
            return 3;
        }
    };
    let config = apply_overrides(config, data_dir, collection, force_recreate);

    let engine = PipelineEngine::new(PerformanceMonitor::new(256), Arc::new(SystemClock));
    let report = engine.run(&job_id, &config).await;

    match report.status {
        RunStatus::Success => {
            log::info!(
                "run {} succeeded: loaded={} new={} modified={} deleted={} upserted={}",
                report.job_id,
                report.counts.loaded,
                report.counts.new,
                report.counts.modified,
                report.counts.deleted,
                report.counts.upserted,
            );
            0
        }
        RunStatus::Partial => {
            log::warn!("run {} completed partially: {:?}", report.job_id, report.error_list);
            1
        }
        RunStatus::Failure => {
            log::error!("run {} failed: {:?}", report.job_id, report.error_list);
            2
        }
    }
}

async fn serve(config_path: Option<&PathBuf>, jobs_db: PathBuf, listen: String) -> i32 {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration error: {e}");
            return 3;
        }
    };

    let clock = Arc::new(SystemClock);
    let engine = PipelineEngine::new(PerformanceMonitor::new(256), clock.clone());

    let scheduler = match Scheduler::open(&jobs_db, clock, engine) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to open scheduler job store: {e}");
            return 4;
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let dispatch_scheduler = scheduler.clone();
    let dispatch_handle = tokio::spawn(async move {
        dispatch_scheduler.run_dispatch_loop(shutdown_rx).await;
    });

    let state = Arc::new(AppState {
        scheduler: scheduler.clone(),
        engine: PipelineEngine::new(PerformanceMonitor::new(256), Arc::new(SystemClock)),
        default_config: config,
    });
    let router = control::build_router(state);

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind {listen}: {e}");
            let _ = shutdown_tx.send(());
            return 4;
        }
    };
    log::info!("control surface listening on {listen}");

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    let _ = shutdown_tx.send(());
    let _ = dispatch_handle.await;

    match serve_result {
        Ok(()) => 0,
        Err(e) => {
            log::error!("control surface exited with error: {e}");
            4
        }
    }
}

fn validate(config_path: Option<&PathBuf>) -> i32 {
    match load_config(config_path) {
        Ok(_) => {
            log::info!("configuration is valid");
            0
        }
        Err(e) => {
            log::error!("configuration error: {e}");
            3
        }
    }
}
