pub mod adapters;
pub mod config;
pub mod db;
pub mod errors;
pub mod generator;
pub mod goals;
pub mod harness;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod progress;
pub mod redaction;
pub mod sandbox;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod templates;
pub mod transformers;

use crate::config::{resolve_data_dir, PipelineSettings};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::generator::{CliCodeGenerator, CodeGenerator};
use crate::pipeline::RefreshPipeline;
use crate::policy::PolicyEngine;
use crate::scheduler::MetricPoller;
use crate::source::{CommandDataSource, DataSource, UnconfiguredDataSource};
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

const DATABASE_FILE_NAME: &str = "metric-refresh.db";

/// Everything the binary wires together at startup.
pub struct App {
    pub settings: PipelineSettings,
    pub pipeline: Arc<RefreshPipeline>,
    pub poller: MetricPoller,
}

impl App {
    pub fn open(data_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|error| AppError::Io(error.to_string()))?;
        let settings = PolicyEngine::new().normalize_settings(PipelineSettings::load(data_dir)?);

        let db = Arc::new(Database::new(&data_dir.join(DATABASE_FILE_NAME))?);
        let cleared = db.clear_orphan_refresh_locks()?;
        if cleared > 0 {
            tracing::warn!(cleared, "cleared refresh locks left by a previous process");
        }

        let source: Arc<dyn DataSource> = match settings.fetcher.clone() {
            Some(fetcher) => Arc::new(CommandDataSource::new(fetcher)),
            None => {
                tracing::warn!("no fetcher configured; integration-backed refreshes will fail");
                Arc::new(UnconfiguredDataSource)
            }
        };
        let generator: Arc<dyn CodeGenerator> = Arc::new(CliCodeGenerator::new(
            settings.generation.clone(),
            data_dir.join("generation"),
        ));

        let pipeline = Arc::new(RefreshPipeline::new(db, source, generator, &settings));
        let poller = MetricPoller::new(pipeline.clone(), &settings);
        Ok(Self {
            settings,
            pipeline,
            poller,
        })
    }
}

pub async fn run() -> AppResult<()> {
    let data_dir = resolve_data_dir();
    std::fs::create_dir_all(&data_dir).map_err(|error| AppError::Io(error.to_string()))?;
    init_tracing(&data_dir).map_err(AppError::Internal)?;

    let app = App::open(&data_dir)?;
    tracing::info!(
        data_dir = %data_dir.display(),
        poll_interval_seconds = app.settings.poll_interval_seconds,
        max_concurrent_refreshes = app.settings.max_concurrent_refreshes,
        "metric refresh service started"
    );
    app.poller.start();

    tokio::signal::ctrl_c()
        .await
        .map_err(|error| AppError::Io(error.to_string()))?;
    tracing::info!("shutdown requested");
    Ok(())
}

fn init_tracing(data_dir: &Path) -> Result<(), String> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "metric-refresh.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
