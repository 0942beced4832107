use crate::config::PipelineSettings;
use crate::db::{Database, IngestionCommit};
use crate::errors::{AppError, AppResult};
use crate::generator::CodeGenerator;
use crate::models::{
    DashboardChart, Metric, PipelineStep, RefreshProgress, RefreshRequest, RefreshResult, SyncMode,
};
use crate::progress::{plan_steps, ProgressRecorder};
use crate::redaction::Redactor;
use crate::sandbox::Sandbox;
use crate::source::{DataSource, FetchRequest};
use crate::transformers::{chart, ingestion, TransformerContext};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const REFRESH_IN_PROGRESS: &str = "Refresh already in progress";

struct RunOutcome {
    data_point_count: usize,
    fetched_at: Option<DateTime<Utc>>,
}

/// Single entry point for refreshing a metric: fetch, ingest, then rebuild every chart.
/// Used the same way by the poller and by manual refresh/regenerate.
pub struct RefreshPipeline {
    db: Arc<Database>,
    source: Arc<dyn DataSource>,
    transformers: TransformerContext,
    redactor: Redactor,
    stale_lock: chrono::Duration,
}

impl RefreshPipeline {
    pub fn new(
        db: Arc<Database>,
        source: Arc<dyn DataSource>,
        generator: Arc<dyn CodeGenerator>,
        settings: &PipelineSettings,
    ) -> Self {
        let redactor = Redactor::new(settings.redact_aggressive);
        Self {
            db,
            source,
            transformers: TransformerContext {
                generator,
                sandbox: Sandbox::new(settings.sandbox.clone()),
                redactor: redactor.clone(),
                max_sample_bytes: settings.generation.max_sample_bytes,
            },
            redactor,
            stale_lock: chrono::Duration::seconds(settings.stale_lock_seconds),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Never returns an error: every failure becomes `{ success: false, error }` and is
    /// mirrored onto `Metric.lastError`. A concurrent run for the same metric is refused
    /// without touching the metric.
    pub async fn refresh_metric_and_charts(&self, request: RefreshRequest) -> RefreshResult {
        let started = Instant::now();
        let force = request.force_regenerate;

        let (metric, charts) = match self.load(&request.metric_id) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return RefreshResult::failed(format!("Metric {} not found", request.metric_id)),
            Err(error) => return RefreshResult::failed(self.redactor.redact(&error.to_string())),
        };

        let plan = plan_steps(&metric, force, charts.len());
        let run_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let initial = RefreshProgress {
            run_id: run_id.clone(),
            started_at: now,
            force_regenerate: force,
            current_step: None,
            current_chart_id: None,
            completed_steps: Vec::new(),
            total_steps: plan.len(),
            percent: 0,
        };

        match self
            .db
            .try_acquire_refresh_lock(&metric.id, &initial, now - self.stale_lock)
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(metric_id = %metric.id, "refresh refused; another run holds the lock");
                return RefreshResult::failed(REFRESH_IN_PROGRESS);
            }
            Err(error) => return RefreshResult::failed(self.redactor.redact(&error.to_string())),
        }

        tracing::info!(
            metric_id = %metric.id,
            run_id = %run_id,
            force_regenerate = force,
            total_steps = plan.len(),
            "refresh started"
        );

        let mut recorder = ProgressRecorder::new(&self.db, &metric.id, initial);
        let outcome = self.run_steps(&metric, &charts, force, &run_id, &mut recorder).await;

        let (result, error, fetched_at) = match outcome {
            Ok(outcome) => (
                RefreshResult::succeeded(outcome.data_point_count),
                None,
                outcome.fetched_at,
            ),
            Err(error) => {
                let message = self.redactor.redact(&error.to_string());
                (RefreshResult::failed(message.clone()), Some(message), None)
            }
        };

        match self
            .db
            .release_refresh_lock(&metric.id, &run_id, recorder.steps(), error.as_deref(), fetched_at)
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(metric_id = %metric.id, run_id = %run_id, "refresh lock was already gone at release"),
            Err(release_error) => {
                tracing::error!(metric_id = %metric.id, error = %release_error, "failed to release refresh lock")
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match &error {
            None => tracing::info!(
                metric_id = %metric.id,
                duration_ms,
                data_points = result.data_point_count.unwrap_or(0),
                "refresh completed"
            ),
            Some(message) => tracing::warn!(metric_id = %metric.id, duration_ms, error = %message, "refresh failed"),
        }
        result
    }

    fn load(&self, metric_id: &str) -> AppResult<Option<(Metric, Vec<DashboardChart>)>> {
        let Some(metric) = self.db.get_metric(metric_id)? else {
            return Ok(None);
        };
        let charts = self.db.list_charts_for_metric(metric_id)?;
        Ok(Some((metric, charts)))
    }

    async fn run_steps(
        &self,
        metric: &Metric,
        charts: &[DashboardChart],
        force: bool,
        run_id: &str,
        recorder: &mut ProgressRecorder<'_>,
    ) -> AppResult<RunOutcome> {
        let mut fetched_at = None;
        if metric.is_integration_backed() {
            fetched_at = Some(self.ingest(metric, force, run_id, recorder).await?);
        }

        let points = self.db.list_data_points(&metric.id)?;
        for dashboard_chart in charts {
            let chart_id = Some(dashboard_chart.id.as_str());

            recorder.begin(PipelineStep::GeneratingChartTransformer, chart_id)?;
            let cached = if force {
                None
            } else {
                recorder.check(self.db.get_chart_transformer(&dashboard_chart.id))?
            };
            let resolved = recorder.check(
                chart::get_or_generate(&self.transformers, cached, metric, dashboard_chart, &points, force).await,
            )?;
            if resolved.generated {
                recorder.succeed(None)?;
            } else {
                recorder.skip("cached chart transformer reused")?;
            }

            recorder.begin(PipelineStep::ExecutingChartTransformer, chart_id)?;
            let config = recorder.check(
                chart::execute(&self.transformers, &resolved.transformer, dashboard_chart, &points).await,
            )?;
            recorder.succeed(None)?;

            recorder.begin(PipelineStep::SavingChartConfig, chart_id)?;
            recorder.check(self.db.commit_chart(&dashboard_chart.id, run_id, resolved.fresh(), &config))?;
            recorder.succeed(None)?;
        }

        Ok(RunOutcome {
            data_point_count: self.db.count_data_points(&metric.id)?,
            fetched_at,
        })
    }

    /// Steps 1 to 6. Deletions are deferred into the final commit so a failure at any
    /// point leaves stored points and the cached transformer as they were.
    async fn ingest(
        &self,
        metric: &Metric,
        force: bool,
        run_id: &str,
        recorder: &mut ProgressRecorder<'_>,
    ) -> AppResult<DateTime<Utc>> {
        let (Some(integration_id), Some(template)) = (&metric.integration_id, &metric.template) else {
            return Err(AppError::Internal(format!("metric {} has no integration", metric.id)));
        };
        let mode = metric.sync_mode(force);
        let cursor = match mode {
            SyncMode::Incremental => metric.sync_cursor,
            SyncMode::Full => None,
        };

        recorder.begin(PipelineStep::FetchingApiData, None)?;
        let request = FetchRequest {
            metric_id: metric.id.clone(),
            integration_id: integration_id.clone(),
            template: template.clone(),
            cursor,
            mode,
        };
        let raw = recorder.check(self.source.fetch(&request).await.map_err(AppError::from))?;
        let fetched_at = Utc::now();
        recorder.succeed(None)?;

        if mode == SyncMode::Full {
            recorder.begin(PipelineStep::DeletingOldData, None)?;
            recorder.defer("stored points are replaced when the new batch is saved")?;
        }
        if force {
            recorder.begin(PipelineStep::DeletingOldTransformer, None)?;
            recorder.defer("cached transformer is replaced when the new one is saved")?;
        }

        recorder.begin(PipelineStep::GeneratingIngestionTransformer, None)?;
        let cached = recorder.check(self.db.get_ingestion_transformer(&metric.id))?;
        let had_cached = cached.is_some();
        let resolved = recorder.check(
            ingestion::get_or_generate(&self.transformers, cached, metric, &raw, cursor, force).await,
        )?;
        if resolved.generated {
            recorder.succeed(None)?;
        } else {
            recorder.skip("cached ingestion transformer reused")?;
        }

        recorder.begin(PipelineStep::ExecutingIngestionTransformer, None)?;
        let points = recorder.check(ingestion::execute(&self.transformers, &resolved.transformer, &raw, cursor).await)?;
        recorder.succeed(Some(format!("{} points", points.len())))?;

        // A script written against a payload with no records has never been exercised.
        let transformer = match resolved.fresh() {
            Some(_) if points.is_empty() && had_cached => {
                tracing::info!(metric_id = %metric.id, "empty batch; keeping the cached ingestion transformer");
                None
            }
            fresh => fresh,
        };

        recorder.begin(PipelineStep::SavingTimeseriesData, None)?;
        let written = recorder.check(self.db.commit_ingestion(&IngestionCommit {
            metric_id: &metric.id,
            run_id,
            transformer,
            mode,
            points: &points,
        }))?;
        recorder.succeed(Some(format!("{} points written", written)))?;

        Ok(fetched_at)
    }
}
