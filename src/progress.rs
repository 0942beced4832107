use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    DataKind, Metric, PipelineStep, RefreshProgress, RefreshProgressView, StepRecord, StepStatus,
};
use std::time::Instant;

const CHART_STEPS: [PipelineStep; 3] = [
    PipelineStep::GeneratingChartTransformer,
    PipelineStep::ExecutingChartTransformer,
    PipelineStep::SavingChartConfig,
];

/// The steps this run will record, in order. Manual metrics have no ingestion half;
/// the delete steps appear only when they apply.
pub fn plan_steps(metric: &Metric, force_regenerate: bool, chart_count: usize) -> Vec<PipelineStep> {
    let mut plan = Vec::with_capacity(6 + chart_count * CHART_STEPS.len());
    if metric.is_integration_backed() {
        plan.push(PipelineStep::FetchingApiData);
        if force_regenerate || metric.data_kind() == DataKind::Snapshot {
            plan.push(PipelineStep::DeletingOldData);
        }
        if force_regenerate {
            plan.push(PipelineStep::DeletingOldTransformer);
        }
        plan.push(PipelineStep::GeneratingIngestionTransformer);
        plan.push(PipelineStep::ExecutingIngestionTransformer);
        plan.push(PipelineStep::SavingTimeseriesData);
    }
    for _ in 0..chart_count {
        plan.extend(CHART_STEPS);
    }
    plan
}

pub fn percent_complete(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((completed.min(total) * 100) / total) as u8
}

/// Records step outcomes and mirrors them into the metric's `refresh_status`.
/// A write that no longer matches the run token means the lock was lost.
pub struct ProgressRecorder<'a> {
    db: &'a Database,
    metric_id: String,
    progress: RefreshProgress,
    step_started: Option<Instant>,
}

impl<'a> ProgressRecorder<'a> {
    pub fn new(db: &'a Database, metric_id: &str, progress: RefreshProgress) -> Self {
        Self {
            db,
            metric_id: metric_id.to_string(),
            progress,
            step_started: None,
        }
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.progress.completed_steps
    }

    pub fn begin(&mut self, step: PipelineStep, chart_id: Option<&str>) -> AppResult<()> {
        self.progress.current_step = Some(step);
        self.progress.current_chart_id = chart_id.map(ToString::to_string);
        self.step_started = Some(Instant::now());
        self.persist()
    }

    pub fn succeed(&mut self, detail: Option<String>) -> AppResult<()> {
        self.finish(StepStatus::Succeeded, detail)
    }

    /// The step ran but had nothing to do, e.g. a cached transformer was reused.
    pub fn skip(&mut self, detail: &str) -> AppResult<()> {
        self.finish(StepStatus::Skipped, Some(detail.to_string()))
    }

    /// The step's work is folded into the final commit, so nothing has been removed yet.
    pub fn defer(&mut self, detail: &str) -> AppResult<()> {
        self.finish(StepStatus::Deferred, Some(detail.to_string()))
    }

    /// Records the failure of the current step and hands the error back.
    pub fn check<T>(&mut self, result: AppResult<T>) -> AppResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                if let Err(persist_error) = self.finish(StepStatus::Failed, Some(error.to_string())) {
                    tracing::warn!(
                        metric_id = %self.metric_id,
                        error = %persist_error,
                        "failed to record step failure"
                    );
                }
                Err(error)
            }
        }
    }

    fn finish(&mut self, status: StepStatus, detail: Option<String>) -> AppResult<()> {
        let Some(step) = self.progress.current_step.take() else {
            return Err(AppError::Internal("no step in progress".to_string()));
        };
        let duration_ms = self
            .step_started
            .take()
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let chart_id = self.progress.current_chart_id.take();

        match status {
            StepStatus::Failed => tracing::warn!(
                metric_id = %self.metric_id,
                step = step.as_str(),
                chart_id = chart_id.as_deref().unwrap_or(""),
                duration_ms,
                error = detail.as_deref().unwrap_or(""),
                "refresh step failed"
            ),
            _ => tracing::debug!(
                metric_id = %self.metric_id,
                step = step.as_str(),
                chart_id = chart_id.as_deref().unwrap_or(""),
                duration_ms,
                status = ?status,
                "refresh step finished"
            ),
        }

        self.progress.completed_steps.push(StepRecord {
            step,
            chart_id,
            status,
            duration_ms,
            detail,
        });
        self.progress.percent = percent_complete(self.progress.completed_steps.len(), self.progress.total_steps);
        self.persist()
    }

    fn persist(&self) -> AppResult<()> {
        if self.db.update_refresh_progress(&self.metric_id, &self.progress)? {
            Ok(())
        } else {
            Err(AppError::Busy(format!(
                "refresh of metric {} lost its lock (metric deleted or run superseded)",
                self.metric_id
            )))
        }
    }
}

/// Read-only view for pollers. Idle metrics report the last run's steps and error.
pub fn progress_view(metric: &Metric, last_run_steps: Vec<StepRecord>) -> RefreshProgressView {
    match &metric.refresh_status {
        Some(progress) => RefreshProgressView {
            metric_id: metric.id.clone(),
            is_processing: true,
            current_step: progress.current_step,
            completed_steps: progress.completed_steps.clone(),
            error: None,
            percent: progress.percent,
            total_steps: progress.total_steps,
        },
        None => {
            let total_steps = last_run_steps.len();
            RefreshProgressView {
                metric_id: metric.id.clone(),
                is_processing: false,
                current_step: None,
                completed_steps: last_run_steps,
                error: metric.last_error.clone(),
                percent: if total_steps == 0 { 0 } else { 100 },
                total_steps,
            }
        }
    }
}
