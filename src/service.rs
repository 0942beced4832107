use crate::config::PipelineSettings;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::goals::calculate_goal_progress;
use crate::models::{
    BooleanResponse, Cadence, CreateChartPayload, CreateMetricPayload, DashboardChart, DataPoint, DataPointInput,
    GoalProgress, Metric, MetricGoal, RefreshProgressView, RefreshRequest, RefreshResult, SaveGoalPayload,
    UpdateChartPayload,
};
use crate::pipeline::RefreshPipeline;
use crate::policy::PolicyEngine;
use crate::progress::progress_view;
use crate::templates::find_template;
use chrono::Utc;
use std::sync::Arc;

/// Organization-scoped operations. A metric owned by another organization is
/// reported as missing, never as forbidden.
pub struct MetricService {
    db: Arc<Database>,
    pipeline: Arc<RefreshPipeline>,
    policy: PolicyEngine,
    default_goal_cadence: Cadence,
}

impl MetricService {
    pub fn new(pipeline: Arc<RefreshPipeline>, settings: &PipelineSettings) -> Self {
        Self {
            db: pipeline.database().clone(),
            pipeline,
            policy: PolicyEngine::new(),
            default_goal_cadence: settings.default_goal_cadence,
        }
    }

    // ─── Metrics ──────────────────────────────────────────────────────────────

    pub fn create_metric(&self, organization_id: &str, payload: CreateMetricPayload) -> AppResult<Metric> {
        self.policy.validate_metric(&payload)?;
        let template = match (&payload.template_id, payload.template) {
            (Some(template_id), _) => Some(
                find_template(template_id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("Template {} not found", template_id)))?,
            ),
            (None, inline) => inline,
        };
        let metric = self.db.insert_metric(
            organization_id,
            payload.name.trim(),
            payload.description.as_deref().unwrap_or_default().trim(),
            payload.integration_id.as_deref(),
            template.as_ref(),
        )?;
        tracing::info!(
            metric_id = %metric.id,
            template = metric.template.as_ref().map(|template| template.id.as_str()).unwrap_or("manual"),
            "metric created"
        );
        Ok(metric)
    }

    pub fn get_metric(&self, organization_id: &str, metric_id: &str) -> AppResult<Metric> {
        self.db
            .get_metric(metric_id)?
            .filter(|metric| metric.organization_id == organization_id)
            .ok_or_else(|| AppError::NotFound(format!("Metric {} not found", metric_id)))
    }

    pub fn list_metrics(&self, organization_id: &str) -> AppResult<Vec<Metric>> {
        self.db.list_metrics(organization_id)
    }

    /// Cascades to points, transformers, charts and goals. An in-flight refresh
    /// notices at its next write and stops.
    pub fn delete_metric(&self, organization_id: &str, metric_id: &str) -> AppResult<BooleanResponse> {
        self.get_metric(organization_id, metric_id)?;
        let success = self.db.delete_metric(metric_id)?;
        tracing::info!(metric_id = %metric_id, "metric deleted");
        Ok(BooleanResponse { success })
    }

    // ─── Charts ───────────────────────────────────────────────────────────────

    pub fn create_chart(&self, organization_id: &str, payload: CreateChartPayload) -> AppResult<DashboardChart> {
        self.policy.validate_chart(&payload)?;
        let metric = self.get_metric(organization_id, &payload.metric_id)?;
        let title = payload
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(&metric.name);
        let selected_dimension = payload
            .selected_dimension
            .as_deref()
            .map(str::trim)
            .filter(|dimension| !dimension.is_empty());
        self.db.insert_chart(
            &metric.id,
            payload.dashboard_id.trim(),
            title,
            payload.cadence,
            selected_dimension,
            payload.user_prompt.as_deref().unwrap_or_default().trim(),
        )
    }

    pub fn update_chart(&self, organization_id: &str, payload: UpdateChartPayload) -> AppResult<DashboardChart> {
        self.policy.validate_chart_update(&payload)?;
        self.chart_in_org(organization_id, &payload.chart_id)?;
        self.db
            .update_chart(&payload)?
            .ok_or_else(|| AppError::NotFound(format!("Chart {} not found", payload.chart_id)))
    }

    pub fn list_charts(&self, organization_id: &str, metric_id: &str) -> AppResult<Vec<DashboardChart>> {
        self.get_metric(organization_id, metric_id)?;
        self.db.list_charts_for_metric(metric_id)
    }

    pub fn delete_chart(&self, organization_id: &str, chart_id: &str) -> AppResult<BooleanResponse> {
        self.chart_in_org(organization_id, chart_id)?;
        Ok(BooleanResponse {
            success: self.db.delete_chart(chart_id)?,
        })
    }

    fn chart_in_org(&self, organization_id: &str, chart_id: &str) -> AppResult<DashboardChart> {
        let chart = self
            .db
            .get_chart(chart_id)?
            .ok_or_else(|| AppError::NotFound(format!("Chart {} not found", chart_id)))?;
        self.get_metric(organization_id, &chart.metric_id)
            .map_err(|_| AppError::NotFound(format!("Chart {} not found", chart_id)))?;
        Ok(chart)
    }

    // ─── Goals ────────────────────────────────────────────────────────────────

    pub fn save_goal(&self, organization_id: &str, payload: SaveGoalPayload) -> AppResult<MetricGoal> {
        self.policy.validate_goal(&payload)?;
        self.get_metric(organization_id, &payload.metric_id)?;
        if let Some(goal_id) = &payload.id {
            if let Some(existing) = self.db.get_goal(goal_id)? {
                if existing.metric_id != payload.metric_id {
                    return Err(AppError::Policy("A goal cannot move to another metric".to_string()));
                }
            }
        }
        self.db.save_goal(&payload)
    }

    pub fn delete_goal(&self, organization_id: &str, goal_id: &str) -> AppResult<BooleanResponse> {
        self.goal_in_org(organization_id, goal_id)?;
        Ok(BooleanResponse {
            success: self.db.delete_goal(goal_id)?,
        })
    }

    pub fn list_goals(&self, organization_id: &str, metric_id: &str) -> AppResult<Vec<MetricGoal>> {
        self.get_metric(organization_id, metric_id)?;
        self.db.list_goals(metric_id)
    }

    fn goal_in_org(&self, organization_id: &str, goal_id: &str) -> AppResult<MetricGoal> {
        let goal = self
            .db
            .get_goal(goal_id)?
            .ok_or_else(|| AppError::NotFound(format!("Goal {} not found", goal_id)))?;
        self.get_metric(organization_id, &goal.metric_id)
            .map_err(|_| AppError::NotFound(format!("Goal {} not found", goal_id)))?;
        Ok(goal)
    }

    // ─── Data points ──────────────────────────────────────────────────────────

    pub fn record_data_point(
        &self,
        organization_id: &str,
        metric_id: &str,
        point: DataPointInput,
    ) -> AppResult<DataPoint> {
        self.policy.validate_data_point(&point)?;
        let metric = self.get_metric(organization_id, metric_id)?;
        if metric.is_integration_backed() {
            return Err(AppError::Policy(
                "Integration-backed metrics are filled by refreshes, not by manual samples".to_string(),
            ));
        }
        self.db.insert_data_point(metric_id, &point)
    }

    pub fn list_data_points(&self, organization_id: &str, metric_id: &str) -> AppResult<Vec<DataPoint>> {
        self.get_metric(organization_id, metric_id)?;
        self.db.list_data_points(metric_id)
    }

    // ─── Refresh ──────────────────────────────────────────────────────────────

    pub async fn refresh_metric(&self, organization_id: &str, metric_id: &str) -> AppResult<RefreshResult> {
        self.run_refresh(organization_id, metric_id, false).await
    }

    /// Discards both cached transformers and rebuilds everything from a full fetch.
    pub async fn regenerate_metric(&self, organization_id: &str, metric_id: &str) -> AppResult<RefreshResult> {
        self.run_refresh(organization_id, metric_id, true).await
    }

    async fn run_refresh(&self, organization_id: &str, metric_id: &str, force_regenerate: bool) -> AppResult<RefreshResult> {
        self.get_metric(organization_id, metric_id)?;
        Ok(self
            .pipeline
            .refresh_metric_and_charts(RefreshRequest {
                metric_id: metric_id.to_string(),
                force_regenerate,
            })
            .await)
    }

    pub fn get_progress(&self, organization_id: &str, metric_id: &str) -> AppResult<RefreshProgressView> {
        let metric = self.get_metric(organization_id, metric_id)?;
        let last_run_steps = if metric.refresh_status.is_some() {
            Vec::new()
        } else {
            self.db.get_last_run_steps(metric_id)?
        };
        Ok(progress_view(&metric, last_run_steps))
    }

    // ─── Goal progress ────────────────────────────────────────────────────────

    pub fn get_goal_progress(&self, organization_id: &str, goal_id: &str) -> AppResult<GoalProgress> {
        let goal = self.goal_in_org(organization_id, goal_id)?;
        let cadence = self.goal_cadence(&goal.metric_id)?;
        let points = self.db.list_data_points(&goal.metric_id)?;
        Ok(calculate_goal_progress(&goal, cadence, &points, Utc::now()))
    }

    pub fn list_goal_progress(&self, organization_id: &str, metric_id: &str) -> AppResult<Vec<GoalProgress>> {
        self.get_metric(organization_id, metric_id)?;
        let cadence = self.goal_cadence(metric_id)?;
        let points = self.db.list_data_points(metric_id)?;
        let now = Utc::now();
        Ok(self
            .db
            .list_goals(metric_id)?
            .iter()
            .map(|goal| calculate_goal_progress(goal, cadence, &points, now))
            .collect())
    }

    fn goal_cadence(&self, metric_id: &str) -> AppResult<Cadence> {
        Ok(self
            .db
            .primary_chart_cadence(metric_id)?
            .unwrap_or(self.default_goal_cadence))
    }
}
