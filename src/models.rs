use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Codex,
    Claude,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly,
}

impl Cadence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DAILY" => Some(Self::Daily),
            "WEEKLY" => Some(Self::Weekly),
            "MONTHLY" => Some(Self::Monthly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GoalType {
    Absolute,
    Relative,
}

impl GoalType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absolute => "ABSOLUTE",
            Self::Relative => "RELATIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PollFrequency {
    Manual,
    FifteenMinutes,
    Hourly,
    Daily,
    Weekly,
}

impl PollFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::FifteenMinutes => "fifteen-minutes",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    /// `None` for manual metrics, which the poller never picks up.
    pub fn interval(self) -> Option<Duration> {
        match self {
            Self::Manual => None,
            Self::FifteenMinutes => Some(Duration::minutes(15)),
            Self::Hourly => Some(Duration::hours(1)),
            Self::Daily => Some(Duration::days(1)),
            Self::Weekly => Some(Duration::weeks(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataKind {
    TimeSeries,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Stored points are replaced wholesale by the new batch.
    Full,
    /// Points at or after the stored cursor are upserted; older ones are dropped.
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrationKind {
    Github,
    Posthog,
    GoogleSheets,
    Youtube,
}

impl IntegrationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Posthog => "posthog",
            Self::GoogleSheets => "google-sheets",
            Self::Youtube => "youtube",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricTemplate {
    pub id: String,
    pub name: String,
    pub integration: IntegrationKind,
    pub endpoint: serde_json::Value,
    pub poll_frequency: PollFrequency,
    pub data_kind: DataKind,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub description: String,
    pub integration_id: Option<String>,
    pub template: Option<MetricTemplate>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub refresh_status: Option<RefreshProgress>,
    pub last_error: Option<String>,
    pub sync_cursor: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Metric {
    pub fn poll_frequency(&self) -> PollFrequency {
        self.template
            .as_ref()
            .map(|template| template.poll_frequency)
            .unwrap_or(PollFrequency::Manual)
    }

    pub fn data_kind(&self) -> DataKind {
        self.template
            .as_ref()
            .map(|template| template.data_kind)
            .unwrap_or(DataKind::TimeSeries)
    }

    /// Metrics fed by an integration run the ingestion half of the pipeline.
    pub fn is_integration_backed(&self) -> bool {
        self.integration_id.is_some() && self.template.is_some()
    }

    pub fn sync_mode(&self, force_regenerate: bool) -> SyncMode {
        if force_regenerate || self.data_kind() == DataKind::Snapshot {
            SyncMode::Full
        } else {
            SyncMode::Incremental
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    pub id: i64,
    pub metric_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub dimensions: Option<BTreeMap<String, serde_json::Value>>,
    pub value_label: Option<String>,
}

/// A normalized point before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPointInput {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub dimensions: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub value_label: Option<String>,
}

impl DataPointInput {
    /// Canonical form of the dimension map; part of the stored uniqueness key.
    pub fn dimension_key(&self) -> String {
        match &self.dimensions {
            Some(map) if !map.is_empty() => serde_json::to_string(map).unwrap_or_default(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionTransformer {
    pub id: String,
    pub metric_id: String,
    pub code: String,
    pub input_fingerprint: String,
    /// Serialized payload shape the script was generated from.
    #[serde(default)]
    pub input_shape: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardChart {
    pub id: String,
    pub dashboard_id: String,
    pub metric_id: String,
    pub title: String,
    pub cadence: Cadence,
    pub selected_dimension: Option<String>,
    pub user_prompt: String,
    pub chart_config: Option<serde_json::Value>,
    pub config_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartTransformer {
    pub id: String,
    pub chart_id: String,
    pub code: String,
    pub input_fingerprint: String,
    pub cadence: Cadence,
    pub selected_dimension: Option<String>,
    pub user_prompt: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricGoal {
    pub id: String,
    pub metric_id: String,
    pub goal_type: GoalType,
    pub target_value: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    NoData,
    InvalidBaseline,
    AtRisk,
    Behind,
    OnTrack,
    Exceeded,
}

impl GoalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoData => "no_data",
            Self::InvalidBaseline => "invalid_baseline",
            Self::AtRisk => "at_risk",
            Self::Behind => "behind",
            Self::OnTrack => "on_track",
            Self::Exceeded => "exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalProgress {
    pub goal_id: String,
    pub metric_id: String,
    pub goal_type: GoalType,
    pub cadence: Cadence,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub target_value: f64,
    pub baseline_value: Option<f64>,
    pub current_value: Option<f64>,
    pub target_display_value: Option<f64>,
    /// Unclamped; above 100 or below 0 are meaningful.
    pub progress_percent: Option<f64>,
    pub display_percent: Option<f64>,
    pub time_elapsed_percent: f64,
    pub days_elapsed: i64,
    pub days_remaining: i64,
    pub hours_remaining: i64,
    pub trend: Option<Trend>,
    pub projected_end_value: Option<f64>,
    pub status: GoalStatus,
    pub last_data_point_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStep {
    FetchingApiData,
    DeletingOldData,
    DeletingOldTransformer,
    GeneratingIngestionTransformer,
    ExecutingIngestionTransformer,
    SavingTimeseriesData,
    GeneratingChartTransformer,
    ExecutingChartTransformer,
    SavingChartConfig,
}

impl PipelineStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FetchingApiData => "fetching-api-data",
            Self::DeletingOldData => "deleting-old-data",
            Self::DeletingOldTransformer => "deleting-old-transformer",
            Self::GeneratingIngestionTransformer => "generating-ingestion-transformer",
            Self::ExecutingIngestionTransformer => "executing-ingestion-transformer",
            Self::SavingTimeseriesData => "saving-timeseries-data",
            Self::GeneratingChartTransformer => "generating-chart-transformer",
            Self::ExecutingChartTransformer => "executing-chart-transformer",
            Self::SavingChartConfig => "saving-chart-config",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    /// Accepted, but the effect lands with the commit that ends the ingestion half.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: PipelineStep,
    pub chart_id: Option<String>,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub detail: Option<String>,
}

/// Stored in `metrics.refresh_status` while a run holds the lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshProgress {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub force_regenerate: bool,
    pub current_step: Option<PipelineStep>,
    pub current_chart_id: Option<String>,
    pub completed_steps: Vec<StepRecord>,
    pub total_steps: usize,
    pub percent: u8,
}

/// What pollers see through `get_progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshProgressView {
    pub metric_id: String,
    pub is_processing: bool,
    pub current_step: Option<PipelineStep>,
    pub completed_steps: Vec<StepRecord>,
    pub error: Option<String>,
    pub percent: u8,
    pub total_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub metric_id: String,
    #[serde(default)]
    pub force_regenerate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResult {
    pub success: bool,
    pub data_point_count: Option<usize>,
    pub error: Option<String>,
}

impl RefreshResult {
    pub fn succeeded(data_point_count: usize) -> Self {
        Self {
            success: true,
            data_point_count: Some(data_point_count),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data_point_count: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_busy: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMetricPayload {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub integration_id: Option<String>,
    pub template_id: Option<String>,
    pub template: Option<MetricTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChartPayload {
    pub metric_id: String,
    pub dashboard_id: String,
    pub title: Option<String>,
    pub cadence: Cadence,
    pub selected_dimension: Option<String>,
    pub user_prompt: Option<String>,
}

/// `None` keeps the current value; an empty `selected_dimension` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChartPayload {
    pub chart_id: String,
    pub title: Option<String>,
    pub cadence: Option<Cadence>,
    pub selected_dimension: Option<String>,
    pub user_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveGoalPayload {
    pub id: Option<String>,
    pub metric_id: String,
    pub goal_type: GoalType,
    pub target_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanResponse {
    pub success: bool,
}
