use crate::config::PipelineSettings;
use crate::errors::{AppError, AppResult};
use crate::models::{CreateChartPayload, CreateMetricPayload, DataPointInput, SaveGoalPayload, UpdateChartPayload};

const MIN_POLL_INTERVAL_SECONDS: u64 = 60;
const MAX_POLL_INTERVAL_SECONDS: u64 = 86_400;
const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 500;
const MAX_CONCURRENT_REFRESHES: usize = 32;
const MIN_STALE_LOCK_SECONDS: i64 = 60;
const MIN_GENERATION_TIMEOUT_SECONDS: u64 = 5;
const MAX_GENERATION_TIMEOUT_SECONDS: u64 = 900;
const MIN_SANDBOX_TIMEOUT_MS: u64 = 10;
const MAX_SANDBOX_TIMEOUT_MS: u64 = 60_000;
const MAX_SAMPLE_BYTES: usize = 256 * 1024;
const MAX_NAME_CHARS: usize = 200;
const MAX_USER_PROMPT_CHARS: usize = 4_000;
const MAX_GOAL_MAGNITUDE: f64 = 1e15;

#[derive(Debug, Clone, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Clamps runtime bounds into their supported ranges. Never fails.
    pub fn normalize_settings(&self, mut settings: PipelineSettings) -> PipelineSettings {
        settings.poll_interval_seconds = settings
            .poll_interval_seconds
            .clamp(MIN_POLL_INTERVAL_SECONDS, MAX_POLL_INTERVAL_SECONDS);
        settings.poll_batch_size = settings.poll_batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        settings.max_concurrent_refreshes = settings.max_concurrent_refreshes.clamp(1, MAX_CONCURRENT_REFRESHES);
        settings.stale_lock_seconds = settings.stale_lock_seconds.max(MIN_STALE_LOCK_SECONDS);
        settings.generation.timeout_seconds = settings
            .generation
            .timeout_seconds
            .clamp(MIN_GENERATION_TIMEOUT_SECONDS, MAX_GENERATION_TIMEOUT_SECONDS);
        settings.generation.max_sample_bytes = settings.generation.max_sample_bytes.clamp(512, MAX_SAMPLE_BYTES);
        settings.sandbox.timeout_ms = settings
            .sandbox
            .timeout_ms
            .clamp(MIN_SANDBOX_TIMEOUT_MS, MAX_SANDBOX_TIMEOUT_MS);
        settings.sandbox.max_operations = settings.sandbox.max_operations.max(1_000);
        settings.sandbox.max_call_levels = settings.sandbox.max_call_levels.clamp(4, 256);
        settings.sandbox.max_output_points = settings.sandbox.max_output_points.max(1);
        settings
    }

    pub fn validate_metric(&self, payload: &CreateMetricPayload) -> AppResult<()> {
        validate_name("Metric name", &payload.name)?;
        if payload.template_id.is_some() && payload.template.is_some() {
            return Err(AppError::Policy(
                "Provide either a template id or an inline template, not both".to_string(),
            ));
        }
        let has_template = payload.template_id.is_some() || payload.template.is_some();
        match (&payload.integration_id, has_template) {
            (Some(integration_id), true) if integration_id.trim().is_empty() => Err(AppError::Policy(
                "Integration id cannot be empty".to_string(),
            )),
            (Some(_), false) => Err(AppError::Policy(
                "Integration-backed metrics require a template".to_string(),
            )),
            (None, true) => Err(AppError::Policy(
                "A template requires an integration connection".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn validate_chart(&self, payload: &CreateChartPayload) -> AppResult<()> {
        if payload.dashboard_id.trim().is_empty() {
            return Err(AppError::Policy("Dashboard id cannot be empty".to_string()));
        }
        if let Some(title) = &payload.title {
            validate_name("Chart title", title)?;
        }
        validate_user_prompt(payload.user_prompt.as_deref())
    }

    pub fn validate_chart_update(&self, payload: &UpdateChartPayload) -> AppResult<()> {
        if let Some(title) = &payload.title {
            validate_name("Chart title", title)?;
        }
        validate_user_prompt(payload.user_prompt.as_deref())
    }

    pub fn validate_goal(&self, payload: &SaveGoalPayload) -> AppResult<()> {
        if !payload.target_value.is_finite() || payload.target_value.abs() > MAX_GOAL_MAGNITUDE {
            return Err(AppError::Policy(format!(
                "Goal target must be a finite number within ±{:e}",
                MAX_GOAL_MAGNITUDE
            )));
        }
        Ok(())
    }

    pub fn validate_data_point(&self, point: &DataPointInput) -> AppResult<()> {
        if !point.value.is_finite() {
            return Err(AppError::Policy("Data point value must be finite".to_string()));
        }
        Ok(())
    }
}

fn validate_name(label: &str, value: &str) -> AppResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Policy(format!("{} cannot be empty", label)));
    }
    if trimmed.chars().count() > MAX_NAME_CHARS {
        return Err(AppError::Policy(format!(
            "{} must be at most {} characters",
            label, MAX_NAME_CHARS
        )));
    }
    Ok(())
}

fn validate_user_prompt(prompt: Option<&str>) -> AppResult<()> {
    match prompt {
        Some(prompt) if prompt.chars().count() > MAX_USER_PROMPT_CHARS => Err(AppError::Policy(format!(
            "Chart prompt must be at most {} characters",
            MAX_USER_PROMPT_CHARS
        ))),
        _ => Ok(()),
    }
}
