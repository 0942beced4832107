use crate::adapters::{adapter_for, GenerationCall};
use crate::config::GenerationSettings;
use crate::errors::{AppError, AppResult};
use crate::harness::cli_missing::describe_missing_generator;
use crate::harness::structured_output::resolve_structured_output;
use crate::models::{Cadence, DataPoint, Metric};
use crate::redaction::Redactor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

const SAMPLE_ARRAY_ITEMS: usize = 20;
const SAMPLE_POINTS: usize = 30;

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[ \t]*(?:rhai|rust|js|javascript)?[ \t]*\r?\n(.*?)```").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformerKind {
    Ingestion,
    Chart,
}

impl TransformerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Chart => "chart",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationPrompt {
    pub kind: TransformerKind,
    pub text: String,
}

/// Turns a prompt into the source of a transformer script.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, prompt: &GenerationPrompt) -> AppResult<String>;
}

pub struct CliCodeGenerator {
    settings: GenerationSettings,
    workdir: PathBuf,
}

impl CliCodeGenerator {
    pub fn new(settings: GenerationSettings, workdir: PathBuf) -> Self {
        Self { settings, workdir }
    }
}

#[async_trait]
impl CodeGenerator for CliCodeGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> AppResult<String> {
        let provider = self.settings.provider;
        let adapter = adapter_for(provider);
        let call = GenerationCall {
            prompt: prompt.text.clone(),
            model: self.settings.model.clone(),
            cwd: self.workdir.to_string_lossy().to_string(),
        };
        let validated = adapter.build_command(&call, &self.settings.binary_path)?;
        std::fs::create_dir_all(&self.workdir)?;

        let mut command = Command::new(&validated.program);
        command
            .args(&validated.args)
            .current_dir(&validated.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &validated.env {
            command.env(key, value);
        }

        let started = Instant::now();
        let child = command.spawn().map_err(|error| {
            let message = error.to_string();
            AppError::Generation(
                describe_missing_generator(&message, provider, &self.settings.binary_path).unwrap_or_else(|| {
                    format!("failed to launch {} CLI: {}", provider.as_str(), message)
                }),
            )
        })?;

        let output = match timeout(Duration::from_secs(self.settings.timeout_seconds), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => return Err(AppError::Generation(format!("generator wait failed: {}", error))),
            Err(_) => {
                return Err(AppError::Generation(format!(
                    "generation timed out after {}s",
                    self.settings.timeout_seconds
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            let reason = describe_missing_generator(&stderr, provider, &self.settings.binary_path)
                .unwrap_or_else(|| {
                    let last = stderr.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or("no stderr");
                    format!("{} CLI exited with {:?}: {}", provider.as_str(), output.status.code(), last.trim())
                });
            return Err(AppError::Generation(reason));
        }

        let parsed = adapter.parse_final(output.status.code(), &stdout);
        let summary = parsed
            .get("summary")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        let script = extract_script(summary)
            .ok_or_else(|| AppError::Generation("generator returned no script".to_string()))?;

        tracing::info!(
            kind = prompt.kind.as_str(),
            provider = provider.as_str(),
            duration_ms = started.elapsed().as_millis() as u64,
            bytes = script.len(),
            "generated transformer script"
        );
        Ok(script)
    }
}

/// Pulls the script out of a model answer: a JSON `{"code": ...}` envelope, the first
/// fenced block, or the whole text.
pub fn extract_script(answer: &str) -> Option<String> {
    let trimmed = answer.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with('{') {
        if let Some(code) = resolve_structured_output(Some(trimmed), None)
            .as_ref()
            .and_then(|value| value.get("code"))
            .and_then(|value| value.as_str())
        {
            let code = code.trim();
            return (!code.is_empty()).then(|| code.to_string());
        }
    }

    if let Some(captures) = FENCED_BLOCK.captures(trimmed) {
        let code = captures.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        return (!code.is_empty()).then(|| code.to_string());
    }

    Some(trimmed.to_string())
}

const INGESTION_CONTRACT: &str = r#"Write a Rhai script that converts the raw API payload into data points.
Scope variables:
  raw    - the payload below, as Rhai maps/arrays
  cursor - RFC 3339 string of the newest stored point, or () when none
The script's final expression must be an array of maps:
  #{ timestamp: <RFC 3339 string | "YYYY-MM-DD" | epoch seconds or milliseconds>,
     value: <number>,
     dimensions: <optional map of string -> string/number>,
     valueLabel: <optional string> }
Rules: no imports, no eval, no printing. Only use the scope variables.
Answer with the script alone inside one ```rhai fenced block."#;

const CHART_CONTRACT: &str = r#"Write a Rhai script that builds a chart configuration from stored data points.
Scope variables:
  points             - array of #{ timestamp: RFC 3339 string, value: number, dimensions: map or (), valueLabel: string or () }
  cadence            - "DAILY", "WEEKLY" or "MONTHLY"; bucket points by this period (UTC, weeks start Monday)
  selected_dimension - dimension key to split series by, or ()
The script's final expression must be a map:
  #{ chartType: "line" | "bar" | "area" | "pie" | "scatter",
     xAxisKey: <string>, dataKeys: [<string>, ...], data: [#{...}, ...],
     title: <optional string>, cadence: <optional cadence>, selectedDimension: <optional string> }
Rules: no imports, no eval, no printing. Only use the scope variables.
Answer with the script alone inside one ```rhai fenced block."#;

pub fn ingestion_prompt(
    metric: &Metric,
    raw: &serde_json::Value,
    cursor: Option<DateTime<Utc>>,
    redactor: &Redactor,
    max_sample_bytes: usize,
) -> GenerationPrompt {
    let mut text = String::from(INGESTION_CONTRACT);
    text.push_str(&format!("\n\nMetric: {}\n", metric.name));
    if !metric.description.trim().is_empty() {
        text.push_str(&format!("Description: {}\n", metric.description.trim()));
    }
    if let Some(template) = &metric.template {
        text.push_str(&format!(
            "Source: {} ({}), {} data\nEndpoint: {}\n",
            template.name,
            template.integration.as_str(),
            match template.data_kind {
                crate::models::DataKind::TimeSeries => "time-series",
                crate::models::DataKind::Snapshot => "snapshot",
            },
            template.endpoint
        ));
        if !template.description.trim().is_empty() {
            text.push_str(&format!("Template notes: {}\n", template.description.trim()));
        }
    }
    if let Some(cursor) = cursor {
        text.push_str(&format!("Current cursor: {}\n", cursor.to_rfc3339()));
    }
    text.push_str("\nRaw payload sample:\n");
    text.push_str(&sample_json(&redactor.redact_json(raw), max_sample_bytes));

    GenerationPrompt {
        kind: TransformerKind::Ingestion,
        text,
    }
}

pub fn chart_prompt(
    metric: &Metric,
    title: &str,
    points: &[DataPoint],
    cadence: Cadence,
    selected_dimension: Option<&str>,
    user_prompt: &str,
    max_sample_bytes: usize,
) -> GenerationPrompt {
    let mut text = String::from(CHART_CONTRACT);
    text.push_str(&format!("\n\nMetric: {}\nChart title: {}\n", metric.name, title));
    text.push_str(&format!("Cadence: {}\n", cadence.as_str()));
    match selected_dimension {
        Some(dimension) => text.push_str(&format!("Selected dimension: {}\n", dimension)),
        None => text.push_str("Selected dimension: none\n"),
    }
    let dimension_keys = crate::transformers::fingerprint::dimension_keys(points);
    if !dimension_keys.is_empty() {
        text.push_str(&format!("Available dimensions: {}\n", dimension_keys.join(", ")));
    }
    if !user_prompt.trim().is_empty() {
        text.push_str(&format!("User request: {}\n", user_prompt.trim()));
    }
    text.push_str(&format!("\nStored points ({} total), first {}:\n", points.len(), SAMPLE_POINTS.min(points.len())));
    let sample: Vec<serde_json::Value> = points
        .iter()
        .take(SAMPLE_POINTS)
        .map(crate::transformers::chart::point_to_json)
        .collect();
    text.push_str(&sample_json(&serde_json::Value::Array(sample), max_sample_bytes));

    GenerationPrompt {
        kind: TransformerKind::Chart,
        text,
    }
}

/// Pretty JSON with long arrays cut down, capped at `max_bytes`.
pub fn sample_json(value: &serde_json::Value, max_bytes: usize) -> String {
    let pruned = prune_arrays(value);
    let rendered = serde_json::to_string_pretty(&pruned).unwrap_or_else(|_| pruned.to_string());
    if rendered.len() <= max_bytes {
        return rendered;
    }
    let mut cut = max_bytes;
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... (truncated)", &rendered[..cut])
}

fn prune_arrays(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().take(SAMPLE_ARRAY_ITEMS).map(prune_arrays).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, inner)| (key.clone(), prune_arrays(inner)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::{extract_script, ingestion_prompt, sample_json, TransformerKind};
    use crate::models::Metric;
    use crate::redaction::Redactor;
    use chrono::Utc;

    fn metric() -> Metric {
        Metric {
            id: "m".to_string(),
            organization_id: "org".to_string(),
            name: "Signups".to_string(),
            description: "Daily signups".to_string(),
            integration_id: None,
            template: None,
            next_poll_at: None,
            last_fetched_at: None,
            refresh_status: None,
            last_error: None,
            sync_cursor: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn extracts_fenced_rhai_block() {
        let answer = "Here you go:\n```rhai\nlet out = [];\nout\n```\nDone.";
        assert_eq!(extract_script(answer).as_deref(), Some("let out = [];\nout"));
    }

    #[test]
    fn extracts_code_from_json_envelope() {
        let answer = r#"{"code": "[#{timestamp: \"2026-01-01\", value: 1}]"}"#;
        assert_eq!(
            extract_script(answer).as_deref(),
            Some(r#"[#{timestamp: "2026-01-01", value: 1}]"#)
        );
    }

    #[test]
    fn falls_back_to_whole_answer() {
        assert_eq!(extract_script("  [] \n").as_deref(), Some("[]"));
        assert_eq!(extract_script("   "), None);
    }

    #[test]
    fn prompt_sample_is_redacted_and_pruned() {
        let raw = serde_json::json!({
            "access_token": "should-not-leak",
            "items": (0..100).collect::<Vec<_>>()
        });
        let prompt = ingestion_prompt(&metric(), &raw, None, &Redactor::new(true), 16 * 1024);
        assert_eq!(prompt.kind, TransformerKind::Ingestion);
        assert!(!prompt.text.contains("should-not-leak"));
        assert!(prompt.text.contains("Signups"));
        assert!(prompt.text.contains("19"));
        assert!(!prompt.text.contains("\n    99\n"));
    }

    #[test]
    fn sample_is_capped_on_char_boundary() {
        let value = serde_json::json!({ "text": "é".repeat(100) });
        let sample = sample_json(&value, 21);
        assert!(sample.ends_with("... (truncated)"));
    }
}
