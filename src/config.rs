use crate::errors::{AppError, AppResult};
use crate::models::{Cadence, Provider};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = "settings.yaml";
const DATA_DIR_ENV: &str = "METRIC_REFRESH_DATA_DIR";
const GENERATOR_BINARY_ENV: &str = "METRIC_REFRESH_GENERATOR_BIN";
const GENERATOR_PROVIDER_ENV: &str = "METRIC_REFRESH_GENERATOR_PROVIDER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    pub provider: Provider,
    pub binary_path: String,
    pub model: Option<String>,
    pub timeout_seconds: u64,
    /// Raw payload bytes embedded in the generation prompt.
    pub max_sample_bytes: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            provider: Provider::Claude,
            binary_path: "claude".to_string(),
            model: None,
            timeout_seconds: 120,
            max_sample_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub max_operations: u64,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_string_size: usize,
    pub max_call_levels: usize,
    pub max_output_points: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_operations: 5_000_000,
            max_array_size: 100_000,
            max_map_size: 10_000,
            max_string_size: 1_000_000,
            max_call_levels: 32,
            max_output_points: 50_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetcherSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_fetch_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_fetch_timeout_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub poll_interval_seconds: u64,
    pub poll_batch_size: usize,
    pub max_concurrent_refreshes: usize,
    pub stale_lock_seconds: i64,
    pub generation: GenerationSettings,
    pub sandbox: SandboxLimits,
    pub fetcher: Option<FetcherSettings>,
    pub redact_aggressive: bool,
    pub default_goal_cadence: Cadence,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 15 * 60,
            poll_batch_size: 25,
            max_concurrent_refreshes: 4,
            stale_lock_seconds: 30 * 60,
            generation: GenerationSettings::default(),
            sandbox: SandboxLimits::default(),
            fetcher: None,
            redact_aggressive: true,
            default_goal_cadence: Cadence::Monthly,
        }
    }
}

impl PipelineSettings {
    /// Defaults, deep-merged with `<data_dir>/settings.yaml` when present, then env overrides.
    pub fn load(data_dir: &Path) -> AppResult<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        let path = data_dir.join(SETTINGS_FILE_NAME);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let overrides: serde_json::Value = serde_yaml::from_str(&raw)?;
            if !overrides.is_null() {
                merge_json(&mut merged, overrides);
            }
            tracing::info!(path = %path.display(), "loaded pipeline settings file");
        }
        let mut settings: PipelineSettings =
            serde_json::from_value(merged).map_err(|error| AppError::Policy(format!("invalid settings: {}", error)))?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(binary) = std::env::var(GENERATOR_BINARY_ENV) {
            if !binary.trim().is_empty() {
                self.generation.binary_path = binary.trim().to_string();
            }
        }
        if let Ok(provider) = std::env::var(GENERATOR_PROVIDER_ENV) {
            match provider.trim().to_ascii_lowercase().as_str() {
                "codex" => self.generation.provider = Provider::Codex,
                "claude" => self.generation.provider = Provider::Claude,
                other => tracing::warn!(provider = other, "ignoring unknown generator provider override"),
            }
        }
    }
}

pub fn resolve_data_dir() -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw.trim()),
        _ => std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".metric-refresh"),
    }
}

pub(crate) fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PipelineSettings, SETTINGS_FILE_NAME};
    use crate::models::{Cadence, Provider};

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = PipelineSettings::load(dir.path()).expect("load");
        assert_eq!(settings.poll_interval_seconds, 900);
        assert_eq!(settings.default_goal_cadence, Cadence::Monthly);
    }

    #[test]
    fn yaml_file_merges_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(SETTINGS_FILE_NAME),
            "pollBatchSize: 5\ngeneration:\n  provider: codex\n  binaryPath: /usr/local/bin/codex\nsandbox:\n  timeoutMs: 250\n",
        )
        .expect("write settings");

        let settings = PipelineSettings::load(dir.path()).expect("load");
        assert_eq!(settings.poll_batch_size, 5);
        assert_eq!(settings.generation.provider, Provider::Codex);
        assert_eq!(settings.generation.binary_path, "/usr/local/bin/codex");
        assert_eq!(settings.generation.timeout_seconds, 120);
        assert_eq!(settings.sandbox.timeout_ms, 250);
        assert_eq!(settings.sandbox.max_operations, 5_000_000);
    }

    #[test]
    fn malformed_yaml_is_a_policy_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(SETTINGS_FILE_NAME), "pollBatchSize: [unterminated").expect("write");
        let error = PipelineSettings::load(dir.path()).expect_err("should fail");
        assert!(error.to_string().starts_with("POLICY_DENIED"));
    }
}
