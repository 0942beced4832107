use crate::config::FetcherSettings;
use crate::errors::AppError;
use crate::harness::cli_missing::is_cli_missing_line;
use crate::models::{MetricTemplate, SyncMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use wait_timeout::ChildExt;

/// What the integration layer needs to pull one metric's raw payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub metric_id: String,
    pub integration_id: String,
    pub template: MetricTemplate,
    /// Last stored point, for incremental pulls.
    pub cursor: Option<DateTime<Utc>>,
    pub mode: SyncMode,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("integration credentials expired: {0}")]
    AuthExpired(String),
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("provider returned an unreadable payload: {0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Other(String),
}

impl From<FetchError> for AppError {
    fn from(value: FetchError) -> Self {
        AppError::Fetch(value.to_string())
    }
}

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<serde_json::Value, FetchError>;
}

static AUTH_PATTERNS: &[&str] = &["401", "unauthorized", "invalid_grant", "token expired", "bad credentials"];
static RATE_LIMIT_PATTERNS: &[&str] = &["429", "rate limit", "too many requests", "quota exceeded"];
static NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timed out",
    "could not resolve host",
    "network is unreachable",
];

/// Maps a failed fetcher's stderr onto the error taxonomy.
pub fn classify_fetch_failure(stderr: &str) -> FetchError {
    let lower = stderr.to_ascii_lowercase();
    let message = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("fetcher exited without output")
        .trim()
        .to_string();

    if AUTH_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        FetchError::AuthExpired(message)
    } else if RATE_LIMIT_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        FetchError::RateLimited(message)
    } else if NETWORK_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        FetchError::Network(message)
    } else {
        FetchError::Other(message)
    }
}

/// Runs an external fetcher program. The request goes in as JSON on stdin and the
/// raw provider payload comes back as JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandDataSource {
    settings: FetcherSettings,
}

impl CommandDataSource {
    pub fn new(settings: FetcherSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl DataSource for CommandDataSource {
    async fn fetch(&self, request: &FetchRequest) -> Result<serde_json::Value, FetchError> {
        let input = serde_json::to_vec(request).map_err(|error| FetchError::Other(error.to_string()))?;
        let settings = self.settings.clone();
        let metric_id = request.metric_id.clone();

        let (stdout, stderr, success) = tokio::task::spawn_blocking(move || run_fetcher(&settings, &input))
            .await
            .map_err(|error| FetchError::Other(format!("fetcher task failed: {}", error)))??;

        if !success {
            tracing::warn!(metric_id = %metric_id, "fetcher exited with failure");
            return Err(classify_fetch_failure(&stderr));
        }

        serde_json::from_str::<serde_json::Value>(stdout.trim())
            .map_err(|error| FetchError::InvalidPayload(error.to_string()))
    }
}

fn run_fetcher(settings: &FetcherSettings, input: &[u8]) -> Result<(String, String, bool), FetchError> {
    let mut child = Command::new(&settings.program)
        .args(&settings.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            let message = error.to_string();
            if is_cli_missing_line(&message) {
                FetchError::Other(format!("fetcher '{}' is not installed", settings.program))
            } else {
                FetchError::Other(message)
            }
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .map_err(|error| FetchError::Other(format!("failed to write fetch request: {}", error)))?;
    }

    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let timeout = Duration::from_secs(settings.timeout_seconds.max(1));
    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(FetchError::Network(format!(
                "fetch timed out after {}s",
                settings.timeout_seconds
            )));
        }
        Err(error) => return Err(FetchError::Other(error.to_string())),
    };

    let stdout = stdout_reader.and_then(|handle| handle.join().ok()).unwrap_or_default();
    let stderr = stderr_reader.and_then(|handle| handle.join().ok()).unwrap_or_default();
    Ok((stdout, stderr, status.success()))
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = source.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).to_string()
    })
}

/// Used when no fetcher is configured; every fetch fails without side effects.
#[derive(Debug, Default, Clone)]
pub struct UnconfiguredDataSource;

#[async_trait]
impl DataSource for UnconfiguredDataSource {
    async fn fetch(&self, request: &FetchRequest) -> Result<serde_json::Value, FetchError> {
        Err(FetchError::Other(format!(
            "no fetcher configured for integration '{}'",
            request.template.integration.as_str()
        )))
    }
}
