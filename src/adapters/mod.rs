pub mod claude;
pub mod codex;

use crate::errors::{AppError, AppResult};
use crate::models::Provider;
use std::collections::BTreeMap;

/// One non-interactive generation call handed to an AI CLI.
#[derive(Debug, Clone)]
pub struct GenerationCall {
    pub prompt: String,
    pub model: Option<String>,
    pub cwd: String,
}

#[derive(Debug, Clone)]
pub struct ValidatedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
}

pub trait Adapter: Send + Sync {
    fn validate(&self, call: &GenerationCall) -> AppResult<()> {
        if call.prompt.trim().is_empty() {
            return Err(AppError::Generation("Prompt cannot be empty".to_string()));
        }
        Ok(())
    }
    fn build_command(&self, call: &GenerationCall, binary_path: &str) -> AppResult<ValidatedCommand>;
    /// `{ provider, exitCode, summary, structured }` where `summary` is the final answer text.
    fn parse_final(&self, exit_code: Option<i32>, buffered_output: &str) -> serde_json::Value;
}

pub fn adapter_for(provider: Provider) -> Box<dyn Adapter> {
    match provider {
        Provider::Claude => Box::new(claude::ClaudeAdapter),
        Provider::Codex => Box::new(codex::CodexAdapter),
    }
}

pub(crate) fn parse_last_json(raw: &str) -> Option<serde_json::Value> {
    raw.lines().rev().find_map(|line| {
        let trimmed = line.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            serde_json::from_str::<serde_json::Value>(trimmed).ok()
        } else {
            None
        }
    })
}

pub(crate) fn last_non_empty_line(raw: &str) -> String {
    raw.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .to_string()
}
