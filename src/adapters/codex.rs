use super::{last_non_empty_line, parse_last_json, Adapter, GenerationCall, ValidatedCommand};
use crate::errors::AppResult;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct CodexAdapter;

impl Adapter for CodexAdapter {
    fn build_command(&self, call: &GenerationCall, binary_path: &str) -> AppResult<ValidatedCommand> {
        self.validate(call)?;

        let mut args = vec![
            "exec".to_string(),
            "--json".to_string(),
            "--skip-git-repo-check".to_string(),
            "--sandbox".to_string(),
            "read-only".to_string(),
        ];
        if let Some(model) = &call.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push(call.prompt.clone());

        Ok(ValidatedCommand {
            program: binary_path.to_string(),
            args,
            cwd: call.cwd.clone(),
            env: BTreeMap::new(),
        })
    }

    fn parse_final(&self, exit_code: Option<i32>, buffered_output: &str) -> serde_json::Value {
        let summary =
            extract_last_agent_message(buffered_output).unwrap_or_else(|| last_non_empty_line(buffered_output));
        let structured = parse_last_json(buffered_output);
        serde_json::json!({
            "provider": "codex",
            "exitCode": exit_code,
            "summary": summary,
            "structured": structured
        })
    }
}

fn extract_last_agent_message(raw: &str) -> Option<String> {
    let mut last: Option<String> = None;
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            continue;
        }
        let Some(parsed) = serde_json::from_str::<serde_json::Value>(trimmed).ok() else {
            continue;
        };
        let event_type = parsed.get("type").and_then(|value| value.as_str());
        if event_type != Some("item.completed") {
            continue;
        }
        let Some(item) = parsed.get("item") else {
            continue;
        };
        if item.get("type").and_then(|value| value.as_str()) != Some("agent_message") {
            continue;
        }
        let text = item.get("text").and_then(|value| value.as_str()).unwrap_or_default().trim();
        if !text.is_empty() {
            last = Some(text.to_string());
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::{extract_last_agent_message, CodexAdapter};
    use crate::adapters::{Adapter, GenerationCall};

    #[test]
    fn builds_read_only_exec_command() {
        let call = GenerationCall {
            prompt: "hello".to_string(),
            model: None,
            cwd: "/tmp".to_string(),
        };
        let built = CodexAdapter.build_command(&call, "codex").expect("build command");
        assert_eq!(built.args[0], "exec");
        assert!(built.args.contains(&"--json".to_string()));
        assert!(built.args.windows(2).any(|pair| pair[0] == "--sandbox" && pair[1] == "read-only"));
        assert_eq!(built.args.last().map(String::as_str), Some("hello"));
    }

    #[test]
    fn extracts_last_agent_message_from_jsonl() {
        let raw = r#"{"type":"item.completed","item":{"type":"reasoning","text":"thinking"}}
{"type":"item.completed","item":{"type":"agent_message","text":"first"}}
{"type":"item.completed","item":{"type":"agent_message","text":"second"}}"#;
        assert_eq!(extract_last_agent_message(raw).as_deref(), Some("second"));
        let parsed = CodexAdapter.parse_final(Some(0), raw);
        assert_eq!(parsed["summary"], "second");
    }
}
