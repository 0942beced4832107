use super::{last_non_empty_line, parse_last_json, Adapter, GenerationCall, ValidatedCommand};
use crate::errors::AppResult;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct ClaudeAdapter;

impl Adapter for ClaudeAdapter {
    fn build_command(&self, call: &GenerationCall, binary_path: &str) -> AppResult<ValidatedCommand> {
        self.validate(call)?;

        let mut args = vec![
            "-p".to_string(),
            call.prompt.clone(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(model) = &call.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        // Generated code comes back as text; no tools are needed.
        args.push("--disallowedTools".to_string());
        args.push("Bash,Edit,Write,WebFetch,WebSearch".to_string());

        let mut env = BTreeMap::new();
        env.insert("CLAUDE_NON_INTERACTIVE".to_string(), "1".to_string());

        Ok(ValidatedCommand {
            program: binary_path.to_string(),
            args,
            cwd: call.cwd.clone(),
            env,
        })
    }

    fn parse_final(&self, exit_code: Option<i32>, buffered_output: &str) -> serde_json::Value {
        let structured = parse_last_json(buffered_output);
        let summary = structured
            .as_ref()
            .and_then(|value| value.get("result"))
            .and_then(|value| value.as_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| {
                if structured.is_some() {
                    last_non_empty_line(buffered_output)
                } else {
                    buffered_output.trim().to_string()
                }
            });
        serde_json::json!({
            "provider": "claude",
            "exitCode": exit_code,
            "summary": summary,
            "structured": structured
        })
    }
}
