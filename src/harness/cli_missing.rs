use crate::models::Provider;

static CLI_MISSING_PATTERNS: &[&str] = &[
    "not installed",
    "command not found",
    "no such file or directory",
    "is not recognized as an internal or external command",
];

pub fn is_cli_missing_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    CLI_MISSING_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// A readable reason when the generator binary cannot be launched.
pub fn describe_missing_generator(output: &str, provider: Provider, binary_path: &str) -> Option<String> {
    let line = output.lines().find(|line| is_cli_missing_line(line))?;
    Some(format!(
        "{} CLI is unavailable at '{}': {}",
        provider.as_str(),
        binary_path,
        line.trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::{describe_missing_generator, is_cli_missing_line};
    use crate::models::Provider;

    #[test]
    fn detects_cli_missing_variants() {
        assert!(is_cli_missing_line("command not found: claude"));
        assert!(is_cli_missing_line("is not recognized as an internal or external command"));
        assert!(!is_cli_missing_line("normal stderr line"));
    }

    #[test]
    fn describes_missing_generator() {
        let message = describe_missing_generator("warming up\nsh: codex: command not found", Provider::Codex, "codex")
            .expect("missing");
        assert!(message.starts_with("codex CLI is unavailable at 'codex'"));
        assert!(describe_missing_generator("all good", Provider::Claude, "claude").is_none());
    }
}
