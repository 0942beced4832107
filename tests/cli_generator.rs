use metric_refresh::config::GenerationSettings;
use metric_refresh::generator::{CliCodeGenerator, CodeGenerator, GenerationPrompt, TransformerKind};
use metric_refresh::models::Provider;

fn prompt() -> GenerationPrompt {
    GenerationPrompt {
        kind: TransformerKind::Ingestion,
        text: "convert the payload".to_string(),
    }
}

#[tokio::test]
async fn missing_binary_is_a_generation_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = GenerationSettings {
        provider: Provider::Claude,
        binary_path: dir.path().join("no-such-claude").to_string_lossy().to_string(),
        timeout_seconds: 5,
        ..GenerationSettings::default()
    };
    let generator = CliCodeGenerator::new(settings, dir.path().join("work"));
    let error = generator.generate(&prompt()).await.expect_err("missing binary");
    assert!(error.to_string().starts_with("GENERATION_FAILED"), "{}", error);
}

#[cfg(unix)]
fn mock_cli(dir: &std::path::Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write mock");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod mock");
    path.to_string_lossy().to_string()
}

#[cfg(unix)]
#[tokio::test]
async fn claude_json_result_yields_fenced_script() {
    let dir = tempfile::tempdir().expect("tempdir");
    let binary = mock_cli(
        dir.path(),
        "mock-claude.sh",
        r#"echo 'progress: thinking' >&2
printf '%s\n' '{"type":"result","result":"Here you go:\n```rhai\nlet out = [];\nout\n```"}'"#,
    );
    let settings = GenerationSettings {
        provider: Provider::Claude,
        binary_path: binary,
        timeout_seconds: 10,
        ..GenerationSettings::default()
    };
    let generator = CliCodeGenerator::new(settings, dir.path().join("work"));
    let script = generator.generate(&prompt()).await.expect("script");
    assert_eq!(script, "let out = [];\nout");
}

#[cfg(unix)]
#[tokio::test]
async fn non_zero_exit_reports_last_stderr_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let binary = mock_cli(dir.path(), "mock-codex.sh", "echo 'error: model overloaded' >&2\nexit 3");
    let settings = GenerationSettings {
        provider: Provider::Codex,
        binary_path: binary,
        timeout_seconds: 10,
        ..GenerationSettings::default()
    };
    let generator = CliCodeGenerator::new(settings, dir.path().join("work"));
    let error = generator.generate(&prompt()).await.expect_err("exit 3").to_string();
    assert!(error.contains("model overloaded"), "{}", error);
    assert!(error.contains("Some(3)"), "{}", error);
}

#[cfg(unix)]
#[tokio::test]
async fn slow_generator_times_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let binary = mock_cli(dir.path(), "mock-slow.sh", "sleep 5");
    let settings = GenerationSettings {
        provider: Provider::Claude,
        binary_path: binary,
        timeout_seconds: 1,
        ..GenerationSettings::default()
    };
    let generator = CliCodeGenerator::new(settings, dir.path().join("work"));
    let error = generator.generate(&prompt()).await.expect_err("timeout").to_string();
    assert!(error.contains("timed out"), "{}", error);
}
