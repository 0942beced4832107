use super::fingerprint::Shape;
use super::{Resolved, TransformerContext};
use crate::errors::{AppError, AppResult};
use crate::generator::ingestion_prompt;
use crate::harness::structured_output::{validate_structured_output, INGESTION_OUTPUT_SCHEMA};
use crate::models::{DataPointInput, IngestionTransformer, Metric};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Epoch values at or above this are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Reuses `cached` when its recorded shape covers the payload (an empty page or a null
/// field never forces a rewrite), otherwise asks the generator for a new script.
/// Nothing is persisted here.
pub async fn get_or_generate(
    ctx: &TransformerContext,
    cached: Option<IngestionTransformer>,
    metric: &Metric,
    raw: &Value,
    cursor: Option<DateTime<Utc>>,
    regenerate: bool,
) -> AppResult<Resolved<IngestionTransformer>> {
    let shape = Shape::of(raw);
    let fingerprint = shape.fingerprint();
    if !regenerate {
        if let Some(cached) = cached {
            let covered = cached.input_fingerprint == fingerprint
                || Shape::parse(&cached.input_shape).is_some_and(|known| known.covers(&shape));
            if covered {
                return Ok(Resolved {
                    transformer: cached,
                    generated: false,
                });
            }
            tracing::info!(metric_id = %metric.id, "raw payload shape changed; regenerating ingestion transformer");
        }
    }

    let prompt = ingestion_prompt(metric, raw, cursor, &ctx.redactor, ctx.max_sample_bytes);
    let code = ctx.generator.generate(&prompt).await?;
    ctx.sandbox
        .check_script(&code)
        .map_err(|error| AppError::Generation(format!("generated ingestion script does not compile: {}", error)))?;

    Ok(Resolved {
        transformer: IngestionTransformer {
            id: Uuid::new_v4().to_string(),
            metric_id: metric.id.clone(),
            code,
            input_fingerprint: fingerprint,
            input_shape: shape.signature(),
            created_at: Utc::now(),
        },
        generated: true,
    })
}

/// Runs the script against `raw` and normalizes its output. Any malformed point fails the whole batch.
pub async fn execute(
    ctx: &TransformerContext,
    transformer: &IngestionTransformer,
    raw: &Value,
    cursor: Option<DateTime<Utc>>,
) -> AppResult<Vec<DataPointInput>> {
    let cursor_value = cursor
        .map(|cursor| Value::String(cursor.to_rfc3339()))
        .unwrap_or(Value::Null);
    let output = ctx
        .sandbox
        .run(&transformer.code, vec![("raw", raw.clone()), ("cursor", cursor_value)])
        .await?;

    let output = validate_structured_output(Some(output), Some(&*INGESTION_OUTPUT_SCHEMA))
        .into_result()
        .map_err(AppError::Execution)?;
    let Value::Array(items) = output else {
        return Err(AppError::Execution("ingestion output is not an array".to_string()));
    };

    let max_points = ctx.sandbox.limits().max_output_points;
    if items.len() > max_points {
        return Err(AppError::Execution(format!(
            "ingestion produced {} points; the limit is {}",
            items.len(),
            max_points
        )));
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| normalize_point(item).map_err(|reason| AppError::Execution(format!("point {}: {}", index, reason))))
        .collect()
}

fn normalize_point(item: &Value) -> Result<DataPointInput, String> {
    let timestamp = item
        .get("timestamp")
        .and_then(parse_timestamp)
        .ok_or_else(|| format!("unrecognized timestamp {}", item.get("timestamp").unwrap_or(&Value::Null)))?;
    let value = item
        .get("value")
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite())
        .ok_or_else(|| "value is not a finite number".to_string())?;

    let dimensions = item.get("dimensions").and_then(Value::as_object).map(|map| {
        map.iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<BTreeMap<_, _>>()
    });
    let value_label = item
        .get("valueLabel")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    Ok(DataPointInput {
        timestamp,
        value,
        dimensions: dimensions.filter(|map| !map.is_empty()),
        value_label,
    })
}

/// RFC 3339, `YYYY-MM-DD`, naive `YYYY-MM-DD[T ]HH:MM:SS` (as UTC), or epoch seconds/milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
                return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
            }
            ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
                .map(|naive| naive.and_utc())
        }
        Value::Number(number) => {
            let raw = number.as_f64()?;
            if !raw.is_finite() {
                return None;
            }
            if raw.abs() >= EPOCH_MILLIS_THRESHOLD {
                DateTime::from_timestamp_millis(raw as i64)
            } else {
                DateTime::from_timestamp(raw.trunc() as i64, 0)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{execute, get_or_generate, parse_timestamp};
    use crate::config::SandboxLimits;
    use crate::errors::AppResult;
    use crate::generator::{CodeGenerator, GenerationPrompt};
    use crate::models::{IngestionTransformer, Metric};
    use crate::redaction::Redactor;
    use crate::sandbox::Sandbox;
    use crate::transformers::fingerprint::{shape_fingerprint, Shape};
    use crate::transformers::TransformerContext;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingGenerator {
        script: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CodeGenerator for CountingGenerator {
        async fn generate(&self, _prompt: &GenerationPrompt) -> AppResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.script.clone())
        }
    }

    fn context(script: &str) -> (TransformerContext, Arc<CountingGenerator>) {
        let generator = Arc::new(CountingGenerator {
            script: script.to_string(),
            calls: AtomicUsize::new(0),
        });
        let ctx = TransformerContext {
            generator: generator.clone(),
            sandbox: Sandbox::new(SandboxLimits::default()),
            redactor: Redactor::new(true),
            max_sample_bytes: 4096,
        };
        (ctx, generator)
    }

    fn metric() -> Metric {
        Metric {
            id: "m-1".to_string(),
            organization_id: "org".to_string(),
            name: "Commits".to_string(),
            description: String::new(),
            integration_id: Some("conn".to_string()),
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

    const SCRIPT: &str = r#"
        let out = [];
        for row in raw.rows { out.push(#{ timestamp: row.day, value: row.n, dimensions: #{ repo: row.repo } }); }
        out
    "#;

    #[test]
    fn parses_supported_timestamp_forms() {
        let midnight = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&serde_json::json!("2026-03-01")), Some(midnight));
        assert_eq!(parse_timestamp(&serde_json::json!("2026-03-01T00:00:00Z")), Some(midnight));
        assert_eq!(parse_timestamp(&serde_json::json!("2026-03-01T01:00:00+01:00")), Some(midnight));
        assert_eq!(parse_timestamp(&serde_json::json!("2026-03-01 00:00:00")), Some(midnight));
        assert_eq!(parse_timestamp(&serde_json::json!(midnight.timestamp())), Some(midnight));
        assert_eq!(parse_timestamp(&serde_json::json!(midnight.timestamp_millis())), Some(midnight));
        assert_eq!(parse_timestamp(&serde_json::json!("yesterday")), None);
        assert_eq!(parse_timestamp(&serde_json::json!(true)), None);
    }

    #[tokio::test]
    async fn reuses_cached_transformer_for_same_shape() {
        let (ctx, generator) = context(SCRIPT);
        let raw = serde_json::json!({ "rows": [{ "day": "2026-03-01", "n": 2, "repo": "core" }] });
        let cached = IngestionTransformer {
            id: "cached".to_string(),
            metric_id: "m-1".to_string(),
            code: SCRIPT.to_string(),
            input_fingerprint: shape_fingerprint(&raw),
            input_shape: Shape::of(&raw).signature(),
            created_at: Utc::now(),
        };

        let reused = get_or_generate(&ctx, Some(cached.clone()), &metric(), &raw, None, false)
            .await
            .expect("resolve");
        assert!(!reused.generated);
        assert_eq!(reused.transformer.id, "cached");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

        let forced = get_or_generate(&ctx, Some(cached), &metric(), &raw, None, true)
            .await
            .expect("regenerate");
        assert!(forced.generated);
        assert!(forced.fresh().is_some());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sparser_payload_keeps_cached_transformer() {
        let (ctx, generator) = context(SCRIPT);
        let full = serde_json::json!({ "rows": [{ "day": "2026-03-01", "n": 2, "repo": "core" }] });
        let resolved = get_or_generate(&ctx, None, &metric(), &full, None, false).await.expect("generate");
        let cached = resolved.transformer;

        for sparse in [
            serde_json::json!({ "rows": [] }),
            serde_json::json!({ "rows": [{ "day": "2026-03-02", "n": 1, "repo": null }] }),
            serde_json::json!({ "rows": [{ "day": "2026-03-02", "n": 1 }] }),
        ] {
            let reused = get_or_generate(&ctx, Some(cached.clone()), &metric(), &sparse, None, false)
                .await
                .expect("resolve");
            assert!(!reused.generated, "{}", sparse);
        }
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

        let widened = serde_json::json!({ "rows": [{ "day": "2026-03-02", "n": 1, "repo": "core", "author": "x" }] });
        let regenerated = get_or_generate(&ctx, Some(cached), &metric(), &widened, None, false)
            .await
            .expect("regenerate");
        assert!(regenerated.generated);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn uncompilable_script_is_a_generation_error() {
        let (ctx, _) = context("let = ;");
        let error = get_or_generate(&ctx, None, &metric(), &serde_json::json!({}), None, false)
            .await
            .expect_err("should fail");
        assert!(error.to_string().starts_with("GENERATION_FAILED"));
    }

    #[tokio::test]
    async fn executes_and_normalizes_points() {
        let (ctx, _) = context(SCRIPT);
        let raw = serde_json::json!({ "rows": [
            { "day": "2026-03-01", "n": 2, "repo": "core" },
            { "day": "2026-03-02", "n": 3.5, "repo": "web" }
        ] });
        let resolved = get_or_generate(&ctx, None, &metric(), &raw, None, false).await.expect("generate");
        let points = execute(&ctx, &resolved.transformer, &raw, None).await.expect("execute");
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].value, 3.5);
        assert_eq!(points[1].timestamp, Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());
        assert_eq!(points[0].dimension_key(), r#"{"repo":"core"}"#);
    }

    #[tokio::test]
    async fn bad_timestamp_fails_the_batch() {
        let (ctx, _) = context(SCRIPT);
        let raw = serde_json::json!({ "rows": [
            { "day": "2026-03-01", "n": 2, "repo": "core" },
            { "day": "someday", "n": 3, "repo": "web" }
        ] });
        let resolved = get_or_generate(&ctx, None, &metric(), &raw, None, false).await.expect("generate");
        let error = execute(&ctx, &resolved.transformer, &raw, None).await.expect_err("should fail");
        assert!(error.to_string().contains("point 1"));
    }
}
