use super::fingerprint::chart_fingerprint;
use super::{Resolved, TransformerContext};
use crate::errors::{AppError, AppResult};
use crate::generator::chart_prompt;
use crate::harness::structured_output::{validate_structured_output, CHART_CONFIG_SCHEMA};
use crate::models::{ChartTransformer, DashboardChart, DataPoint, Metric};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Shape of a stored point as chart scripts see it.
pub fn point_to_json(point: &DataPoint) -> Value {
    serde_json::json!({
        "timestamp": point.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        "value": point.value,
        "dimensions": point.dimensions,
        "valueLabel": point.value_label,
    })
}

pub async fn get_or_generate(
    ctx: &TransformerContext,
    cached: Option<ChartTransformer>,
    metric: &Metric,
    chart: &DashboardChart,
    points: &[DataPoint],
    regenerate: bool,
) -> AppResult<Resolved<ChartTransformer>> {
    let selected_dimension = chart.selected_dimension.as_deref();
    let fingerprint = chart_fingerprint(points, chart.cadence, selected_dimension, &chart.user_prompt);
    if !regenerate {
        if let Some(cached) = cached {
            if cached.input_fingerprint == fingerprint {
                return Ok(Resolved {
                    transformer: cached,
                    generated: false,
                });
            }
            tracing::info!(chart_id = %chart.id, "chart inputs changed; regenerating chart transformer");
        }
    }

    let prompt = chart_prompt(
        metric,
        &chart.title,
        points,
        chart.cadence,
        selected_dimension,
        &chart.user_prompt,
        ctx.max_sample_bytes,
    );
    let code = ctx.generator.generate(&prompt).await?;
    ctx.sandbox
        .check_script(&code)
        .map_err(|error| AppError::Generation(format!("generated chart script does not compile: {}", error)))?;

    Ok(Resolved {
        transformer: ChartTransformer {
            id: Uuid::new_v4().to_string(),
            chart_id: chart.id.clone(),
            code,
            input_fingerprint: fingerprint,
            cadence: chart.cadence,
            selected_dimension: chart.selected_dimension.clone(),
            user_prompt: chart.user_prompt.clone(),
            created_at: Utc::now(),
        },
        generated: true,
    })
}

/// Builds the chart config from stored points. Missing optional fields are filled from the chart.
pub async fn execute(
    ctx: &TransformerContext,
    transformer: &ChartTransformer,
    chart: &DashboardChart,
    points: &[DataPoint],
) -> AppResult<Value> {
    let inputs = vec![
        ("points", Value::Array(points.iter().map(point_to_json).collect())),
        ("cadence", Value::String(chart.cadence.as_str().to_string())),
        (
            "selected_dimension",
            chart
                .selected_dimension
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        ),
    ];
    let output = ctx.sandbox.run(&transformer.code, inputs).await?;
    let mut config = validate_structured_output(Some(output), Some(&*CHART_CONFIG_SCHEMA))
        .into_result()
        .map_err(AppError::Execution)?;

    check_keys_present(&config)?;

    if let Some(map) = config.as_object_mut() {
        if map.get("title").map_or(true, Value::is_null) {
            map.insert("title".to_string(), Value::String(chart.title.clone()));
        }
        if map.get("cadence").map_or(true, Value::is_null) {
            map.insert("cadence".to_string(), Value::String(chart.cadence.as_str().to_string()));
        }
        if !map.contains_key("selectedDimension") {
            map.insert(
                "selectedDimension".to_string(),
                chart
                    .selected_dimension
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
        }
    }
    Ok(config)
}

/// Every data key, and the x axis key, must appear in at least one row.
fn check_keys_present(config: &Value) -> AppResult<()> {
    let rows = config
        .get("data")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if rows.is_empty() {
        return Ok(());
    }
    let x_axis = config.get("xAxisKey").and_then(Value::as_str).unwrap_or_default();
    let data_keys = config
        .get("dataKeys")
        .and_then(Value::as_array)
        .map(|keys| keys.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();

    for key in std::iter::once(x_axis).chain(data_keys) {
        if !rows.iter().any(|row| row.get(key).is_some()) {
            return Err(AppError::Execution(format!(
                "chart key '{}' does not appear in any data row",
                key
            )));
        }
    }
    Ok(())
}
