use once_cell::sync::Lazy;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct StructuredOutputValidationResult {
    pub value: Option<Value>,
    pub error: Option<String>,
    pub errors: Vec<String>,
}

impl StructuredOutputValidationResult {
    /// Collapses the result into one message, listing the first few schema violations.
    pub fn into_result(self) -> Result<Value, String> {
        match (self.value, self.error) {
            (Some(value), None) => Ok(value),
            (_, Some(error)) if self.errors.is_empty() => Err(error),
            (_, Some(error)) => {
                let shown: Vec<&str> = self.errors.iter().take(5).map(String::as_str).collect();
                let more = self.errors.len().saturating_sub(shown.len());
                let mut message = format!("{} {}", error, shown.join("; "));
                if more > 0 {
                    message.push_str(&format!(" (+{} more)", more));
                }
                Err(message)
            }
            (None, None) => Err("Structured output is missing.".to_string()),
        }
    }
}

pub static INGESTION_OUTPUT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    serde_json::json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "timestamp": { "type": ["string", "integer", "number"] },
                "value": { "type": "number" },
                "dimensions": {
                    "type": ["object", "null"],
                    "additionalProperties": { "type": ["string", "number", "null"] }
                },
                "valueLabel": { "type": ["string", "null"] }
            },
            "required": ["timestamp", "value"]
        }
    })
});

pub static CHART_CONFIG_SCHEMA: Lazy<Value> = Lazy::new(|| {
    serde_json::json!({
        "type": "object",
        "properties": {
            "chartType": { "enum": ["line", "bar", "area", "pie", "scatter"] },
            "xAxisKey": { "type": "string", "minLength": 1 },
            "dataKeys": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 },
                "minItems": 1
            },
            "data": { "type": "array", "items": { "type": "object" } },
            "title": { "type": ["string", "null"] },
            "cadence": { "enum": ["DAILY", "WEEKLY", "MONTHLY", null] },
            "selectedDimension": { "type": ["string", "null"] }
        },
        "required": ["chartType", "xAxisKey", "dataKeys", "data"]
    })
});

pub fn resolve_structured_output(
    content: Option<&str>,
    fallback_text: Option<&str>,
) -> Option<Value> {
    if let Some(value) = content.and_then(parse_json_value) {
        return Some(value);
    }
    fallback_text.and_then(parse_json_value)
}

fn parse_json_value(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

pub fn validate_structured_output(
    value: Option<Value>,
    schema: Option<&Value>,
) -> StructuredOutputValidationResult {
    let Some(value) = value else {
        if schema.is_some() {
            return StructuredOutputValidationResult {
                value: None,
                error: Some("Structured output is missing or invalid JSON.".to_string()),
                errors: vec![],
            };
        }
        return StructuredOutputValidationResult {
            value: None,
            error: None,
            errors: vec![],
        };
    };

    let Some(schema) = schema else {
        return StructuredOutputValidationResult {
            value: Some(value),
            error: None,
            errors: vec![],
        };
    };

    let compiled = match jsonschema::JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(error) => {
            return StructuredOutputValidationResult {
                value: Some(value),
                error: Some(format!("Failed to compile output schema: {}", error)),
                errors: vec![],
            }
        }
    };

    let errors: Vec<String> = compiled
        .validate(&value)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if errors.is_empty() {
        StructuredOutputValidationResult {
            value: Some(value),
            error: None,
            errors,
        }
    } else {
        StructuredOutputValidationResult {
            value: Some(value),
            error: Some("Transformer output did not match its contract.".to_string()),
            errors,
        }
    }
}
