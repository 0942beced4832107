use once_cell::sync::Lazy;
use regex::Regex;

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"(?i)(api[_-]?key|access[_-]?token|token|secret|password|authorization)\s*[:=]\s*["']?(?:bearer\s+)?([A-Za-z0-9_\-\.]{6,})["']?"#)
            .expect("valid regex"),
        Regex::new(r"\b(gh[pousr]_[A-Za-z0-9]{20,})\b").expect("valid regex"),
        Regex::new(r"\b(phc_[A-Za-z0-9]{20,})\b").expect("valid regex"),
        Regex::new(r"\b(ya29\.[A-Za-z0-9_\-]{20,})\b").expect("valid regex"),
        Regex::new(r"\b(AIza[0-9A-Za-z_\-]{35})\b").expect("valid regex"),
    ]
});

static SECRET_KEYS: &[&str] = &[
    "token",
    "access_token",
    "refresh_token",
    "api_key",
    "apikey",
    "secret",
    "client_secret",
    "password",
    "authorization",
];

#[derive(Debug, Default, Clone)]
pub struct Redactor {
    aggressive: bool,
}

impl Redactor {
    pub fn new(aggressive: bool) -> Self {
        Self { aggressive }
    }

    /// Scrubs credentials out of free text such as error messages.
    pub fn redact(&self, input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }

        let mut result = input.to_string();
        if self.aggressive {
            result = result
                .split(' ')
                .map(|token| {
                    if token.len() > 48 && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                        "[REDACTED_LONG_TOKEN]".to_string()
                    } else {
                        token.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
        }

        for (index, pattern) in SECRET_PATTERNS.iter().enumerate() {
            if !pattern.is_match(&result) {
                continue;
            }
            result = pattern
                .replace_all(&result, |caps: &regex::Captures<'_>| {
                    if index == 0 {
                        let key = caps.get(1).map(|m| m.as_str()).unwrap_or("secret").to_ascii_lowercase();
                        format!("{}=[REDACTED]", key)
                    } else {
                        "[REDACTED]".to_string()
                    }
                })
                .to_string();
        }
        result
    }

    /// Masks credential-looking fields in a raw payload before it is shown to a model.
    pub fn redact_json(&self, value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, inner)| {
                        if is_secret_key(key) {
                            (key.clone(), serde_json::Value::String("[REDACTED]".to_string()))
                        } else {
                            (key.clone(), self.redact_json(inner))
                        }
                    })
                    .collect(),
            ),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|item| self.redact_json(item)).collect())
            }
            serde_json::Value::String(text) => serde_json::Value::String(self.redact(text)),
            other => other.clone(),
        }
    }
}

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase().replace('-', "_");
    SECRET_KEYS.iter().any(|candidate| lower == *candidate)
}
