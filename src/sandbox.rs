use crate::config::SandboxLimits;
use crate::errors::{AppError, AppResult};
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope};
use serde_json::Value;
use std::time::{Duration, Instant};

const MAX_EXPR_DEPTH: usize = 64;
const MAX_FN_EXPR_DEPTH: usize = 32;

/// Isolated rhai interpreter for generated transformer scripts.
///
/// Scripts get no filesystem, network, module or `eval` access. Every run is bounded
/// by an operation budget, container size caps and a wall-clock budget checked from
/// the engine's progress callback, with an outer async timeout as a backstop.
#[derive(Debug, Clone)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Compiles without running. Used to reject broken generated code before it is cached.
    pub fn check_script(&self, code: &str) -> Result<(), String> {
        let engine = build_engine(&self.limits, None);
        engine.compile(code).map(|_| ()).map_err(|error| error.to_string())
    }

    /// Runs `code` with each input bound as a scope variable and returns its final value as JSON.
    pub async fn run(&self, code: &str, inputs: Vec<(&'static str, Value)>) -> AppResult<Value> {
        let limits = self.limits.clone();
        let code = code.to_string();
        let budget = Duration::from_millis(limits.timeout_ms);

        let task = tokio::task::spawn_blocking(move || execute_blocking(&limits, &code, inputs));
        match tokio::time::timeout(budget + Duration::from_secs(1), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => Err(AppError::Execution(format!("script task failed: {}", error))),
            Err(_) => Err(AppError::Execution(format!(
                "script exceeded its {}ms time budget",
                budget.as_millis()
            ))),
        }
    }
}

fn execute_blocking(limits: &SandboxLimits, code: &str, inputs: Vec<(&'static str, Value)>) -> AppResult<Value> {
    let deadline = Instant::now() + Duration::from_millis(limits.timeout_ms);
    let engine = build_engine(limits, Some(deadline));
    let ast = engine
        .compile(code)
        .map_err(|error| AppError::Execution(format!("script does not compile: {}", error)))?;

    let mut scope = Scope::new();
    for (name, value) in inputs {
        scope.push_dynamic(name, json_to_dynamic(&value));
    }

    let result = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(|error| AppError::Execution(describe_eval_error(&error, limits)))?;
    Ok(dynamic_to_json(&result))
}

fn build_engine(limits: &SandboxLimits, deadline: Option<Instant>) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine.on_print(|_| {});
    engine.on_debug(|_, _, _| {});

    if let Some(deadline) = deadline {
        engine.on_progress(move |_| {
            if Instant::now() >= deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
    }
    engine
}

fn describe_eval_error(error: &EvalAltResult, limits: &SandboxLimits) -> String {
    match error {
        EvalAltResult::ErrorTerminated(_, _) => {
            format!("script exceeded its {}ms time budget", limits.timeout_ms)
        }
        EvalAltResult::ErrorTooManyOperations(_) => {
            format!("script exceeded its budget of {} operations", limits.max_operations)
        }
        EvalAltResult::ErrorDataTooLarge(what, _) => format!("script produced oversized data: {}", what),
        EvalAltResult::ErrorStackOverflow(_) => "script recursed too deeply".to_string(),
        other => format!("script failed: {}", other),
    }
}

pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(arr) => Dynamic::from(arr.iter().map(json_to_dynamic).collect::<rhai::Array>()),
        Value::Object(obj) => Dynamic::from(
            obj.iter()
                .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v)))
                .collect::<Map>(),
        ),
    }
}

pub fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if value.is_bool() {
        Value::Bool(value.as_bool().unwrap_or(false))
    } else if value.is_int() {
        Value::Number(value.as_int().unwrap_or(0).into())
    } else if value.is_float() {
        value
            .as_float()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if value.is_string() {
        Value::String(value.to_string())
    } else if value.is_array() {
        let arr = value.clone().into_array().unwrap_or_default();
        Value::Array(arr.iter().map(dynamic_to_json).collect())
    } else if value.is_map() {
        let map = value.clone().try_cast::<Map>().unwrap_or_default();
        Value::Object(map.iter().map(|(k, v)| (k.to_string(), dynamic_to_json(v))).collect())
    } else {
        Value::String(value.to_string())
    }
}
