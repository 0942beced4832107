#![allow(dead_code)]

use async_trait::async_trait;
use metric_refresh::config::PipelineSettings;
use metric_refresh::db::Database;
use metric_refresh::errors::{AppError, AppResult};
use metric_refresh::generator::{CodeGenerator, GenerationPrompt, TransformerKind};
use metric_refresh::models::Metric;
use metric_refresh::pipeline::RefreshPipeline;
use metric_refresh::source::{DataSource, FetchError, FetchRequest};
use metric_refresh::templates::find_template;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const INGEST_ROWS: &str = r#"
    let out = [];
    for row in raw.rows {
        let point = #{ timestamp: row.day, value: row.n };
        if "repo" in row { point.dimensions = #{ repo: row.repo }; }
        out.push(point);
    }
    out
"#;

pub const SUM_BY_DAY: &str = r#"
    let totals = #{};
    for p in points {
        let day = p.timestamp.sub_string(0, 10);
        let current = if day in totals { totals[day] } else { 0.0 };
        totals[day] = current + p.value;
    }
    let data = [];
    for day in totals.keys() { data.push(#{ date: day, value: totals[day] }); }
    #{ chartType: "line", xAxisKey: "date", dataKeys: ["value"], data: data }
"#;

/// Serves whatever payload is currently set, or fails with a network error.
#[derive(Default)]
pub struct FakeSource {
    pub payload: Mutex<Value>,
    pub failing: AtomicBool,
    pub requests: Mutex<Vec<FetchRequest>>,
    pub delay: Mutex<Option<Duration>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeSource {
    pub fn with_rows(rows: Value) -> Arc<Self> {
        let source = Self::default();
        *source.payload.lock().unwrap() = serde_json::json!({ "rows": rows });
        Arc::new(source)
    }

    pub fn set_rows(&self, rows: Value) {
        *self.payload.lock().unwrap() = serde_json::json!({ "rows": rows });
    }

    pub fn fetch_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl DataSource for FakeSource {
    async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Network("connection reset by peer".to_string()));
        }
        Ok(self.payload.lock().unwrap().clone())
    }
}

/// Hands out the current script per transformer kind and counts calls.
pub struct FakeGenerator {
    pub ingestion_calls: AtomicUsize,
    pub chart_calls: AtomicUsize,
    pub failing: AtomicBool,
    pub ingestion_script: Mutex<String>,
    pub chart_script: Mutex<String>,
}

impl FakeGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ingestion_calls: AtomicUsize::new(0),
            chart_calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            ingestion_script: Mutex::new(INGEST_ROWS.to_string()),
            chart_script: Mutex::new(SUM_BY_DAY.to_string()),
        })
    }

    pub fn set_ingestion_script(&self, script: &str) {
        *self.ingestion_script.lock().unwrap() = script.to_string();
    }

    pub fn set_chart_script(&self, script: &str) {
        *self.chart_script.lock().unwrap() = script.to_string();
    }

    pub fn ingestion_calls(&self) -> usize {
        self.ingestion_calls.load(Ordering::SeqCst)
    }

    pub fn chart_calls(&self) -> usize {
        self.chart_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeGenerator for FakeGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> AppResult<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Generation("claude CLI exited with Some(1): overloaded".to_string()));
        }
        match prompt.kind {
            TransformerKind::Ingestion => {
                self.ingestion_calls.fetch_add(1, Ordering::SeqCst);
                Ok(self.ingestion_script.lock().unwrap().clone())
            }
            TransformerKind::Chart => {
                self.chart_calls.fetch_add(1, Ordering::SeqCst);
                Ok(self.chart_script.lock().unwrap().clone())
            }
        }
    }
}

pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub db: Arc<Database>,
    pub source: Arc<FakeSource>,
    pub generator: Arc<FakeGenerator>,
    pub pipeline: Arc<RefreshPipeline>,
    pub settings: PipelineSettings,
}

pub fn harness(source: Arc<FakeSource>) -> Harness {
    harness_with(source, PipelineSettings::default())
}

pub fn harness_with(source: Arc<FakeSource>, settings: PipelineSettings) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(Database::new(&dir.path().join("metrics.db")).expect("db"));
    let generator = FakeGenerator::new();
    let pipeline = Arc::new(RefreshPipeline::new(
        db.clone(),
        source.clone(),
        generator.clone(),
        &settings,
    ));
    Harness {
        _dir: dir,
        db,
        source,
        generator,
        pipeline,
        settings,
    }
}

pub fn integration_metric(db: &Database, template_id: &str) -> Metric {
    let template = find_template(template_id).expect("builtin template");
    db.insert_metric("org", "Events", "", Some("conn-1"), Some(template))
        .expect("insert metric")
}
