mod common;

use chrono::{Duration, Utc};
use common::{harness, harness_with, integration_metric, FakeSource};
use metric_refresh::config::PipelineSettings;
use metric_refresh::models::{PipelineStep, RefreshProgress};
use metric_refresh::scheduler::MetricPoller;
use serde_json::json;
use std::sync::atomic::Ordering;

fn rows() -> serde_json::Value {
    json!([{ "day": "2026-03-01", "n": 1 }])
}

#[tokio::test]
async fn polls_due_metrics_and_reschedules_them() {
    let h = harness(FakeSource::with_rows(rows()));
    let polled = integration_metric(&h.db, "posthog-events");
    let manual = h.db.insert_metric("org", "Manual", "", None, None).expect("manual");
    let poller = MetricPoller::new(h.pipeline.clone(), &h.settings);

    let now = Utc::now() + Duration::seconds(1);
    let summary = poller.poll_at(now).await.expect("poll");
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);

    let stored = h.db.get_metric(&polled.id).expect("get").expect("metric");
    let next = stored.next_poll_at.expect("next poll");
    assert!(next >= now + Duration::minutes(15) - Duration::seconds(1));
    assert!(stored.last_fetched_at.is_some());
    assert!(h.db.get_metric(&manual.id).expect("get").expect("metric").next_poll_at.is_none());

    let again = poller.poll_at(now).await.expect("poll");
    assert_eq!(again.attempted, 0);
}

#[tokio::test]
async fn failing_metric_is_still_rescheduled() {
    let h = harness(FakeSource::with_rows(rows()));
    h.source.failing.store(true, Ordering::SeqCst);
    let metric = integration_metric(&h.db, "youtube-views");
    let poller = MetricPoller::new(h.pipeline.clone(), &h.settings);

    let now = Utc::now() + Duration::seconds(1);
    let summary = poller.poll_at(now).await.expect("poll");
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.failed, 1);

    let stored = h.db.get_metric(&metric.id).expect("get").expect("metric");
    assert!(stored.next_poll_at.expect("next") > now + Duration::hours(23));
    assert!(stored.last_error.unwrap_or_default().starts_with("FETCH_FAILED"));
}

#[tokio::test]
async fn locked_metrics_are_not_picked_up() {
    let h = harness(FakeSource::with_rows(rows()));
    let metric = integration_metric(&h.db, "posthog-events");
    let progress = RefreshProgress {
        run_id: "manual-run".to_string(),
        started_at: Utc::now(),
        force_regenerate: true,
        current_step: Some(PipelineStep::GeneratingIngestionTransformer),
        current_chart_id: None,
        completed_steps: vec![],
        total_steps: 6,
        percent: 16,
    };
    assert!(h
        .db
        .try_acquire_refresh_lock(&metric.id, &progress, Utc::now() - Duration::minutes(30))
        .expect("lock"));

    let poller = MetricPoller::new(h.pipeline.clone(), &h.settings);
    let summary = poller.poll_at(Utc::now() + Duration::seconds(1)).await.expect("poll");
    assert_eq!(summary.attempted, 0);
    assert_eq!(h.source.fetch_count(), 0);
}

#[tokio::test]
async fn batch_respects_size_and_concurrency_limits() {
    let source = FakeSource::with_rows(rows());
    *source.delay.lock().unwrap() = Some(std::time::Duration::from_millis(50));
    let settings = PipelineSettings {
        poll_batch_size: 4,
        max_concurrent_refreshes: 2,
        ..PipelineSettings::default()
    };
    let h = harness_with(source, settings);
    for _ in 0..6 {
        integration_metric(&h.db, "posthog-events");
    }
    let poller = MetricPoller::new(h.pipeline.clone(), &h.settings);

    let now = Utc::now() + Duration::seconds(1);
    let summary = poller.poll_at(now).await.expect("poll");
    assert_eq!(summary.attempted, 4);
    assert_eq!(summary.succeeded, 4);
    assert!(h.source.max_in_flight.load(Ordering::SeqCst) <= 2);

    let rest = poller.poll_at(now).await.expect("poll");
    assert_eq!(rest.attempted, 2);
}
