use crate::config::PipelineSettings;
use crate::errors::AppResult;
use crate::models::{Metric, PollSummary, RefreshRequest, RefreshResult};
use crate::pipeline::{RefreshPipeline, REFRESH_IN_PROGRESS};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::Duration;

enum RunOutcome {
    Succeeded,
    Failed,
    Busy,
}

impl From<&RefreshResult> for RunOutcome {
    fn from(result: &RefreshResult) -> Self {
        if result.success {
            Self::Succeeded
        } else if result.error.as_deref() == Some(REFRESH_IN_PROGRESS) {
            Self::Busy
        } else {
            Self::Failed
        }
    }
}

/// Background poller. Each tick refreshes a batch of due metrics through the same
/// pipeline entry point manual refreshes use, with at most `max_concurrent` in flight.
#[derive(Clone)]
pub struct MetricPoller {
    pipeline: Arc<RefreshPipeline>,
    running: Arc<Mutex<usize>>,
    slot_freed: Arc<Notify>,
    interval: Duration,
    batch_size: usize,
    max_concurrent: usize,
}

impl MetricPoller {
    pub fn new(pipeline: Arc<RefreshPipeline>, settings: &PipelineSettings) -> Self {
        Self {
            pipeline,
            running: Arc::new(Mutex::new(0)),
            slot_freed: Arc::new(Notify::new()),
            interval: Duration::from_secs(settings.poll_interval_seconds.max(1)),
            batch_size: settings.poll_batch_size.max(1),
            max_concurrent: settings.max_concurrent_refreshes.max(1),
        }
    }

    pub fn start(&self) {
        let poller = self.clone();
        tokio::spawn(async move {
            poller.run_loop().await;
        });
    }

    async fn run_loop(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(error) = self.poll_once().await {
                tracing::error!(error = %error, "metric poll failed");
            }
        }
    }

    /// Refreshes every due metric in one batch, oldest due first. `next_poll_at` moves
    /// forward whatever the outcome so a failing metric does not monopolize the batch.
    pub async fn poll_once(&self) -> AppResult<PollSummary> {
        self.poll_at(Utc::now()).await
    }

    pub async fn poll_at(&self, now: DateTime<Utc>) -> AppResult<PollSummary> {
        let due = self.pipeline.database().find_due_metrics(now, self.batch_size)?;
        let mut summary = PollSummary {
            attempted: due.len(),
            ..PollSummary::default()
        };
        if due.is_empty() {
            tracing::debug!("no metrics due for polling");
            return Ok(summary);
        }

        let mut tasks = JoinSet::new();
        for metric in due {
            self.reserve_slot().await;
            let poller = self.clone();
            tasks.spawn(async move {
                let outcome = poller.refresh(&metric, now).await;
                poller.release_slot().await;
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(RunOutcome::Succeeded) => summary.succeeded += 1,
                Ok(RunOutcome::Failed) => summary.failed += 1,
                Ok(RunOutcome::Busy) => summary.skipped_busy += 1,
                Err(error) => {
                    tracing::error!(error = %error, "poll task panicked");
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped_busy = summary.skipped_busy,
            "metric poll finished"
        );
        Ok(summary)
    }

    async fn refresh(&self, metric: &Metric, now: DateTime<Utc>) -> RunOutcome {
        let result = self
            .pipeline
            .refresh_metric_and_charts(RefreshRequest {
                metric_id: metric.id.clone(),
                force_regenerate: false,
            })
            .await;
        let outcome = RunOutcome::from(&result);

        if let Some(interval) = metric.poll_frequency().interval() {
            if let Err(error) = self.pipeline.database().schedule_next_poll(&metric.id, now + interval) {
                tracing::warn!(metric_id = %metric.id, error = %error, "failed to schedule next poll");
            }
        }
        if let RunOutcome::Failed = outcome {
            tracing::warn!(
                metric_id = %metric.id,
                error = result.error.as_deref().unwrap_or(""),
                "polled refresh failed"
            );
        }
        outcome
    }

    async fn reserve_slot(&self) {
        loop {
            let notified = self.slot_freed.notified();
            {
                let mut running = self.running.lock().await;
                if *running < self.max_concurrent {
                    *running += 1;
                    return;
                }
            }
            notified.await;
        }
    }

    async fn release_slot(&self) {
        {
            let mut running = self.running.lock().await;
            if *running > 0 {
                *running -= 1;
            }
        }
        self.slot_freed.notify_one();
    }
}
