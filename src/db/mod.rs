use crate::errors::{AppError, AppResult};
use crate::models::{
    Cadence, ChartTransformer, DashboardChart, DataPoint, DataPointInput, GoalType, IngestionTransformer, Metric,
    MetricGoal, MetricTemplate, RefreshProgress, SaveGoalPayload, StepRecord, SyncMode, UpdateChartPayload,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const METRIC_COLUMNS: &str = "id, organization_id, name, description, integration_id, template_json,
    next_poll_at, last_fetched_at, refresh_status, last_error, sync_cursor, created_at, updated_at";

const CHART_COLUMNS: &str = "id, dashboard_id, metric_id, title, cadence, selected_dimension, user_prompt,
    chart_config_json, config_updated_at, created_at";

/// Replacement of a metric's stored points, applied in one transaction.
#[derive(Debug)]
pub struct IngestionCommit<'a> {
    pub metric_id: &'a str,
    pub run_id: &'a str,
    /// A freshly generated transformer that supersedes the cached one.
    pub transformer: Option<&'a IngestionTransformer>,
    pub mode: SyncMode,
    pub points: &'a [DataPointInput],
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Metrics ──────────────────────────────────────────────────────────────

    pub fn insert_metric(
        &self,
        organization_id: &str,
        name: &str,
        description: &str,
        integration_id: Option<&str>,
        template: Option<&MetricTemplate>,
    ) -> AppResult<Metric> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let poll_frequency = template
            .map(|template| template.poll_frequency)
            .unwrap_or(crate::models::PollFrequency::Manual);
        // Polled metrics are due immediately so the first poll fills them.
        let next_poll_at = poll_frequency.interval().map(|_| now);
        let template_json = template.map(serde_json::to_string).transpose()?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO metrics (id, organization_id, name, description, integration_id, template_json,
               poll_frequency, next_poll_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                organization_id,
                name,
                description,
                integration_id,
                template_json,
                poll_frequency.as_str(),
                next_poll_at.map(format_time),
                format_time(now),
            ],
        )?;

        Ok(Metric {
            id,
            organization_id: organization_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            integration_id: integration_id.map(ToString::to_string),
            template: template.cloned(),
            next_poll_at,
            last_fetched_at: None,
            refresh_status: None,
            last_error: None,
            sync_cursor: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_metric(&self, id: &str) -> AppResult<Option<Metric>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM metrics WHERE id = ?1", METRIC_COLUMNS),
            [id],
            parse_metric_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_metrics(&self, organization_id: &str) -> AppResult<Vec<Metric>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM metrics WHERE organization_id = ?1 ORDER BY name ASC",
            METRIC_COLUMNS
        ))?;
        let rows = stmt.query_map([organization_id], parse_metric_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_metric(&self, id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM metrics WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    /// Integration-backed, non-manual, idle metrics whose poll time has elapsed, oldest due first.
    pub fn find_due_metrics(&self, now: DateTime<Utc>, limit: usize) -> AppResult<Vec<Metric>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM metrics
             WHERE poll_frequency != 'manual'
               AND integration_id IS NOT NULL
               AND template_json IS NOT NULL
               AND refresh_status IS NULL
               AND (next_poll_at IS NULL OR next_poll_at <= ?1)
             ORDER BY COALESCE(next_poll_at, created_at) ASC, id ASC
             LIMIT ?2",
            METRIC_COLUMNS
        ))?;
        let rows = stmt.query_map(params![format_time(now), limit as i64], parse_metric_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn schedule_next_poll(&self, metric_id: &str, next_poll_at: DateTime<Utc>) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE metrics SET next_poll_at = ?1 WHERE id = ?2",
            params![format_time(next_poll_at), metric_id],
        )?;
        Ok(changed > 0)
    }

    // ─── Refresh lock ─────────────────────────────────────────────────────────

    /// Compare-and-swap on `refresh_status`. A lock older than `stale_before` is taken over.
    pub fn try_acquire_refresh_lock(
        &self,
        metric_id: &str,
        progress: &RefreshProgress,
        stale_before: DateTime<Utc>,
    ) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE metrics
             SET refresh_status = ?1, refresh_run_id = ?2, refresh_started_at = ?3, updated_at = ?3
             WHERE id = ?4
               AND (refresh_status IS NULL OR refresh_started_at IS NULL OR refresh_started_at < ?5)",
            params![
                serde_json::to_string(progress)?,
                progress.run_id,
                format_time(progress.started_at),
                metric_id,
                format_time(stale_before),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Returns false when the run no longer owns the lock.
    pub fn update_refresh_progress(&self, metric_id: &str, progress: &RefreshProgress) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE metrics SET refresh_status = ?1 WHERE id = ?2 AND refresh_run_id = ?3",
            params![serde_json::to_string(progress)?, metric_id, progress.run_id],
        )?;
        Ok(changed == 1)
    }

    pub fn release_refresh_lock(
        &self,
        metric_id: &str,
        run_id: &str,
        steps: &[StepRecord],
        error: Option<&str>,
        fetched_at: Option<DateTime<Utc>>,
    ) -> AppResult<bool> {
        let now = format_time(Utc::now());
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE metrics
             SET refresh_status = NULL, refresh_run_id = NULL, refresh_started_at = NULL,
                 last_error = ?1, last_run_steps_json = ?2,
                 last_fetched_at = COALESCE(?3, last_fetched_at), updated_at = ?4
             WHERE id = ?5 AND refresh_run_id = ?6",
            params![
                error,
                serde_json::to_string(steps)?,
                fetched_at.map(format_time),
                now,
                metric_id,
                run_id,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Clears locks left behind by a process that died mid-run.
    pub fn clear_orphan_refresh_locks(&self) -> AppResult<u64> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE metrics
             SET refresh_status = NULL, refresh_run_id = NULL, refresh_started_at = NULL,
                 last_error = 'Refresh interrupted by restart'
             WHERE refresh_status IS NOT NULL",
            [],
        )?;
        Ok(changed as u64)
    }

    pub fn get_last_run_steps(&self, metric_id: &str) -> AppResult<Vec<StepRecord>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_run_steps_json FROM metrics WHERE id = ?1",
                [metric_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw
            .and_then(|raw| serde_json::from_str::<Vec<StepRecord>>(&raw).ok())
            .unwrap_or_default())
    }

    // ─── Ingestion transformers and data points ───────────────────────────────

    pub fn get_ingestion_transformer(&self, metric_id: &str) -> AppResult<Option<IngestionTransformer>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, metric_id, code, input_fingerprint, input_shape, created_at
             FROM ingestion_transformers WHERE metric_id = ?1",
            [metric_id],
            |row| {
                Ok(IngestionTransformer {
                    id: row.get(0)?,
                    metric_id: row.get(1)?,
                    code: row.get(2)?,
                    input_fingerprint: row.get(3)?,
                    input_shape: row.get(4)?,
                    created_at: parse_time(&row.get::<_, String>(5)?)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Swaps the transformer, writes the points and advances the cursor atomically.
    /// Incremental mode drops points older than the stored cursor.
    pub fn commit_ingestion(&self, commit: &IngestionCommit<'_>) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let cursor: Option<Option<String>> = tx
            .query_row(
                "SELECT sync_cursor FROM metrics WHERE id = ?1 AND refresh_run_id = ?2",
                params![commit.metric_id, commit.run_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(cursor) = cursor else {
            return Err(AppError::NotFound(format!(
                "Metric {} was deleted or lost its refresh lock",
                commit.metric_id
            )));
        };

        if let Some(transformer) = commit.transformer {
            tx.execute(
                "DELETE FROM ingestion_transformers WHERE metric_id = ?1",
                [commit.metric_id],
            )?;
            tx.execute(
                "INSERT INTO ingestion_transformers (id, metric_id, code, input_fingerprint, input_shape, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    transformer.id,
                    commit.metric_id,
                    transformer.code,
                    transformer.input_fingerprint,
                    transformer.input_shape,
                    format_time(transformer.created_at),
                ],
            )?;
        }

        let floor = match commit.mode {
            SyncMode::Full => {
                tx.execute("DELETE FROM data_points WHERE metric_id = ?1", [commit.metric_id])?;
                None
            }
            SyncMode::Incremental => cursor.clone(),
        };

        let mut written = 0usize;
        let mut max_timestamp: Option<String> = None;
        {
            let mut insert = tx.prepare(
                "INSERT INTO data_points (metric_id, timestamp, value, dimension_key, dimensions_json, value_label)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(metric_id, timestamp, dimension_key) DO UPDATE SET
                   value = excluded.value,
                   dimensions_json = excluded.dimensions_json,
                   value_label = excluded.value_label",
            )?;
            for point in commit.points {
                let timestamp = format_time(point.timestamp);
                if let Some(floor) = &floor {
                    if timestamp.as_str() < floor.as_str() {
                        continue;
                    }
                }
                let dimensions_json = point
                    .dimensions
                    .as_ref()
                    .filter(|map| !map.is_empty())
                    .map(serde_json::to_string)
                    .transpose()?;
                insert.execute(params![
                    commit.metric_id,
                    timestamp,
                    point.value,
                    point.dimension_key(),
                    dimensions_json,
                    point.value_label,
                ])?;
                written += 1;
                if max_timestamp.as_deref().map_or(true, |current| timestamp.as_str() > current) {
                    max_timestamp = Some(timestamp);
                }
            }
        }

        let next_cursor = match commit.mode {
            SyncMode::Full => max_timestamp,
            SyncMode::Incremental => match (cursor, max_timestamp) {
                (Some(current), Some(candidate)) => Some(if candidate > current { candidate } else { current }),
                (current, candidate) => current.or(candidate),
            },
        };
        tx.execute(
            "UPDATE metrics SET sync_cursor = ?1, updated_at = ?2 WHERE id = ?3",
            params![next_cursor, format_time(Utc::now()), commit.metric_id],
        )?;

        tx.commit()?;
        Ok(written)
    }

    pub fn insert_data_point(&self, metric_id: &str, point: &DataPointInput) -> AppResult<DataPoint> {
        let timestamp = format_time(point.timestamp);
        let dimensions_json = point
            .dimensions
            .as_ref()
            .filter(|map| !map.is_empty())
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.lock()?;
        let id: i64 = conn.query_row(
            "INSERT INTO data_points (metric_id, timestamp, value, dimension_key, dimensions_json, value_label)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(metric_id, timestamp, dimension_key) DO UPDATE SET
               value = excluded.value, value_label = excluded.value_label
             RETURNING id",
            params![
                metric_id,
                timestamp,
                point.value,
                point.dimension_key(),
                dimensions_json,
                point.value_label,
            ],
            |row| row.get(0),
        )?;
        Ok(DataPoint {
            id,
            metric_id: metric_id.to_string(),
            timestamp: parse_time(&timestamp)?,
            value: point.value,
            dimensions: point.dimensions.clone().filter(|map| !map.is_empty()),
            value_label: point.value_label.clone(),
        })
    }

    pub fn list_data_points(&self, metric_id: &str) -> AppResult<Vec<DataPoint>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, metric_id, timestamp, value, dimensions_json, value_label
             FROM data_points WHERE metric_id = ?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map([metric_id], parse_data_point_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_data_points(&self, metric_id: &str) -> AppResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM data_points WHERE metric_id = ?1",
            [metric_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ─── Dashboard charts and chart transformers ──────────────────────────────

    pub fn insert_chart(
        &self,
        metric_id: &str,
        dashboard_id: &str,
        title: &str,
        cadence: Cadence,
        selected_dimension: Option<&str>,
        user_prompt: &str,
    ) -> AppResult<DashboardChart> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO dashboard_charts (id, dashboard_id, metric_id, title, cadence, selected_dimension, user_prompt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                dashboard_id,
                metric_id,
                title,
                cadence.as_str(),
                selected_dimension,
                user_prompt,
                format_time(now),
            ],
        )?;
        Ok(DashboardChart {
            id,
            dashboard_id: dashboard_id.to_string(),
            metric_id: metric_id.to_string(),
            title: title.to_string(),
            cadence,
            selected_dimension: selected_dimension.map(ToString::to_string),
            user_prompt: user_prompt.to_string(),
            chart_config: None,
            config_updated_at: None,
            created_at: now,
        })
    }

    pub fn update_chart(&self, payload: &UpdateChartPayload) -> AppResult<Option<DashboardChart>> {
        let Some(current) = self.get_chart(&payload.chart_id)? else {
            return Ok(None);
        };
        let title = payload.title.clone().unwrap_or(current.title);
        let cadence = payload.cadence.unwrap_or(current.cadence);
        let selected_dimension = match &payload.selected_dimension {
            Some(dimension) if dimension.trim().is_empty() => None,
            Some(dimension) => Some(dimension.trim().to_string()),
            None => current.selected_dimension,
        };
        let user_prompt = payload.user_prompt.clone().unwrap_or(current.user_prompt);

        {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE dashboard_charts SET title = ?1, cadence = ?2, selected_dimension = ?3, user_prompt = ?4
                 WHERE id = ?5",
                params![title, cadence.as_str(), selected_dimension, user_prompt, payload.chart_id],
            )?;
        }
        self.get_chart(&payload.chart_id)
    }

    pub fn get_chart(&self, chart_id: &str) -> AppResult<Option<DashboardChart>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM dashboard_charts WHERE id = ?1", CHART_COLUMNS),
            [chart_id],
            parse_chart_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_charts_for_metric(&self, metric_id: &str) -> AppResult<Vec<DashboardChart>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM dashboard_charts WHERE metric_id = ?1 ORDER BY created_at ASC, id ASC",
            CHART_COLUMNS
        ))?;
        let rows = stmt.query_map([metric_id], parse_chart_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_chart(&self, chart_id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM dashboard_charts WHERE id = ?1", [chart_id])?;
        Ok(changed > 0)
    }

    /// Cadence of the metric's oldest chart; goals inherit it.
    pub fn primary_chart_cadence(&self, metric_id: &str) -> AppResult<Option<Cadence>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT cadence FROM dashboard_charts WHERE metric_id = ?1 ORDER BY created_at ASC, id ASC LIMIT 1",
                [metric_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|raw| Cadence::parse(&raw)))
    }

    pub fn get_chart_transformer(&self, chart_id: &str) -> AppResult<Option<ChartTransformer>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, chart_id, code, input_fingerprint, cadence, selected_dimension, user_prompt, created_at
             FROM chart_transformers WHERE chart_id = ?1",
            [chart_id],
            |row| {
                Ok(ChartTransformer {
                    id: row.get(0)?,
                    chart_id: row.get(1)?,
                    code: row.get(2)?,
                    input_fingerprint: row.get(3)?,
                    cadence: parse_cadence(&row.get::<_, String>(4)?),
                    selected_dimension: row.get(5)?,
                    user_prompt: row.get(6)?,
                    created_at: parse_time(&row.get::<_, String>(7)?)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Swaps the chart transformer (when regenerated) and stores the rendered config in one transaction.
    pub fn commit_chart(
        &self,
        chart_id: &str,
        run_id: &str,
        transformer: Option<&ChartTransformer>,
        config: &serde_json::Value,
    ) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let owned: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM dashboard_charts c JOIN metrics m ON m.id = c.metric_id
                 WHERE c.id = ?1 AND m.refresh_run_id = ?2",
                params![chart_id, run_id],
                |row| row.get(0),
            )
            .optional()?;
        if owned.is_none() {
            return Err(AppError::NotFound(format!(
                "Chart {} was deleted or its metric lost the refresh lock",
                chart_id
            )));
        }

        if let Some(transformer) = transformer {
            tx.execute("DELETE FROM chart_transformers WHERE chart_id = ?1", [chart_id])?;
            tx.execute(
                "INSERT INTO chart_transformers (id, chart_id, code, input_fingerprint, cadence, selected_dimension, user_prompt, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    transformer.id,
                    chart_id,
                    transformer.code,
                    transformer.input_fingerprint,
                    transformer.cadence.as_str(),
                    transformer.selected_dimension,
                    transformer.user_prompt,
                    format_time(transformer.created_at),
                ],
            )?;
        }

        tx.execute(
            "UPDATE dashboard_charts SET chart_config_json = ?1, config_updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(config)?, format_time(Utc::now()), chart_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ─── Goals ────────────────────────────────────────────────────────────────

    pub fn save_goal(&self, payload: &SaveGoalPayload) -> AppResult<MetricGoal> {
        let now = Utc::now();
        let id = payload.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO metric_goals (id, metric_id, goal_type, target_value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
               goal_type = excluded.goal_type,
               target_value = excluded.target_value,
               updated_at = excluded.updated_at",
            params![
                id,
                payload.metric_id,
                payload.goal_type.as_str(),
                payload.target_value,
                format_time(now),
            ],
        )?;
        conn.query_row(
            "SELECT id, metric_id, goal_type, target_value, created_at, updated_at FROM metric_goals WHERE id = ?1",
            [&id],
            parse_goal_row,
        )
        .map_err(AppError::from)
    }

    pub fn get_goal(&self, goal_id: &str) -> AppResult<Option<MetricGoal>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, metric_id, goal_type, target_value, created_at, updated_at FROM metric_goals WHERE id = ?1",
            [goal_id],
            parse_goal_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_goals(&self, metric_id: &str) -> AppResult<Vec<MetricGoal>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, metric_id, goal_type, target_value, created_at, updated_at
             FROM metric_goals WHERE metric_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([metric_id], parse_goal_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_goal(&self, goal_id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM metric_goals WHERE id = ?1", [goal_id])?;
        Ok(changed > 0)
    }
}

/// Fixed-width millisecond UTC so that lexical order equals time order.
pub fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn parse_optional_time(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_time(&raw)).transpose()
}

fn parse_cadence(raw: &str) -> Cadence {
    Cadence::parse(raw).unwrap_or(Cadence::Daily)
}

fn parse_goal_type(raw: &str) -> GoalType {
    match raw {
        "RELATIVE" => GoalType::Relative,
        _ => GoalType::Absolute,
    }
}

fn parse_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Metric> {
    Ok(Metric {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        integration_id: row.get(4)?,
        template: row
            .get::<_, Option<String>>(5)?
            .and_then(|raw| serde_json::from_str::<MetricTemplate>(&raw).ok()),
        next_poll_at: parse_optional_time(row.get(6)?)?,
        last_fetched_at: parse_optional_time(row.get(7)?)?,
        // A lock whose progress cannot be read must not look idle.
        refresh_status: row
            .get::<_, Option<String>>(8)?
            .map(|raw| serde_json::from_str::<RefreshProgress>(&raw))
            .transpose()
            .map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(error))
            })?,
        last_error: row.get(9)?,
        sync_cursor: parse_optional_time(row.get(10)?)?,
        created_at: parse_time(&row.get::<_, String>(11)?)?,
        updated_at: parse_time(&row.get::<_, String>(12)?)?,
    })
}

fn parse_data_point_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataPoint> {
    Ok(DataPoint {
        id: row.get(0)?,
        metric_id: row.get(1)?,
        timestamp: parse_time(&row.get::<_, String>(2)?)?,
        value: row.get(3)?,
        dimensions: row
            .get::<_, Option<String>>(4)?
            .and_then(|raw| serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&raw).ok()),
        value_label: row.get(5)?,
    })
}

fn parse_chart_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DashboardChart> {
    Ok(DashboardChart {
        id: row.get(0)?,
        dashboard_id: row.get(1)?,
        metric_id: row.get(2)?,
        title: row.get(3)?,
        cadence: parse_cadence(&row.get::<_, String>(4)?),
        selected_dimension: row.get(5)?,
        user_prompt: row.get(6)?,
        chart_config: row
            .get::<_, Option<String>>(7)?
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok()),
        config_updated_at: parse_optional_time(row.get(8)?)?,
        created_at: parse_time(&row.get::<_, String>(9)?)?,
    })
}

fn parse_goal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricGoal> {
    Ok(MetricGoal {
        id: row.get(0)?,
        metric_id: row.get(1)?,
        goal_type: parse_goal_type(&row.get::<_, String>(2)?),
        target_value: row.get(3)?,
        created_at: parse_time(&row.get::<_, String>(4)?)?,
        updated_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{Database, IngestionCommit};
    use crate::models::{
        Cadence, DataKind, DataPointInput, IngestionTransformer, IntegrationKind, MetricTemplate, PollFrequency,
        RefreshProgress, SyncMode,
    };
    use chrono::{Duration, TimeZone, Utc};

    fn template() -> MetricTemplate {
        MetricTemplate {
            id: "github-commits".to_string(),
            name: "GitHub commits".to_string(),
            integration: IntegrationKind::Github,
            endpoint: serde_json::json!({ "path": "/repos/{owner}/{repo}/commits" }),
            poll_frequency: PollFrequency::Hourly,
            data_kind: DataKind::TimeSeries,
            description: String::new(),
        }
    }

    fn progress(run_id: &str) -> RefreshProgress {
        RefreshProgress {
            run_id: run_id.to_string(),
            started_at: Utc::now(),
            force_regenerate: false,
            current_step: None,
            current_chart_id: None,
            completed_steps: Vec::new(),
            total_steps: 9,
            percent: 0,
        }
    }

    fn point(day: u32, value: f64) -> DataPointInput {
        DataPointInput {
            timestamp: Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap(),
            value,
            dimensions: None,
            value_label: None,
        }
    }

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        (dir, db)
    }

    #[test]
    fn refresh_lock_is_exclusive_until_released() {
        let (_dir, db) = open();
        let metric = db
            .insert_metric("org", "Commits", "", Some("conn"), Some(&template()))
            .expect("insert metric");
        let stale_before = Utc::now() - Duration::minutes(30);

        assert!(db.try_acquire_refresh_lock(&metric.id, &progress("run-a"), stale_before).expect("acquire"));
        assert!(!db.try_acquire_refresh_lock(&metric.id, &progress("run-b"), stale_before).expect("second acquire"));

        assert!(db.release_refresh_lock(&metric.id, "run-a", &[], None, None).expect("release"));
        assert!(db.try_acquire_refresh_lock(&metric.id, &progress("run-b"), stale_before).expect("reacquire"));
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let (_dir, db) = open();
        let metric = db
            .insert_metric("org", "Commits", "", Some("conn"), Some(&template()))
            .expect("insert metric");
        let mut old = progress("run-old");
        old.started_at = Utc::now() - Duration::hours(2);
        assert!(db.try_acquire_refresh_lock(&metric.id, &old, Utc::now() - Duration::hours(3)).expect("acquire"));
        assert!(db
            .try_acquire_refresh_lock(&metric.id, &progress("run-new"), Utc::now() - Duration::hours(1))
            .expect("take over"));
        assert!(!db.release_refresh_lock(&metric.id, "run-old", &[], None, None).expect("old release"));
    }

    #[test]
    fn orphan_locks_are_cleared_with_an_error() {
        let (_dir, db) = open();
        let metric = db
            .insert_metric("org", "Commits", "", Some("conn"), Some(&template()))
            .expect("insert metric");
        assert!(db.try_acquire_refresh_lock(&metric.id, &progress("run"), Utc::now()).expect("acquire"));

        assert_eq!(db.clear_orphan_refresh_locks().expect("clear"), 1);
        let stored = db.get_metric(&metric.id).expect("get").expect("metric");
        assert!(stored.refresh_status.is_none());
        assert_eq!(stored.last_error.as_deref(), Some("Refresh interrupted by restart"));
        assert!(!db.update_refresh_progress(&metric.id, &progress("run")).expect("update"));
    }

    #[test]
    fn unreadable_refresh_status_is_an_error_until_cleared() {
        let (_dir, db) = open();
        let metric = db
            .insert_metric("org", "Commits", "", Some("conn"), Some(&template()))
            .expect("insert metric");
        db.lock()
            .expect("lock")
            .execute("UPDATE metrics SET refresh_status = '{\"runId\":' WHERE id = ?1", [&metric.id])
            .expect("corrupt");

        assert!(db.get_metric(&metric.id).is_err());
        assert!(db.find_due_metrics(Utc::now() + Duration::days(1), 10).expect("due").is_empty());

        assert_eq!(db.clear_orphan_refresh_locks().expect("clear"), 1);
        let stored = db.get_metric(&metric.id).expect("get").expect("metric");
        assert!(stored.refresh_status.is_none());
    }

    #[test]
    fn incremental_commit_never_writes_below_cursor() {
        let (_dir, db) = open();
        let metric = db
            .insert_metric("org", "Commits", "", Some("conn"), Some(&template()))
            .expect("insert metric");
        db.try_acquire_refresh_lock(&metric.id, &progress("run"), Utc::now())
            .expect("acquire");

        let first = [point(1, 1.0), point(2, 2.0), point(3, 3.0)];
        let written = db
            .commit_ingestion(&IngestionCommit {
                metric_id: &metric.id,
                run_id: "run",
                transformer: None,
                mode: SyncMode::Incremental,
                points: &first,
            })
            .expect("first commit");
        assert_eq!(written, 3);

        let second = [point(2, 20.0), point(3, 30.0), point(4, 4.0)];
        let written = db
            .commit_ingestion(&IngestionCommit {
                metric_id: &metric.id,
                run_id: "run",
                transformer: None,
                mode: SyncMode::Incremental,
                points: &second,
            })
            .expect("second commit");
        assert_eq!(written, 2);

        let stored = db.list_data_points(&metric.id).expect("list");
        let values: Vec<f64> = stored.iter().map(|point| point.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 30.0, 4.0]);

        let cursor = db.get_metric(&metric.id).expect("get").expect("exists").sync_cursor;
        assert_eq!(cursor, Some(Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 0).unwrap()));
    }

    #[test]
    fn full_commit_replaces_points_and_transformer() {
        let (_dir, db) = open();
        let metric = db
            .insert_metric("org", "Issues", "", Some("conn"), Some(&template()))
            .expect("insert metric");
        db.try_acquire_refresh_lock(&metric.id, &progress("run"), Utc::now())
            .expect("acquire");

        let transformer = IngestionTransformer {
            id: "t-1".to_string(),
            metric_id: metric.id.clone(),
            code: "[]".to_string(),
            input_fingerprint: "fp".to_string(),
            input_shape: String::new(),
            created_at: Utc::now(),
        };
        db.commit_ingestion(&IngestionCommit {
            metric_id: &metric.id,
            run_id: "run",
            transformer: Some(&transformer),
            mode: SyncMode::Full,
            points: &[point(1, 1.0), point(2, 2.0)],
        })
        .expect("first commit");

        let replacement = IngestionTransformer {
            id: "t-2".to_string(),
            ..transformer.clone()
        };
        db.commit_ingestion(&IngestionCommit {
            metric_id: &metric.id,
            run_id: "run",
            transformer: Some(&replacement),
            mode: SyncMode::Full,
            points: &[point(5, 5.0), point(5, 6.0)],
        })
        .expect("second commit");

        let stored = db.list_data_points(&metric.id).expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value, 6.0);
        let cached = db.get_ingestion_transformer(&metric.id).expect("get").expect("exists");
        assert_eq!(cached.id, "t-2");
    }

    #[test]
    fn commit_for_deleted_metric_aborts_cleanly() {
        let (_dir, db) = open();
        let metric = db
            .insert_metric("org", "Commits", "", Some("conn"), Some(&template()))
            .expect("insert metric");
        db.try_acquire_refresh_lock(&metric.id, &progress("run"), Utc::now())
            .expect("acquire");
        assert!(db.delete_metric(&metric.id).expect("delete"));

        let error = db
            .commit_ingestion(&IngestionCommit {
                metric_id: &metric.id,
                run_id: "run",
                transformer: None,
                mode: SyncMode::Full,
                points: &[point(1, 1.0)],
            })
            .expect_err("commit should fail");
        assert!(error.to_string().starts_with("NOT_FOUND"));
        assert_eq!(db.count_data_points(&metric.id).expect("count"), 0);
    }

    #[test]
    fn due_metrics_are_returned_oldest_first_and_skip_manual() {
        let (_dir, db) = open();
        let now = Utc::now();
        let first = db
            .insert_metric("org", "First", "", Some("conn"), Some(&template()))
            .expect("first");
        let second = db
            .insert_metric("org", "Second", "", Some("conn"), Some(&template()))
            .expect("second");
        db.insert_metric("org", "Manual", "", None, None).expect("manual");

        db.schedule_next_poll(&first.id, now - Duration::minutes(5)).expect("schedule");
        db.schedule_next_poll(&second.id, now - Duration::minutes(30)).expect("schedule");

        let due = db.find_due_metrics(now, 10).expect("due");
        let ids: Vec<&str> = due.iter().map(|metric| metric.id.as_str()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);

        let limited = db.find_due_metrics(now, 1).expect("limited");
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, second.id);
    }

    #[test]
    fn chart_update_clears_dimension_with_empty_string() {
        let (_dir, db) = open();
        let metric = db.insert_metric("org", "Manual", "", None, None).expect("metric");
        let chart = db
            .insert_chart(&metric.id, "dash", "Views", Cadence::Weekly, Some("country"), "bar chart")
            .expect("chart");
        let updated = db
            .update_chart(&crate::models::UpdateChartPayload {
                chart_id: chart.id.clone(),
                selected_dimension: Some(String::new()),
                cadence: Some(Cadence::Monthly),
                ..Default::default()
            })
            .expect("update")
            .expect("exists");
        assert_eq!(updated.selected_dimension, None);
        assert_eq!(updated.cadence, Cadence::Monthly);
        assert_eq!(updated.user_prompt, "bar chart");
        assert_eq!(db.primary_chart_cadence(&metric.id).expect("cadence"), Some(Cadence::Monthly));
    }
}
