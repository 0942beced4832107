use crate::models::{Cadence, DataPoint, GoalProgress, GoalStatus, GoalType, MetricGoal, Trend};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use std::collections::BTreeMap;

const EPSILON: f64 = 1e-9;
/// `at_risk` needs at least this share of the period gone...
const AT_RISK_MIN_ELAPSED_PERCENT: f64 = 60.0;
/// ...and progress trailing elapsed time by at least this many points.
const AT_RISK_GAP_PERCENT: f64 = 25.0;

/// Start (inclusive) and end (exclusive) of the UTC period containing `now`.
pub fn period_bounds(cadence: Cadence, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let (start, end) = match cadence {
        Cadence::Daily => (today, today + Duration::days(1)),
        Cadence::Weekly => {
            let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
            (monday, monday + Duration::days(7))
        }
        Cadence::Monthly => {
            let first = first_of_month(today.year(), today.month()).unwrap_or(today);
            let next = if today.month() == 12 {
                first_of_month(today.year() + 1, 1)
            } else {
                first_of_month(today.year(), today.month() + 1)
            }
            .unwrap_or(first + Duration::days(31));
            (first, next)
        }
    };
    (midnight(start), midnight(end))
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Evaluates a goal against the metric's points at `now`. Pure; recomputed on every read.
pub fn calculate_goal_progress(
    goal: &MetricGoal,
    cadence: Cadence,
    points: &[DataPoint],
    now: DateTime<Utc>,
) -> GoalProgress {
    let (period_start, period_end) = period_bounds(cadence, now);
    let period_seconds = (period_end - period_start).num_seconds().max(1) as f64;
    let elapsed_seconds = (now - period_start).num_seconds().clamp(0, period_seconds as i64) as f64;
    let elapsed_fraction = elapsed_seconds / period_seconds;
    let time_elapsed_percent = elapsed_fraction * 100.0;

    let remaining = (period_end - now).max(Duration::zero());
    let days_elapsed = (now - period_start).num_days().max(0);
    let days_remaining = remaining.num_days();
    let hours_remaining = remaining.num_hours();

    let mut report = GoalProgress {
        goal_id: goal.id.clone(),
        metric_id: goal.metric_id.clone(),
        goal_type: goal.goal_type,
        cadence,
        period_start,
        period_end,
        target_value: goal.target_value,
        baseline_value: None,
        current_value: None,
        target_display_value: None,
        progress_percent: None,
        display_percent: None,
        time_elapsed_percent,
        days_elapsed,
        days_remaining,
        hours_remaining,
        trend: None,
        projected_end_value: None,
        status: GoalStatus::NoData,
        last_data_point_at: None,
    };

    // Points sharing a timestamp (one per dimension value) are summed.
    let mut totals: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
    for point in points.iter().filter(|point| point.value.is_finite()) {
        *totals.entry(point.timestamp).or_insert(0.0) += point.value;
    }

    let Some((&last_at, &current)) = totals.range(..=now).next_back() else {
        return report;
    };
    let baseline = totals
        .range(..=period_start)
        .next_back()
        .map(|(_, value)| *value)
        .unwrap_or(0.0);

    let target = match goal.goal_type {
        GoalType::Absolute => goal.target_value,
        GoalType::Relative => baseline * (1.0 + goal.target_value / 100.0),
    };

    report.baseline_value = Some(baseline);
    report.current_value = Some(current);
    report.target_display_value = Some(target);
    report.last_data_point_at = Some(last_at);
    report.trend = Some(trend(current - baseline));
    report.projected_end_value = Some(if elapsed_fraction > 0.0 {
        baseline + (current - baseline) / elapsed_fraction
    } else {
        current
    });

    if (target - baseline).abs() < EPSILON {
        report.status = GoalStatus::InvalidBaseline;
        return report;
    }

    let progress = (current - baseline) / (target - baseline) * 100.0;
    report.progress_percent = Some(progress);
    report.display_percent = Some(progress.clamp(0.0, 100.0));
    report.status = classify(progress, time_elapsed_percent);
    report
}

fn trend(delta: f64) -> Trend {
    if delta > EPSILON {
        Trend::Up
    } else if delta < -EPSILON {
        Trend::Down
    } else {
        Trend::Flat
    }
}

/// First match wins. For a fixed elapsed time the result never gets worse as progress rises.
pub fn classify(progress_percent: f64, time_elapsed_percent: f64) -> GoalStatus {
    if progress_percent >= 100.0 {
        GoalStatus::Exceeded
    } else if progress_percent >= time_elapsed_percent {
        GoalStatus::OnTrack
    } else if time_elapsed_percent >= AT_RISK_MIN_ELAPSED_PERCENT
        && time_elapsed_percent - progress_percent >= AT_RISK_GAP_PERCENT
    {
        GoalStatus::AtRisk
    } else {
        GoalStatus::Behind
    }
}
