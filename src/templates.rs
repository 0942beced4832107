use crate::models::{DataKind, IntegrationKind, MetricTemplate, PollFrequency};
use once_cell::sync::Lazy;
use serde_json::json;

/// Templates shipped with the binary. A metric stores its own copy, so edits here
/// never change existing metrics.
pub static BUILTIN_TEMPLATES: Lazy<Vec<MetricTemplate>> = Lazy::new(|| {
    vec![
        MetricTemplate {
            id: "github-commits".to_string(),
            name: "GitHub commits".to_string(),
            integration: IntegrationKind::Github,
            endpoint: json!({ "path": "/repos/{owner}/{repo}/commits", "method": "GET", "paginate": true }),
            poll_frequency: PollFrequency::Hourly,
            data_kind: DataKind::TimeSeries,
            description: "Commits per day on the default branch".to_string(),
        },
        MetricTemplate {
            id: "github-open-issues".to_string(),
            name: "GitHub open issues".to_string(),
            integration: IntegrationKind::Github,
            endpoint: json!({ "path": "/repos/{owner}/{repo}/issues", "method": "GET", "query": { "state": "open" } }),
            poll_frequency: PollFrequency::Daily,
            data_kind: DataKind::Snapshot,
            description: "Current open issue count, grouped by label".to_string(),
        },
        MetricTemplate {
            id: "posthog-events".to_string(),
            name: "PostHog events".to_string(),
            integration: IntegrationKind::Posthog,
            endpoint: json!({ "path": "/api/projects/{project_id}/insights/trend", "method": "GET", "interval": "day" }),
            poll_frequency: PollFrequency::FifteenMinutes,
            data_kind: DataKind::TimeSeries,
            description: "Daily count of a tracked event".to_string(),
        },
        MetricTemplate {
            id: "google-sheets-column".to_string(),
            name: "Google Sheets column".to_string(),
            integration: IntegrationKind::GoogleSheets,
            endpoint: json!({ "path": "/v4/spreadsheets/{spreadsheet_id}/values/{range}", "method": "GET" }),
            poll_frequency: PollFrequency::Daily,
            data_kind: DataKind::Snapshot,
            description: "A date column and a value column read from a sheet range".to_string(),
        },
        MetricTemplate {
            id: "youtube-views".to_string(),
            name: "YouTube channel views".to_string(),
            integration: IntegrationKind::Youtube,
            endpoint: json!({ "path": "/v2/reports", "method": "GET", "metrics": "views", "dimensions": "day" }),
            poll_frequency: PollFrequency::Daily,
            data_kind: DataKind::TimeSeries,
            description: "Daily channel views".to_string(),
        },
    ]
});

pub fn find_template(id: &str) -> Option<&'static MetricTemplate> {
    BUILTIN_TEMPLATES.iter().find(|template| template.id == id)
}

#[cfg(test)]
mod tests {
    use super::{find_template, BUILTIN_TEMPLATES};
    use crate::models::DataKind;
    use std::collections::HashSet;

    #[test]
    fn template_ids_are_unique() {
        let ids = BUILTIN_TEMPLATES.iter().map(|template| template.id.as_str()).collect::<HashSet<_>>();
        assert_eq!(ids.len(), BUILTIN_TEMPLATES.len());
    }

    #[test]
    fn open_issues_is_a_snapshot() {
        let template = find_template("github-open-issues").expect("template");
        assert_eq!(template.data_kind, DataKind::Snapshot);
        assert!(find_template("missing").is_none());
    }
}
