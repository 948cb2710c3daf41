//! Metric catalog loaded from YAML.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::ConfigError;

/// One metric specification.
#[derive(Debug, Clone, Deserialize)]
pub struct Metric {
    /// Human label.
    pub name: String,
    #[serde(default)]
    pub desc: String,
    /// Comma-list of period codes (`h,d,w,m,q,y`).
    pub periods: String,
    /// Output series name, or the label-driven fan-out base.
    pub series_name_or_func: String,
    /// Query template; `sqls` fans one metric out over several queries.
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub sqls: Option<Vec<String>>,
    /// Comma-list of aggregation multipliers; empty means `1`.
    #[serde(default)]
    pub aggregate: Option<String>,
    /// Distribution over labels at one `(time, period)` instead of a
    /// time series.
    #[serde(default)]
    pub histogram: bool,
    /// Rows carry several value columns on one point.
    #[serde(default)]
    pub multi_value: bool,
    /// Normalize the label used as the point's `name` field.
    #[serde(default)]
    pub escape_value_name: bool,
    /// Keep the raw label as the series name instead of normalizing.
    #[serde(default)]
    pub skip_escape_series_name: bool,
    /// Use the named quick ranges as the period set.
    #[serde(default)]
    pub annotations_ranges: bool,
    /// Write into a merged table of this name instead of per-series tables.
    #[serde(default)]
    pub merge_series: Option<String>,
    /// Query returns `(series, period, …)` tuples driving its own output.
    #[serde(default)]
    pub custom_data: bool,
    /// Lower bound override for the recompute window.
    #[serde(default)]
    pub start_from: Option<DateTime<Utc>>,
    /// Restrict the window to the trailing N hours.
    #[serde(default)]
    pub last_hours: Option<i64>,
    /// Comma-list of `period` or `period:aggregate` combinations to skip.
    #[serde(default)]
    pub skip: Option<String>,
    /// Series names wiped before this metric's first run in reset mode.
    #[serde(default)]
    pub drop: Option<String>,
    /// Comma-list of projects; `!name` excludes.
    #[serde(default)]
    pub project: Option<String>,
    /// Bypass the recompute schedule.
    #[serde(default)]
    pub always_recalc: bool,
    /// A failing query degrades to a warning.
    #[serde(default)]
    pub allow_fail: bool,
    /// Cooldown seconds applied once per batch after a tolerated failure.
    #[serde(default)]
    pub wait_after_fail: u64,
    /// Value columns are HyperLogLog sketches.
    #[serde(default)]
    pub hll: bool,
    /// Per-metric environment overrides (overlay grammar applies).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Metric {
    /// All query templates, whether given as `sql` or `sqls`.
    pub fn queries(&self) -> Vec<&str> {
        match (&self.sql, &self.sqls) {
            (_, Some(sqls)) if !sqls.is_empty() => sqls.iter().map(|s| s.as_str()).collect(),
            (Some(sql), _) => vec![sql.as_str()],
            _ => Vec::new(),
        }
    }

    /// `(period, aggregate)` combinations, honoring the skip list.
    pub fn period_combinations(&self) -> Vec<(String, u32)> {
        let aggregates: Vec<u32> = self
            .aggregate
            .as_deref()
            .map(|a| {
                a.split(',')
                    .filter_map(|n| n.trim().parse().ok())
                    .filter(|n| *n >= 1)
                    .collect()
            })
            .filter(|v: &Vec<u32>| !v.is_empty())
            .unwrap_or_else(|| vec![1]);

        let skips: Vec<(String, u32)> = self
            .skip
            .as_deref()
            .map(|s| {
                s.split(',')
                    .filter(|item| !item.trim().is_empty())
                    .map(|item| {
                        let item = item.trim();
                        match item.split_once(':') {
                            Some((period, agg)) => {
                                (period.to_string(), agg.parse().unwrap_or(1))
                            }
                            None => (item.to_string(), 1),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut out = Vec::new();
        for period in self.periods.split(',') {
            let period = period.trim();
            if period.is_empty() {
                continue;
            }
            for agg in &aggregates {
                let combo = (period.to_string(), *agg);
                if !skips.contains(&combo) {
                    out.push(combo);
                }
            }
        }
        out
    }

    /// Combined period code for a `(period, aggregate)` pair: `d` with
    /// aggregate 7 samples daily but aggregates a week, code `d7`.
    pub fn combined_code(period: &str, aggregate: u32) -> String {
        if aggregate <= 1 {
            period.to_string()
        } else {
            format!("{period}{aggregate}")
        }
    }

    /// Whether the metric runs for a project, honoring `!` exclusions.
    pub fn runs_for_project(&self, project: &str) -> bool {
        let Some(spec) = self.project.as_deref().filter(|s| !s.is_empty()) else {
            return true;
        };
        let mut allowed_any = false;
        let mut has_allow_list = false;
        for item in spec.split(',') {
            let item = item.trim();
            if let Some(excluded) = item.strip_prefix('!') {
                if excluded == project {
                    return false;
                }
            } else if !item.is_empty() {
                has_allow_list = true;
                if item == project {
                    allowed_any = true;
                }
            }
        }
        !has_allow_list || allowed_any
    }

    /// Series names listed in `drop`.
    pub fn drop_series(&self) -> Vec<String> {
        self.drop
            .as_deref()
            .map(|d| {
                d.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The full metric catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub metrics: Vec<Metric>,
}

impl MetricsConfig {
    /// Loads the catalog from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(yaml: &str) -> Metric {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_minimal_metric() {
        let m = metric(
            "name: PRs merged\nperiods: d,w\nseries_name_or_func: prs_merged\nsql: select 1",
        );
        assert_eq!(m.queries(), vec!["select 1"]);
        assert_eq!(
            m.period_combinations(),
            vec![
                ("d".to_string(), 1),
                ("w".to_string(), 1)
            ]
        );
        assert!(!m.histogram);
        assert!(m.runs_for_project("anything"));
    }

    #[test]
    fn test_aggregate_cross_product() {
        let m = metric(
            "name: x\nperiods: d,w\nseries_name_or_func: s\nsql: q\naggregate: 1,7",
        );
        assert_eq!(
            m.period_combinations(),
            vec![
                ("d".to_string(), 1),
                ("d".to_string(), 7),
                ("w".to_string(), 1),
                ("w".to_string(), 7)
            ]
        );
        assert_eq!(Metric::combined_code("d", 7), "d7");
        assert_eq!(Metric::combined_code("d", 1), "d");
    }

    #[test]
    fn test_skip_combinations() {
        let m = metric(
            "name: x\nperiods: d,w\nseries_name_or_func: s\nsql: q\naggregate: 1,7\nskip: \"w:7,d\"",
        );
        assert_eq!(
            m.period_combinations(),
            vec![("d".to_string(), 7), ("w".to_string(), 1)]
        );
    }

    #[test]
    fn test_project_allow_deny() {
        let m = metric(
            "name: x\nperiods: d\nseries_name_or_func: s\nsql: q\nproject: \"kubernetes,!prometheus\"",
        );
        assert!(m.runs_for_project("kubernetes"));
        assert!(!m.runs_for_project("prometheus"));
        assert!(!m.runs_for_project("etcd"));

        let m = metric(
            "name: x\nperiods: d\nseries_name_or_func: s\nsql: q\nproject: \"!prometheus\"",
        );
        assert!(m.runs_for_project("kubernetes"));
        assert!(!m.runs_for_project("prometheus"));
    }

    #[test]
    fn test_sqls_fan_out() {
        let m = metric(
            "name: x\nperiods: d\nseries_name_or_func: s\nsqls:\n  - q1\n  - q2",
        );
        assert_eq!(m.queries(), vec!["q1", "q2"]);
    }

    #[test]
    fn test_drop_series_list() {
        let m = metric(
            "name: x\nperiods: d\nseries_name_or_func: s\nsql: q\ndrop: \"sold_series, sother\"",
        );
        assert_eq!(m.drop_series(), vec!["sold_series", "sother"]);
    }

    #[test]
    fn test_catalog_parse() {
        let config: MetricsConfig = serde_yaml::from_str(
            r#"
metrics:
  - name: Events
    periods: h,d
    series_name_or_func: events
    sql: select count(*) from gha_events where {{period:created_at}}
  - name: Company histogram
    periods: d7
    series_name_or_func: company_activity
    sql: select company, count(*) from x group by company
    histogram: true
    allow_fail: true
    wait_after_fail: 30
"#,
        )
        .unwrap();
        assert_eq!(config.metrics.len(), 2);
        assert!(config.metrics[1].histogram);
        assert_eq!(config.metrics[1].wait_after_fail, 30);
    }
}
