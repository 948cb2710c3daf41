//! SQL query templating.
//!
//! Metric templates reference the time window through tags:
//! - `{{period:col}}` expands to a relative condition
//!   `(col >= now() - 'period'::interval)` in interval mode, or an
//!   absolute `(col >= 'from' and col < 'to')` in range mode
//! - `{{from}}` / `{{to}}` expand to the corresponding bound expressions
//! - `{{exclude_bots}}` expands to the project's bot-exclusion fragment
//!
//! Expansion also computes `hours`, the window length in fractional hours
//! formatted with six decimals, so metrics can scale by window size.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Default bot-exclusion fragment; projects can override through
/// configuration.
pub const EXCLUDE_BOTS: &str = "(lower(dup_actor_login) not similar to '%(bot|robot|jenkins|-ci|travis|deploy)%')";

/// Window context for one expansion.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// Relative window, e.g. `7 days`. Interval mode when set.
    pub period: Option<String>,
    /// Absolute window start. Range mode when both bounds are set.
    pub from: Option<DateTime<Utc>>,
    /// Absolute window end (exclusive).
    pub to: Option<DateTime<Utc>>,
    /// Bot-exclusion fragment; defaults to [`EXCLUDE_BOTS`].
    pub exclude_bots: Option<String>,
}

impl TemplateContext {
    /// Interval-mode context.
    pub fn interval(period: &str) -> Self {
        Self {
            period: Some(period.to_string()),
            ..Default::default()
        }
    }

    /// Range-mode context.
    pub fn range(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Default::default()
        }
    }
}

fn period_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{period:([^}]+)\}\}").expect("static regex"))
}

/// Parses an interval literal like `7 days` into fractional hours.
fn interval_hours(interval: &str) -> Option<f64> {
    let mut parts = interval.split_whitespace();
    let n: f64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?.trim_end_matches('s');
    let unit_hours = match unit {
        "hour" => 1.0,
        "day" => 24.0,
        "week" => 168.0,
        "month" => 730.5,
        "quarter" => 2191.5,
        "year" => 8766.0,
        _ => return None,
    };
    Some(n * unit_hours)
}

fn pg_timestamp(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Expands a template and returns `(sql, hours)`.
///
/// With neither a period nor a from/to range, the result is an
/// explanatory error string and hours `"0"`, so queries built from it
/// fail loudly instead of silently scanning everything.
pub fn expand(sql: &str, ctx: &TemplateContext) -> (String, String) {
    let range_mode = ctx.from.is_some() && ctx.to.is_some();
    let interval_mode = ctx.period.as_deref().map(|p| !p.is_empty()).unwrap_or(false);
    if !range_mode && !interval_mode {
        return (
            "template error: no period and no from/to range provided".to_string(),
            "0".to_string(),
        );
    }

    enum Window {
        Interval(String),
        Range(String, String),
    }

    let (window, from_expr, to_expr, hours) = if interval_mode {
        let period = ctx.period.clone().unwrap_or_default();
        let hours = interval_hours(&period).unwrap_or(0.0);
        (
            Window::Interval(period.clone()),
            format!("(now() - '{period}'::interval)"),
            "(now())".to_string(),
            hours,
        )
    } else {
        let from = ctx.from.expect("range mode");
        let to = ctx.to.expect("range mode");
        let from_literal = pg_timestamp(from);
        let to_literal = pg_timestamp(to);
        let hours = (to - from).num_seconds() as f64 / 3600.0;
        (
            Window::Range(from_literal.clone(), to_literal.clone()),
            format!("'{from_literal}'"),
            format!("'{to_literal}'"),
            hours,
        )
    };

    let mut out = period_tag_regex()
        .replace_all(sql, |caps: &regex::Captures<'_>| {
            let col = &caps[1];
            match &window {
                Window::Interval(period) => {
                    format!(" ({col} >= now() - '{period}'::interval) ")
                }
                Window::Range(from, to) => {
                    format!(" ({col} >= '{from}' and {col} < '{to}') ")
                }
            }
        })
        .to_string();
    out = out.replace("{{from}}", &from_expr);
    out = out.replace("{{to}}", &to_expr);
    out = out.replace(
        "{{exclude_bots}}",
        ctx.exclude_bots.as_deref().unwrap_or(EXCLUDE_BOTS),
    );

    (out, format!("{hours:.6}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_interval_expansion() {
        let (sql, hours) = expand(
            "count where {{period:e.created_at}}",
            &TemplateContext::interval("7 days"),
        );
        assert_eq!(
            sql,
            "count where  (e.created_at >= now() - '7 days'::interval) "
        );
        assert_eq!(hours, "168.000000");
    }

    #[test]
    fn test_range_expansion() {
        let from = Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2020, 3, 2, 0, 0, 0).unwrap();
        let (sql, hours) = expand(
            "select count(*) from gha_events where {{period:created_at}}",
            &TemplateContext::range(from, to),
        );
        assert_eq!(
            sql,
            "select count(*) from gha_events where  (created_at >= '2020-03-01 00:00:00' \
             and created_at < '2020-03-02 00:00:00') "
        );
        assert_eq!(hours, "24.000000");
    }

    #[test]
    fn test_from_to_tags() {
        let from = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2020, 1, 1, 6, 0, 0).unwrap();
        let (sql, hours) = expand("between {{from}} and {{to}}", &TemplateContext::range(from, to));
        assert_eq!(sql, "between '2020-01-01 00:00:00' and '2020-01-01 06:00:00'");
        assert_eq!(hours, "6.000000");

        let (sql, _) = expand("since {{from}}", &TemplateContext::interval("1 week"));
        assert_eq!(sql, "since (now() - '1 week'::interval)");
    }

    #[test]
    fn test_empty_window_is_error_string() {
        let (sql, hours) = expand("select 1 where {{period:x}}", &TemplateContext::default());
        assert!(sql.starts_with("template error"));
        assert_eq!(hours, "0");
    }

    #[test]
    fn test_multiple_period_tags() {
        let (sql, _) = expand(
            "{{period:a.created_at}} and {{period:b.created_at}}",
            &TemplateContext::interval("1 day"),
        );
        assert_eq!(
            sql,
            " (a.created_at >= now() - '1 day'::interval)  and  \
             (b.created_at >= now() - '1 day'::interval) "
        );
    }

    #[test]
    fn test_exclude_bots_tag() {
        let (sql, _) = expand(
            "where {{exclude_bots}} and {{period:created_at}}",
            &TemplateContext::interval("1 day"),
        );
        assert!(sql.contains("not similar to"));
        let mut ctx = TemplateContext::interval("1 day");
        ctx.exclude_bots = Some("(true)".to_string());
        let (sql, _) = expand("where {{exclude_bots}}", &ctx);
        assert_eq!(sql, "where (true)");
    }

    #[test]
    fn test_interval_hours_units() {
        assert_eq!(interval_hours("1 hour"), Some(1.0));
        assert_eq!(interval_hours("36 hours"), Some(36.0));
        assert_eq!(interval_hours("2 weeks"), Some(336.0));
        assert_eq!(interval_hours("1 month"), Some(730.5));
        assert_eq!(interval_hours("1 year"), Some(8766.0));
        assert_eq!(interval_hours("garbage"), None);
    }
}
