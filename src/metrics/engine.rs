//! Metric execution engine.
//!
//! Non-histogram metrics run serially; histograms are one large query each
//! and run in parallel, bounded by `min(cpus, max_histograms)`. Metric
//! SELECTs prefer the read-only pool.
//!
//! Execution shapes:
//! - plain: one row, numeric columns become point fields
//! - fan-out: first column is a label, one series per distinct label
//! - multi-value: all value columns land on one point under their own names
//! - histogram: `(label, value)` rows at a single `(time, period)` key
//! - merged: points land in one shared table with a `series` column
//! - custom-data: the query emits `(series, period, …)` tuples itself

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{env_snapshot, overlay_env, Ctx};
use crate::storage::series::SeriesError;
use crate::storage::{SeriesMode, SeriesWriter, TsPoint, TsValue};

use super::period::{compute_period_at, ComputeFlags, Period, PeriodError};
use super::spec::{Metric, MetricsConfig};
use super::template::{expand, TemplateContext};

/// Errors that can occur while running metrics.
#[derive(Debug, Error)]
pub enum MetricError {
    /// A period code failed to parse; operator config error.
    #[error("Metric '{metric}': {source}")]
    BadPeriod {
        metric: String,
        #[source]
        source: PeriodError,
    },

    /// A metric query failed and the metric does not allow failure.
    #[error("Metric '{metric}' failed: {message}")]
    MetricFailed { metric: String, message: String },

    /// Time-series write failure.
    #[error("Series error: {0}")]
    Series(#[from] SeriesError),

    /// Query failure outside a metric body (quick ranges, watermarks).
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Per-run engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Metrics executed (at least one period ran).
    pub metrics: AtomicU64,
    /// Points written.
    pub points: AtomicU64,
    /// Tolerated (`allow_fail`) failures.
    pub tolerated_failures: AtomicU64,
    /// Period combinations skipped by the recompute schedule.
    pub skipped_periods: AtomicU64,
}

/// One resolved computation window.
struct Window {
    /// Template context (interval or range mode).
    ctx: TemplateContext,
    /// Bucket time recorded on the points.
    time: DateTime<Utc>,
    /// Period string recorded on the points.
    period_label: String,
}

/// Decoded SQL result cell.
#[derive(Debug, Clone)]
enum Cell {
    Num(f64),
    Str(String),
    Time(DateTime<Utc>),
    Null,
}

/// The metric engine.
pub struct MetricEngine {
    ctx: Ctx,
    writer: Arc<SeriesWriter>,
}

impl MetricEngine {
    /// Creates an engine over a series writer.
    pub fn new(ctx: Ctx, writer: Arc<SeriesWriter>) -> Self {
        Self { ctx, writer }
    }

    /// Schedule flags for one metric and period, honoring the metric's
    /// `env` overlay (including its `@period` / `!period` scoping).
    fn flags_for(&self, metric: &Metric, period_code: Option<&str>) -> ComputeFlags {
        if !metric.env.is_empty() {
            let mut env = env_snapshot();
            overlay_env(&mut env, &metric.env, period_code);
            match Ctx::from_env_map(&env) {
                Ok(ctx) => {
                    return ComputeFlags {
                        compute_all: ctx.compute_all,
                        compute_periods: ctx.compute_periods,
                        recalc_reciprocal: ctx.recalc_reciprocal,
                        random_recompute: ctx.random_recompute,
                    }
                }
                Err(err) => {
                    warn!(metric = %metric.name, error = %err, "bad metric env overlay")
                }
            }
        }
        ComputeFlags {
            compute_all: self.ctx.compute_all,
            compute_periods: self.ctx.compute_periods.clone(),
            recalc_reciprocal: self.ctx.recalc_reciprocal,
            random_recompute: self.ctx.random_recompute,
        }
    }

    /// Runs the whole catalog for one project.
    pub async fn run(
        self: Arc<Self>,
        config: &MetricsConfig,
        project: &str,
        project_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Arc<EngineStats>, MetricError> {
        let stats = Arc::new(EngineStats::default());
        let max_wait = Arc::new(AtomicU64::new(0));

        let (histograms, serial): (Vec<&Metric>, Vec<&Metric>) = config
            .metrics
            .iter()
            .filter(|m| m.runs_for_project(project))
            .partition(|m| m.histogram);

        info!(
            project,
            serial = serial.len(),
            histograms = histograms.len(),
            reset = self.ctx.reset_tsdb,
            "running metric catalog"
        );

        for metric in serial {
            self.run_metric_guarded(metric, project_start, now, &stats, &max_wait)
                .await?;
        }

        let semaphore = Arc::new(Semaphore::new(self.ctx.histogram_workers()));
        let mut handles = Vec::with_capacity(histograms.len());
        for metric in histograms {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore");
            let this = self.clone();
            let metric = (*metric).clone();
            let stats = stats.clone();
            let max_wait = max_wait.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.run_metric_guarded(&metric, project_start, now, &stats, &max_wait)
                    .await
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(result) => result?,
                Err(join_err) => {
                    return Err(MetricError::MetricFailed {
                        metric: "histogram worker".to_string(),
                        message: join_err.to_string(),
                    })
                }
            }
        }

        // The longest cooldown requested by a tolerated failure applies
        // once at the end of the batch.
        let wait = max_wait.load(Ordering::SeqCst);
        if wait > 0 {
            info!(seconds = wait, "cooldown after tolerated metric failures");
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }

        info!(
            metrics = stats.metrics.load(Ordering::Relaxed),
            points = stats.points.load(Ordering::Relaxed),
            tolerated = stats.tolerated_failures.load(Ordering::Relaxed),
            "metric catalog done"
        );
        Ok(stats)
    }

    async fn run_metric_guarded(
        &self,
        metric: &Metric,
        project_start: DateTime<Utc>,
        now: DateTime<Utc>,
        stats: &EngineStats,
        max_wait: &AtomicU64,
    ) -> Result<(), MetricError> {
        match self.run_metric(metric, project_start, now, stats).await {
            Ok(()) => Ok(()),
            Err(err) if metric.allow_fail => {
                warn!(metric = %metric.name, error = %err, "metric failed (allowed)");
                stats.tolerated_failures.fetch_add(1, Ordering::Relaxed);
                max_wait.fetch_max(metric.wait_after_fail, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn run_metric(
        &self,
        metric: &Metric,
        project_start: DateTime<Utc>,
        now: DateTime<Utc>,
        stats: &EngineStats,
    ) -> Result<(), MetricError> {
        let mode = match &metric.merge_series {
            Some(name) => SeriesMode::Merged(name.clone()),
            None => SeriesMode::PerSeries,
        };

        // Drop runs once per metric across all of its periods.
        if self.ctx.reset_tsdb {
            let names = metric.drop_series();
            if !names.is_empty() {
                debug!(metric = %metric.name, series = names.len(), "dropping series");
                self.writer.drop_series(&names, &mode).await?;
            }
        }

        let windows = if metric.annotations_ranges {
            self.quick_range_windows(metric, now).await?
        } else {
            self.period_windows(metric, project_start, now, stats)?
        };
        if windows.is_empty() {
            return Ok(());
        }

        stats.metrics.fetch_add(1, Ordering::Relaxed);
        for window in &windows {
            if metric.histogram {
                // Distributions are rewritten wholesale per period.
                self.delete_histogram(metric, &mode, &window.period_label)
                    .await?;
            }
            for sql in metric.queries() {
                let (expanded, hours) = expand(sql, &window.ctx);
                let expanded = expanded.replace("{{n}}", &hours);
                let rows = sqlx::query(&expanded)
                    .fetch_all(self.writer.db().read_pool())
                    .await
                    .map_err(|e| MetricError::MetricFailed {
                        metric: metric.name.clone(),
                        message: e.to_string(),
                    })?;
                let points = self.points_from_rows(metric, &rows, window);
                let count = points.len() as u64;
                self.writer.write_points(&points, &mode).await?;
                stats.points.fetch_add(count, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Windows for regular period-driven metrics.
    fn period_windows(
        &self,
        metric: &Metric,
        project_start: DateTime<Utc>,
        now: DateTime<Utc>,
        stats: &EngineStats,
    ) -> Result<Vec<Window>, MetricError> {
        let mut rng = rand::thread_rng();
        let mut out = Vec::new();

        for (period_code, aggregate) in metric.period_combinations() {
            let code = Metric::combined_code(&period_code, aggregate);
            let flags = self.flags_for(metric, Some(&code));
            let eligible = metric.always_recalc
                || self.ctx.reset_tsdb
                || compute_period_at(&code, now, metric.histogram, &flags, &mut rng);
            if !eligible {
                stats.skipped_periods.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let period = Period::parse(&period_code).map_err(|source| MetricError::BadPeriod {
                metric: metric.name.clone(),
                source,
            })?;
            let window_span = Period {
                kind: period.kind,
                n: period.n * aggregate,
            };

            if metric.histogram {
                // Histograms look back over a relative window ending now.
                out.push(Window {
                    ctx: TemplateContext::interval(&window_span.interval()),
                    time: hour_start(now),
                    period_label: code.clone(),
                });
                continue;
            }

            let mut start = project_start;
            if let Some(from) = metric.start_from {
                start = start.max(from);
            }
            if let Some(hours) = metric.last_hours {
                start = start.max(now - chrono::Duration::hours(hours));
            }

            if self.ctx.reset_tsdb {
                // Regenerate every bucket since the effective start.
                let mut bucket = period.bucket_start(start);
                while bucket <= now {
                    let to = period.bucket_end(bucket);
                    let from = window_span.add(to, -1);
                    out.push(Window {
                        ctx: TemplateContext::range(from, to),
                        time: bucket,
                        period_label: code.clone(),
                    });
                    bucket = period.bucket_end(bucket);
                }
            } else {
                // Normal mode touches only the bucket containing now, so
                // no point below the existing watermark is rewritten.
                let bucket = period.bucket_start(now);
                let to = period.bucket_end(bucket);
                let from = window_span.add(to, -1);
                out.push(Window {
                    ctx: TemplateContext::range(from, to),
                    time: bucket,
                    period_label: code.clone(),
                });
            }
        }
        Ok(out)
    }

    /// Windows driven by the named quick ranges.
    async fn quick_range_windows(
        &self,
        metric: &Metric,
        now: DateTime<Utc>,
    ) -> Result<Vec<Window>, MetricError> {
        let rows = sqlx::query("SELECT suffix, data FROM tquick_ranges")
            .fetch_all(self.writer.db().read_pool())
            .await?;

        // The rng must not live across an await; create it after the fetch.
        let mut rng = rand::thread_rng();
        let mut out = Vec::new();
        for row in rows {
            let suffix: String = row.get("suffix");
            let data: String = row.get("data");
            let flags = self.flags_for(metric, Some(&suffix));
            let eligible = metric.always_recalc
                || self.ctx.reset_tsdb
                || compute_period_at(&suffix, now, metric.histogram, &flags, &mut rng);
            if !eligible {
                continue;
            }
            // Absolute ranges carry `from;to`, relative ones an interval.
            let window = match data.split_once(';') {
                Some((from, to)) => {
                    let from = parse_pg_timestamp(from);
                    let to = parse_pg_timestamp(to);
                    match (from, to) {
                        (Some(from), Some(to)) => Window {
                            ctx: TemplateContext::range(from, to),
                            time: to,
                            period_label: suffix,
                        },
                        _ => continue,
                    }
                }
                None => Window {
                    ctx: TemplateContext::interval(&data),
                    time: hour_start(now),
                    period_label: suffix,
                },
            };
            out.push(window);
        }
        Ok(out)
    }

    async fn delete_histogram(
        &self,
        metric: &Metric,
        mode: &SeriesMode,
        period_label: &str,
    ) -> Result<(), MetricError> {
        let series = normalize_name(&metric.series_name_or_func);
        let (table, extra) = match mode {
            SeriesMode::PerSeries => (format!("s{series}"), String::new()),
            SeriesMode::Merged(name) => (
                format!("s{}", normalize_name(name)),
                format!(" AND series = '{series}'"),
            ),
        };
        let sql = format!("DELETE FROM {table} WHERE period = $1{extra}");
        if let Err(err) = sqlx::query(&sql)
            .bind(period_label)
            .execute(self.writer.db().pool())
            .await
        {
            // First run: the table does not exist yet.
            debug!(table, error = %err, "histogram delete on missing table");
        }
        Ok(())
    }

    /// Maps SQL rows to points according to the metric's shape flags.
    fn points_from_rows(&self, metric: &Metric, rows: &[PgRow], window: &Window) -> Vec<TsPoint> {
        if rows.is_empty() {
            return Vec::new();
        }

        if metric.custom_data {
            return self.custom_data_points(metric, rows, window);
        }
        if metric.histogram {
            return self.histogram_points(metric, rows, window);
        }

        let first = &rows[0];
        let fan_out = rows.len() > 1 || matches!(decode_cell(first, 0), Cell::Str(_));

        let mut out = Vec::new();
        if fan_out {
            for row in rows {
                let Cell::Str(label) = decode_cell(row, 0) else {
                    continue;
                };
                let series = if metric.skip_escape_series_name {
                    label.clone()
                } else {
                    normalize_name(&label)
                };
                let fields = self.fields_from_row(metric, row, 1);
                if fields.is_empty() {
                    continue;
                }
                out.push(TsPoint {
                    series,
                    period: window.period_label.clone(),
                    time: window.time,
                    fields,
                });
            }
        } else {
            let fields = self.fields_from_row(metric, first, 0);
            if !fields.is_empty() {
                out.push(TsPoint {
                    series: normalize_name(&metric.series_name_or_func),
                    period: window.period_label.clone(),
                    time: window.time,
                    fields,
                });
            }
        }
        out
    }

    fn histogram_points(&self, metric: &Metric, rows: &[PgRow], window: &Window) -> Vec<TsPoint> {
        let series = normalize_name(&metric.series_name_or_func);
        let mut out = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            let Cell::Str(label) = decode_cell(row, 0) else {
                continue;
            };
            let name = if metric.escape_value_name {
                normalize_name(&label)
            } else {
                label
            };
            let mut fields = self.fields_from_row(metric, row, 1);
            if fields.is_empty() {
                continue;
            }
            fields.insert("name".to_string(), TsValue::Text(name));
            out.push(TsPoint {
                series: series.clone(),
                period: window.period_label.clone(),
                // Group rows share the bucket; a per-row second keeps the
                // (time, period) primary key unique.
                time: window.time + chrono::Duration::seconds(i as i64),
                fields,
            });
        }
        out
    }

    fn custom_data_points(&self, metric: &Metric, rows: &[PgRow], window: &Window) -> Vec<TsPoint> {
        let mut out = Vec::new();
        for row in rows {
            if row.columns().len() < 2 {
                continue;
            }
            let Cell::Str(series) = decode_cell(row, 0) else {
                continue;
            };
            let Cell::Str(period) = decode_cell(row, 1) else {
                continue;
            };
            let mut time = window.time;
            let mut fields = BTreeMap::new();
            for (idx, column) in row.columns().iter().enumerate().skip(2) {
                let name = field_name(column.name());
                match decode_cell(row, idx) {
                    Cell::Time(t) if name == "time" => time = t,
                    cell => {
                        if let Some(value) = self.cell_to_value(metric, cell) {
                            fields.insert(name, value);
                        }
                    }
                }
            }
            if fields.is_empty() {
                continue;
            }
            out.push(TsPoint {
                series: normalize_name(&series),
                period,
                time,
                fields,
            });
        }
        out
    }

    /// Value fields from row columns starting at `skip` (label columns).
    fn fields_from_row(
        &self,
        metric: &Metric,
        row: &PgRow,
        skip: usize,
    ) -> BTreeMap<String, TsValue> {
        let mut fields = BTreeMap::new();
        let columns = row.columns();
        for (idx, column) in columns.iter().enumerate().skip(skip) {
            let name = field_name(column.name());
            let Some(value) = self.cell_to_value(metric, decode_cell(row, idx)) else {
                continue;
            };
            fields.insert(name, value);
            if !metric.multi_value && fields.len() == 1 && columns.len() > skip + 1 {
                // Single-value metrics take the first value column only.
                break;
            }
        }
        // A lone unnamed numeric column becomes the conventional `value`.
        if fields.len() == 1 && !metric.multi_value {
            if let Some((key, value)) = fields.iter().next().map(|(k, v)| (k.clone(), v.clone())) {
                if key != "value" && matches!(value, TsValue::F64(_)) {
                    fields.clear();
                    fields.insert("value".to_string(), value);
                }
            }
        }
        fields
    }

    fn cell_to_value(&self, metric: &Metric, cell: Cell) -> Option<TsValue> {
        match cell {
            Cell::Num(v) => Some(TsValue::F64(v)),
            // HLL metrics return sketches in text form.
            Cell::Str(s) if metric.hll => Some(TsValue::Hll(s)),
            Cell::Str(s) => Some(TsValue::Text(s)),
            Cell::Time(t) => Some(TsValue::Time(t)),
            Cell::Null => None,
        }
    }
}

fn hour_start(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_minute(0)
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

fn parse_pg_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Folds a label into a safe series/column identifier: lowercase, runs of
/// non-alphanumerics collapse to `_`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() || !out.chars().next().map(|c| c.is_ascii_lowercase()).unwrap_or(false) {
        out.insert(0, 's');
    }
    out
}

fn field_name(column: &str) -> String {
    if column.is_empty() || column == "?column?" {
        "value".to_string()
    } else {
        normalize_name(column)
    }
}

fn decode_cell(row: &PgRow, idx: usize) -> Cell {
    let type_name = row
        .columns()
        .get(idx)
        .map(|c| c.type_info().name().to_uppercase())
        .unwrap_or_default();
    match type_name.as_str() {
        "FLOAT4" => match row.try_get::<Option<f32>, _>(idx) {
            Ok(Some(v)) => Cell::Num(v as f64),
            _ => Cell::Null,
        },
        "FLOAT8" => match row.try_get::<Option<f64>, _>(idx) {
            Ok(Some(v)) => Cell::Num(v),
            _ => Cell::Null,
        },
        "INT2" => match row.try_get::<Option<i16>, _>(idx) {
            Ok(Some(v)) => Cell::Num(v as f64),
            _ => Cell::Null,
        },
        "INT4" => match row.try_get::<Option<i32>, _>(idx) {
            Ok(Some(v)) => Cell::Num(v as f64),
            _ => Cell::Null,
        },
        "INT8" => match row.try_get::<Option<i64>, _>(idx) {
            Ok(Some(v)) => Cell::Num(v as f64),
            _ => Cell::Null,
        },
        "NUMERIC" => match row.try_get::<Option<sqlx::types::BigDecimal>, _>(idx) {
            Ok(Some(v)) => v
                .to_string()
                .parse::<f64>()
                .map(Cell::Num)
                .unwrap_or(Cell::Null),
            _ => Cell::Null,
        },
        "BOOL" => match row.try_get::<Option<bool>, _>(idx) {
            Ok(Some(v)) => Cell::Num(if v { 1.0 } else { 0.0 }),
            _ => Cell::Null,
        },
        "TIMESTAMPTZ" => match row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            Ok(Some(v)) => Cell::Time(v),
            _ => Cell::Null,
        },
        "TIMESTAMP" => match row.try_get::<Option<NaiveDateTime>, _>(idx) {
            Ok(Some(v)) => Cell::Time(Utc.from_utc_datetime(&v)),
            _ => Cell::Null,
        },
        // Text and everything with a textual output (hll sketches cast to
        // ::text by their metrics).
        _ => match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => Cell::Str(v),
            _ => Cell::Null,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("PRs Merged"), "prs_merged");
        assert_eq!(normalize_name("Red Hat, Inc."), "red_hat_inc");
        assert_eq!(normalize_name("already_fine"), "already_fine");
        assert_eq!(normalize_name("7days"), "s7days");
        assert_eq!(normalize_name(""), "s");
        assert_eq!(normalize_name("__x__"), "x");
    }

    #[test]
    fn test_field_name() {
        assert_eq!(field_name("?column?"), "value");
        assert_eq!(field_name(""), "value");
        assert_eq!(field_name("Commits Count"), "commits_count");
    }

    #[test]
    fn test_parse_pg_timestamp() {
        let t = parse_pg_timestamp("2020-03-01 12:00:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2020, 3, 1, 12, 0, 0).unwrap());
        assert!(parse_pg_timestamp("garbage").is_none());
    }

    #[test]
    fn test_hour_start() {
        let dt = Utc.with_ymd_and_hms(2020, 3, 1, 12, 34, 56).unwrap();
        assert_eq!(
            hour_start(dt),
            Utc.with_ymd_and_hms(2020, 3, 1, 12, 0, 0).unwrap()
        );
    }
}
