//! Time-series writer.
//!
//! Metric output lands in three table shapes, all created on demand:
//! - per-series tables `s<series>(time, period, value columns…)` with
//!   primary key `(time, period)`
//! - merged tables `s<merge>(time, series, period, value columns…)` with
//!   primary key `(time, series, period)`
//! - tag tables `t<series>(time, tag columns…)`, rebuilt wholesale
//!
//! Schema reconciliation happens on the first write to each table in a
//! process, under a mutex: missing value columns are added so concurrent
//! writers find the schema stable. Column-addition races are swallowed,
//! the postcondition holds either way.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Database, DatabaseError};

/// Errors raised by the time-series writer.
#[derive(Debug, Error)]
pub enum SeriesError {
    /// Underlying database failure.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Query failure.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// A series or column name is not a safe SQL identifier.
    #[error("Invalid identifier: '{0}'")]
    InvalidIdentifier(String),
}

/// One value cell in a time-series point.
#[derive(Debug, Clone, PartialEq)]
pub enum TsValue {
    /// Numeric value, stored as `double precision`.
    F64(f64),
    /// Textual value.
    Text(String),
    /// Timestamp value.
    Time(DateTime<Utc>),
    /// HyperLogLog sketch in its textual form; stored in an `hll` column
    /// with an empty-sketch default.
    Hll(String),
}

impl TsValue {
    fn column_type(&self) -> &'static str {
        match self {
            TsValue::F64(_) => "DOUBLE PRECISION NOT NULL DEFAULT 0.0",
            TsValue::Text(_) => "TEXT NOT NULL DEFAULT ''",
            TsValue::Time(_) => "TIMESTAMPTZ",
            TsValue::Hll(_) => "HLL NOT NULL DEFAULT hll_empty()",
        }
    }
}

/// One time-series point.
#[derive(Debug, Clone)]
pub struct TsPoint {
    /// Logical series name (table suffix, or `series` column when merged).
    pub series: String,
    /// Period code the point was computed for.
    pub period: String,
    /// Bucket time.
    pub time: DateTime<Utc>,
    /// Column values keyed by column name.
    pub fields: BTreeMap<String, TsValue>,
}

impl TsPoint {
    /// Creates a point with a single numeric `value` column.
    pub fn value(series: &str, period: &str, time: DateTime<Utc>, value: f64) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), TsValue::F64(value));
        Self {
            series: series.to_string(),
            period: period.to_string(),
            time,
            fields,
        }
    }
}

/// Output routing for a batch of points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesMode {
    /// One table per series: `s<series>`.
    PerSeries,
    /// All series share `s<name>` with a `series` column.
    Merged(String),
}

/// Validates and normalizes a series/column identifier.
pub fn safe_ident(name: &str) -> Result<String, SeriesError> {
    let lowered = name.to_lowercase();
    let valid = !lowered.is_empty()
        && lowered.chars().next().map(|c| c.is_ascii_lowercase()).unwrap_or(false)
        && lowered
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(SeriesError::InvalidIdentifier(name.to_string()));
    }
    Ok(lowered)
}

/// Writer over the time-series store.
pub struct SeriesWriter {
    db: Database,
    reconciled: Mutex<HashSet<String>>,
}

impl SeriesWriter {
    /// Creates a writer over an existing database client.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            reconciled: Mutex::new(HashSet::new()),
        }
    }

    /// The underlying database client.
    pub fn db(&self) -> &Database {
        &self.db
    }

    fn table_for(&self, point: &TsPoint, mode: &SeriesMode) -> Result<String, SeriesError> {
        match mode {
            SeriesMode::PerSeries => Ok(format!("s{}", safe_ident(&point.series)?)),
            SeriesMode::Merged(name) => Ok(format!("s{}", safe_ident(name)?)),
        }
    }

    /// Ensures the target table exists and carries every referenced column.
    ///
    /// Serialized per process so only the first writer pays the
    /// information-schema round trip; later writers hit the cache.
    async fn reconcile(
        &self,
        table: &str,
        merged: bool,
        fields: &BTreeMap<String, TsValue>,
    ) -> Result<(), SeriesError> {
        let mut done = self.reconciled.lock().await;
        let key = format!(
            "{}:{}",
            table,
            fields.keys().cloned().collect::<Vec<_>>().join(",")
        );
        if done.contains(&key) {
            return Ok(());
        }

        let mut columns = String::new();
        for (name, value) in fields {
            let name = safe_ident(name)?;
            columns.push_str(&format!(", {} {}", name, value.column_type()));
        }
        let create = if merged {
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 time TIMESTAMPTZ NOT NULL, series VARCHAR(100) NOT NULL, \
                 period VARCHAR(10) NOT NULL{columns}, \
                 PRIMARY KEY (time, series, period))"
            )
        } else {
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 time TIMESTAMPTZ NOT NULL, period VARCHAR(10) NOT NULL{columns}, \
                 PRIMARY KEY (time, period))"
            )
        };
        self.db.exec(&create).await?;

        // The table may predate some columns; add what is missing.
        for (name, value) in fields {
            let name = safe_ident(name)?;
            let alter = format!(
                "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {} {}",
                name,
                value.column_type()
            );
            if let Err(err) = self.db.exec(&alter).await {
                // A concurrent writer may have added it first.
                debug!(table, column = %name, error = %err, "column add race");
            }
        }

        done.insert(key);
        Ok(())
    }

    /// Upserts a batch of points.
    pub async fn write_points(
        &self,
        points: &[TsPoint],
        mode: &SeriesMode,
    ) -> Result<(), SeriesError> {
        for point in points {
            let table = self.table_for(point, mode)?;
            let merged = matches!(mode, SeriesMode::Merged(_));
            self.reconcile(&table, merged, &point.fields).await?;

            let mut cols: Vec<String> = vec!["time".into(), "period".into()];
            if merged {
                cols.insert(1, "series".into());
            }
            for name in point.fields.keys() {
                cols.push(safe_ident(name)?);
            }
            let placeholders: Vec<String> =
                (1..=cols.len()).map(|i| format!("${i}")).collect();
            let conflict_key = if merged {
                "time, series, period"
            } else {
                "time, period"
            };
            let updates: Vec<String> = point
                .fields
                .keys()
                .map(|name| {
                    let name = safe_ident(name).unwrap_or_else(|_| name.clone());
                    format!("{name} = EXCLUDED.{name}")
                })
                .collect();
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({conflict_key}) DO UPDATE SET {}",
                cols.join(", "),
                placeholders
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        // Cast the textual form back into hll on insert.
                        let field_idx = i as i64 - if merged { 3 } else { 2 };
                        if field_idx >= 0 {
                            if let Some(TsValue::Hll(_)) =
                                point.fields.values().nth(field_idx as usize)
                            {
                                return format!("{p}::hll");
                            }
                        }
                        p.clone()
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
                updates.join(", ")
            );

            let mut query = sqlx::query(&sql).bind(point.time);
            if merged {
                query = query.bind(&point.series);
            }
            query = query.bind(&point.period);
            for value in point.fields.values() {
                query = match value {
                    TsValue::F64(v) => query.bind(*v),
                    TsValue::Text(v) => query.bind(v),
                    TsValue::Time(v) => query.bind(*v),
                    TsValue::Hll(v) => query.bind(v),
                };
            }
            query.execute(self.db.pool()).await?;
        }
        Ok(())
    }

    /// Highest bucket time already written for `(series, period)`.
    pub async fn max_time(
        &self,
        series: &str,
        period: &str,
        mode: &SeriesMode,
    ) -> Result<Option<DateTime<Utc>>, SeriesError> {
        let (table, filter) = match mode {
            SeriesMode::PerSeries => (format!("s{}", safe_ident(series)?), String::new()),
            SeriesMode::Merged(name) => (
                format!("s{}", safe_ident(name)?),
                format!(" AND series = '{}'", safe_ident(series)?),
            ),
        };
        let sql =
            format!("SELECT max(time) AS t FROM {table} WHERE period = $1{filter}");
        match sqlx::query(&sql).bind(period).fetch_one(self.db.pool()).await {
            Ok(row) => Ok(row.try_get("t").ok().flatten()),
            // Missing table means no points yet.
            Err(sqlx::Error::Database(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes whole series before a from-scratch recalculation.
    pub async fn drop_series(
        &self,
        names: &[String],
        mode: &SeriesMode,
    ) -> Result<(), SeriesError> {
        for name in names {
            match mode {
                SeriesMode::PerSeries => {
                    let table = format!("s{}", safe_ident(name)?);
                    self.db.exec(&format!("DROP TABLE IF EXISTS {table}")).await?;
                }
                SeriesMode::Merged(merge) => {
                    let table = format!("s{}", safe_ident(merge)?);
                    let sql = format!("DELETE FROM {table} WHERE series = $1");
                    if let Err(err) = sqlx::query(&sql)
                        .bind(safe_ident(name)?)
                        .execute(self.db.pool())
                        .await
                    {
                        // Merged table may not exist yet.
                        debug!(table, error = %err, "drop on missing merged table");
                    }
                }
            }
        }
        Ok(())
    }

    /// Rebuilds a tag table `t<series>` from scratch.
    ///
    /// Each row becomes one record; rows are spaced one second apart so the
    /// `time` primary key stays unique. Every tag column gets an index.
    pub async fn write_tags(
        &self,
        series: &str,
        rows: &[BTreeMap<String, String>],
        base_time: DateTime<Utc>,
    ) -> Result<(), SeriesError> {
        let table = format!("t{}", safe_ident(series)?);
        self.db.exec(&format!("DROP TABLE IF EXISTS {table}")).await?;

        let mut columns: Vec<String> = Vec::new();
        for row in rows {
            for key in row.keys() {
                let key = safe_ident(key)?;
                if !columns.contains(&key) {
                    columns.push(key);
                }
            }
        }
        let decls: Vec<String> = columns.iter().map(|c| format!("{c} TEXT")).collect();
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (time TIMESTAMPTZ PRIMARY KEY{}{})",
            if decls.is_empty() { "" } else { ", " },
            decls.join(", ")
        );
        self.db.exec(&create).await?;
        for column in &columns {
            self.db
                .exec(&format!(
                    "CREATE INDEX IF NOT EXISTS {table}_{column}_idx ON {table}({column})"
                ))
                .await?;
        }

        for (i, row) in rows.iter().enumerate() {
            let time = base_time + chrono::Duration::seconds(i as i64);
            let mut cols = vec!["time".to_string()];
            let mut values: Vec<&String> = Vec::new();
            for column in &columns {
                if let Some(v) = row.get(column) {
                    cols.push(column.clone());
                    values.push(v);
                }
            }
            let placeholders: Vec<String> =
                (1..=cols.len()).map(|i| format!("${i}")).collect();
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                cols.join(", "),
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql).bind(time);
            for value in values {
                query = query.bind(value);
            }
            query.execute(self.db.pool()).await?;
        }
        Ok(())
    }

    /// Replaces the quick-ranges catalog with `(suffix, name, data)` rows.
    pub async fn write_quick_ranges(
        &self,
        ranges: &[(String, String, String)],
    ) -> Result<(), SeriesError> {
        sqlx::query("DELETE FROM tquick_ranges")
            .execute(self.db.pool())
            .await?;
        for (suffix, name, data) in ranges {
            sqlx::query(
                "INSERT INTO tquick_ranges(suffix, name, data) VALUES ($1, $2, $3) \
                 ON CONFLICT (suffix) DO UPDATE SET name = EXCLUDED.name, data = EXCLUDED.data",
            )
            .bind(suffix)
            .bind(name)
            .bind(data)
            .execute(self.db.pool())
            .await?;
        }
        Ok(())
    }

    /// Replaces project annotations; optionally mirrors them into the
    /// shared cross-project table keyed by the main repo.
    pub async fn write_annotations(
        &self,
        annotations: &[(DateTime<Utc>, String, String)],
        shared_repo: Option<&str>,
    ) -> Result<(), SeriesError> {
        sqlx::query("DELETE FROM annotations")
            .execute(self.db.pool())
            .await?;
        for (time, title, description) in annotations {
            sqlx::query(
                "INSERT INTO annotations(time, title, description) VALUES ($1, $2, $3) \
                 ON CONFLICT (time) DO UPDATE SET title = EXCLUDED.title, \
                 description = EXCLUDED.description",
            )
            .bind(time)
            .bind(title)
            .bind(description)
            .execute(self.db.pool())
            .await?;
            if let Some(repo) = shared_repo {
                sqlx::query(
                    "INSERT INTO annotations_shared(time, repo, title, description) \
                     VALUES ($1, $2, $3, $4) ON CONFLICT (time, repo) DO UPDATE SET \
                     title = EXCLUDED.title, description = EXCLUDED.description",
                )
                .bind(time)
                .bind(repo)
                .bind(title)
                .bind(description)
                .execute(self.db.pool())
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_ident() {
        assert_eq!(safe_ident("prs_merged").unwrap(), "prs_merged");
        assert_eq!(safe_ident("PRs_Merged").unwrap(), "prs_merged");
        assert!(safe_ident("1bad").is_err());
        assert!(safe_ident("bad-name").is_err());
        assert!(safe_ident("bad;drop table x").is_err());
        assert!(safe_ident("").is_err());
    }

    #[test]
    fn test_point_value_helper() {
        let now = Utc::now();
        let point = TsPoint::value("prs_merged", "d", now, 42.0);
        assert_eq!(point.series, "prs_merged");
        assert_eq!(point.fields.get("value"), Some(&TsValue::F64(42.0)));
    }

    #[test]
    fn test_column_types() {
        assert!(TsValue::F64(1.0).column_type().contains("DOUBLE PRECISION"));
        assert!(TsValue::Hll(String::new()).column_type().contains("hll_empty"));
        assert!(TsValue::Text(String::new()).column_type().contains("TEXT"));
    }
}
