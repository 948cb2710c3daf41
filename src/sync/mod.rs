//! Per-project sync orchestrator.
//!
//! One invocation drives the full pipeline for one project: ingest new
//! archive hours, mirror git repos, refresh from the GitHub API, apply
//! structure touch-ups, regenerate annotations and quick ranges, run the
//! metric catalog, reconcile merged-table columns and recompute template
//! vars. Steps tolerate partial failure where the configuration says so;
//! everything else aborts the run.
//!
//! Cross-run exclusion uses lock rows in `gha_computed`
//! (`giant_lock:<project>`, `affs_lock:<project>`); locks orphaned by
//! crashed runs are cleared by age at startup.

pub mod annotations;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Deserialize;
use sqlx::Row;
use thiserror::Error;
use tracing::{info, warn};

use crate::affs::AffsError;
use crate::config::{
    env_snapshot, load_skip_hours, overlay_env, ConfigError, Ctx, HideMap, Project,
    ProjectsConfig,
};
use crate::enrich::{EnrichError, Enricher};
use crate::ingest::{roles, Filter, Filters, IngestError, Ingestor};
use crate::metrics::engine::normalize_name;
use crate::metrics::{MetricEngine, MetricError, MetricsConfig};
use crate::storage::{schema, Database, DatabaseError, Logger, SeriesWriter};

/// Errors that can occur during a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Enrich error: {0}")]
    Enrich(#[from] EnrichError),

    #[error("Affiliations error: {0}")]
    Affs(#[from] AffsError),

    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("Series error: {0}")]
    Series(#[from] crate::storage::series::SeriesError),

    #[error("Another sync holds the lock for '{0}'")]
    Locked(String),

    #[error("Git sync command failed: {0}")]
    GitSync(String),
}

/// Configuration file locations for one deployment.
#[derive(Debug, Clone)]
pub struct SyncPaths {
    pub projects: PathBuf,
    pub metrics: PathBuf,
    pub tags: Option<PathBuf>,
    pub vars: Option<PathBuf>,
    pub columns: Option<PathBuf>,
    pub skip_dates: Option<PathBuf>,
    pub hide: Option<PathBuf>,
}

impl Default for SyncPaths {
    fn default() -> Self {
        Self {
            projects: PathBuf::from("projects.yaml"),
            metrics: PathBuf::from("metrics.yaml"),
            tags: None,
            vars: None,
            columns: None,
            skip_dates: None,
            hide: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TagSpec {
    name: String,
    sql: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TagsConfig {
    #[serde(default)]
    tags: Vec<TagSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct VarSpec {
    name: String,
    sql: String,
}

#[derive(Debug, Clone, Deserialize)]
struct VarsConfig {
    #[serde(default)]
    vars: Vec<VarSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnSpec {
    /// Merged series whose columns are reconciled.
    table: String,
    /// Tag series providing the column values.
    tag_table: String,
    /// Tag column to read.
    #[serde(default = "default_tag_column")]
    column: String,
    /// Prefix for generated column names.
    #[serde(default)]
    prefix: String,
}

fn default_tag_column() -> String {
    "name".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnsConfig {
    #[serde(default)]
    columns: Vec<ColumnSpec>,
}

/// The per-project orchestrator.
pub struct Orchestrator {
    ctx: Ctx,
    paths: SyncPaths,
}

impl Orchestrator {
    /// Creates an orchestrator.
    pub fn new(ctx: Ctx, paths: SyncPaths) -> Self {
        Self { ctx, paths }
    }

    /// Effective context for a project: shell env overlaid with the
    /// project's `env` block.
    fn project_ctx(&self, project: &Project) -> Result<Ctx, SyncError> {
        if project.env.is_empty() {
            return Ok(self.ctx.clone());
        }
        let mut env = env_snapshot();
        overlay_env(&mut env, &project.env, None);
        Ok(Ctx::from_env_map(&env)?)
    }

    /// Runs the full pipeline for one project.
    pub async fn sync_project(&self, name: &str) -> Result<(), SyncError> {
        let started = Instant::now();
        let projects = ProjectsConfig::load(&self.paths.projects)?;
        let project = projects.get(name)?.clone();
        let ctx = self.project_ctx(&project)?;
        let now = Utc::now();

        let db = Database::connect(&ctx).await?;
        let logger = Logger::new(ctx.log_to_db.then_some(&db), "sync", name);
        logger
            .log(&format!(
                "devstats {} sync start, repo {}",
                env!("CARGO_PKG_VERSION"),
                project.main_repo
            ))
            .await;

        let lock = format!("giant_lock:{name}");
        db.clear_stale_locks("giant_lock:", ctx.lock_age).await?;
        db.clear_stale_locks("affs_lock:", ctx.lock_age).await?;
        match db.acquire_lock(&lock).await {
            Ok(()) => {}
            Err(DatabaseError::LockHeld(_)) => {
                return Err(SyncError::Locked(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        }

        let result = self
            .sync_steps(&ctx, &project, name, &db, &logger, now)
            .await;
        db.release_lock(&lock).await?;
        logger
            .log(&format!("time: {:?}", started.elapsed()))
            .await;
        result
    }

    async fn sync_steps(
        &self,
        ctx: &Ctx,
        project: &Project,
        name: &str,
        db: &Database,
        logger: &Logger,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let hide = Arc::new(match &self.paths.hide {
            Some(path) => HideMap::load(path)?,
            None => HideMap::empty(),
        });

        // Structure first so a fresh database can take the rest.
        schema::structure(db).await?;

        self.ingest_step(ctx, project, db, logger, now, hide.clone())
            .await?;
        self.git_sync_step(ctx, logger).await?;

        if !ctx.skip_ghapi && !ctx.github_oauth.is_empty() {
            let phase = Instant::now();
            let enricher = Arc::new(Enricher::new(ctx.clone(), db.clone(), hide.clone())?);
            let cutoff = now - ChronoDuration::hours(ctx.recent_range_hours);
            enricher.run(cutoff).await?;
            logger
                .log(&format!("ghapi: {:?}", phase.elapsed()))
                .await;
        }

        if !ctx.skip_affs {
            let phase = Instant::now();
            let inserted = roles::refresh_commit_roles(db, &hide).await?;
            logger
                .log(&format!(
                    "commit roles: {inserted} new rows, {:?}",
                    phase.elapsed()
                ))
                .await;
        }

        let writer = Arc::new(SeriesWriter::new(db.clone()));
        self.annotations_step(ctx, project, db, &writer, now).await?;

        let phase = Instant::now();
        let metrics = MetricsConfig::load(&self.paths.metrics)?;
        let engine = Arc::new(MetricEngine::new(ctx.clone(), writer.clone()));
        let project_start = Utc
            .from_utc_datetime(&project.start_date.and_hms_opt(0, 0, 0).expect("midnight"));
        engine.run(&metrics, name, project_start, now).await?;
        logger
            .log(&format!("metrics: {:?}", phase.elapsed()))
            .await;

        self.columns_step(ctx, name, db, now).await?;
        self.vars_step(db).await?;
        Ok(())
    }

    async fn ingest_step(
        &self,
        ctx: &Ctx,
        project: &Project,
        db: &Database,
        logger: &Logger,
        now: DateTime<Utc>,
        hide: Arc<HideMap>,
    ) -> Result<(), SyncError> {
        let phase = Instant::now();
        let skip_hours = match &self.paths.skip_dates {
            Some(path) => load_skip_hours(path)?,
            None => Default::default(),
        };
        let filters = Filters {
            org: Filter::parse(&project.org_filter_spec())?,
            repo: Filter::parse(&project.repo_filter_spec())?,
            actor: Filter::Any,
        };

        // Resume from the newest parsed hour; a fresh warehouse starts at
        // the project's start date.
        let row = sqlx::query("SELECT max(dt) AS dt FROM gha_parsed")
            .fetch_one(db.pool())
            .await?;
        let from = row
            .try_get::<Option<DateTime<Utc>>, _>("dt")
            .ok()
            .flatten()
            .map(|dt| dt + ChronoDuration::hours(1))
            .unwrap_or_else(|| {
                Utc.from_utc_datetime(
                    &project.start_date.and_hms_opt(0, 0, 0).expect("midnight"),
                )
            });
        let to = now - ChronoDuration::hours(1);
        if from > to {
            info!(project = %project.main_repo, "no new archive hours");
            return Ok(());
        }

        let ingestor = Ingestor::new(ctx.clone(), db.clone(), filters, hide, skip_hours);
        let stats = ingestor.run(from, to).await?;
        logger
            .log(&format!(
                "gha: {} events matched, {} inserted, {:?}",
                stats.matched.load(std::sync::atomic::Ordering::Relaxed),
                stats.inserted.load(std::sync::atomic::Ordering::Relaxed),
                phase.elapsed()
            ))
            .await;
        Ok(())
    }

    async fn git_sync_step(&self, ctx: &Ctx, logger: &Logger) -> Result<(), SyncError> {
        let Some(cmd) = &ctx.git_sync_cmd else {
            return Ok(());
        };
        let phase = Instant::now();
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .await
            .map_err(|e| SyncError::GitSync(e.to_string()))?;
        if !output.status.success() {
            return Err(SyncError::GitSync(format!(
                "exit {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        logger.log(&format!("git: {:?}", phase.elapsed())).await;
        Ok(())
    }

    /// Regenerates annotations, quick ranges and (once per day) tag tables.
    async fn annotations_step(
        &self,
        ctx: &Ctx,
        project: &Project,
        db: &Database,
        writer: &SeriesWriter,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let annotations = annotations::build_annotations(project, &[]);
        let shared_repo = ctx.shared_annotations.then_some(project.main_repo.as_str());
        writer.write_annotations(&annotations, shared_repo).await?;

        let ranges = annotations::build_quick_ranges(project, &annotations, now);
        writer.write_quick_ranges(&ranges).await?;

        if let Some(path) = &self.paths.tags {
            let marker = format!("tags:{}", normalize_name(&project.main_repo));
            if self.due_daily(db, &marker, now).await? || ctx.reset_tsdb {
                self.tags_step(path, db, writer, now).await?;
                db.set_computed(&marker, now).await?;
            }
        }
        Ok(())
    }

    async fn tags_step(
        &self,
        path: &Path,
        db: &Database,
        writer: &SeriesWriter,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: TagsConfig = serde_yaml::from_str(&raw).map_err(ConfigError::Yaml)?;
        for tag in &config.tags {
            let rows = match sqlx::query(&tag.sql).fetch_all(db.read_pool()).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(tag = %tag.name, error = %err, "tag query failed");
                    continue;
                }
            };
            let mut maps = Vec::with_capacity(rows.len());
            for row in &rows {
                use sqlx::Column;
                let mut map = BTreeMap::new();
                for (idx, column) in row.columns().iter().enumerate() {
                    if let Ok(Some(value)) = row.try_get::<Option<String>, _>(idx) {
                        map.insert(normalize_name(column.name()), value);
                    }
                }
                if !map.is_empty() {
                    maps.push(map);
                }
            }
            writer
                .write_tags(&normalize_name(&tag.name), &maps, now)
                .await?;
        }
        Ok(())
    }

    /// Ensures every merged-table column referenced by any tag exists.
    /// Runs once per day, or always on reset.
    async fn columns_step(
        &self,
        ctx: &Ctx,
        project: &str,
        db: &Database,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let Some(path) = &self.paths.columns else {
            return Ok(());
        };
        let marker = format!("columns:{project}");
        if !self.due_daily(db, &marker, now).await? && !ctx.reset_tsdb {
            return Ok(());
        }

        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: ColumnsConfig = serde_yaml::from_str(&raw).map_err(ConfigError::Yaml)?;
        for spec in &config.columns {
            let tag_table = format!("t{}", normalize_name(&spec.tag_table));
            let column = normalize_name(&spec.column);
            let sql = format!("SELECT DISTINCT {column} FROM {tag_table}");
            let rows = match sqlx::query(&sql).fetch_all(db.read_pool()).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(tag_table, error = %err, "tag table read failed");
                    continue;
                }
            };
            let table = format!("s{}", normalize_name(&spec.table));
            for row in &rows {
                let Ok(Some(value)) = row.try_get::<Option<String>, _>(0) else {
                    continue;
                };
                let column_name = format!("{}{}", spec.prefix, normalize_name(&value));
                let alter = format!(
                    "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {column_name} \
                     DOUBLE PRECISION NOT NULL DEFAULT 0.0"
                );
                if let Err(err) = db.exec(&alter).await {
                    // Another writer may add the same column; the
                    // postcondition holds either way.
                    warn!(table, column = %column_name, error = %err, "column add failed");
                }
            }
        }
        db.set_computed(&marker, now).await?;
        Ok(())
    }

    /// Recomputes dashboard template variables.
    async fn vars_step(&self, db: &Database) -> Result<(), SyncError> {
        let Some(path) = &self.paths.vars else {
            return Ok(());
        };
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: VarsConfig = serde_yaml::from_str(&raw).map_err(ConfigError::Yaml)?;
        for var in &config.vars {
            let row = match sqlx::query(&var.sql).fetch_optional(db.read_pool()).await {
                Ok(Some(row)) => row,
                Ok(None) => continue,
                Err(err) => {
                    warn!(var = %var.name, error = %err, "var query failed");
                    continue;
                }
            };
            let value: Option<String> = row.try_get::<Option<String>, _>(0).unwrap_or(None);
            let Some(value) = value else {
                continue;
            };
            let value_i: Option<i64> = value.parse().ok();
            let value_dt: Option<DateTime<Utc>> = value.parse().ok();
            sqlx::query(
                "INSERT INTO gha_vars(name, value_s, value_dt, value_i) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (name) DO UPDATE SET \
                 value_s = EXCLUDED.value_s, value_dt = EXCLUDED.value_dt, \
                 value_i = EXCLUDED.value_i",
            )
            .bind(&var.name)
            .bind(&value)
            .bind(value_dt)
            .bind(value_i)
            .execute(db.pool())
            .await?;
        }
        Ok(())
    }

    async fn due_daily(
        &self,
        db: &Database,
        marker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let last = db.last_computed(marker).await?;
        Ok(match last {
            Some(last) => now - last >= ChronoDuration::hours(24),
            None => true,
        })
    }
}
