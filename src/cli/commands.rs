//! CLI command definitions for devstats.
//!
//! Exit codes are part of the operator contract:
//! 0 success, 1 configuration error, 2 database unreachable,
//! 3 inputs already imported (affiliation guard), 4 unrecoverable API
//! failure, 5 other runtime failure. A `GHA2DB_MAX_RUN_DURATION` limit for
//! the running subcommand converts a timeout into its configured code.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use clap::Parser;
use tracing::{error, info};

use crate::affs::{AffsError, AffsImporter};
use crate::config::{load_skip_hours, Ctx, HideMap, ProjectsConfig};
use crate::enrich::Enricher;
use crate::ingest::{Filter, Filters, Ingestor};
use crate::metrics::{MetricEngine, MetricsConfig};
use crate::storage::{schema, Database, SeriesWriter};
use crate::sync::{Orchestrator, SyncError, SyncPaths};

/// GitHub Archive warehouse: ingestion, enrichment, affiliations and
/// time-series metrics.
#[derive(Parser)]
#[command(name = "devstats")]
#[command(about = "GitHub Archive analytics pipeline")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Apply the warehouse schema (idempotent).
    Structure,

    /// Ingest GitHub Archive hours into the warehouse.
    Ingest(IngestArgs),

    /// Refresh recently active repos from the GitHub API.
    Enrich(EnrichArgs),

    /// Import the contributor affiliations feed.
    #[command(alias = "affs")]
    Affiliations(AffiliationsArgs),

    /// Run the metric catalog for one project.
    Calc(CalcArgs),

    /// Run the full pipeline for one project (or every enabled project).
    Sync(SyncArgs),
}

#[derive(Parser, Debug)]
pub struct IngestArgs {
    /// First archive date (YYYY-MM-DD).
    pub date_from: NaiveDate,
    /// First archive hour of that date (0-23).
    #[arg(default_value = "0")]
    pub hour_from: u32,
    /// Last archive date (YYYY-MM-DD); defaults to date_from.
    pub date_to: Option<NaiveDate>,
    /// Last archive hour of that date.
    #[arg(default_value = "23")]
    pub hour_to: u32,

    /// Org filter: comma-separated list or `regexp:` pattern.
    #[arg(short, long, default_value = "")]
    pub org: String,
    /// Repo filter: comma-separated list or `regexp:` pattern.
    #[arg(short, long, default_value = "")]
    pub repo: String,
    /// Actor filter: comma-separated list or `regexp:` pattern.
    #[arg(short, long, default_value = "")]
    pub actor: String,

    /// GDPR hide-map CSV (`sha1,anon`).
    #[arg(long)]
    pub hide: Option<PathBuf>,
    /// Skip-dates YAML.
    #[arg(long)]
    pub skip_dates: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct EnrichArgs {
    /// Refresh repos active within the trailing N hours.
    #[arg(long)]
    pub recent_hours: Option<i64>,
    /// GDPR hide-map CSV.
    #[arg(long)]
    pub hide: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct AffiliationsArgs {
    /// Contributor feed JSON.
    pub feed: PathBuf,
    /// Acquisitions YAML.
    #[arg(long)]
    pub acquisitions: Option<PathBuf>,
    /// GDPR hide-map CSV.
    #[arg(long)]
    pub hide: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct CalcArgs {
    /// Project name from the projects catalog.
    pub project: String,
    /// Metric catalog YAML.
    #[arg(long, default_value = "metrics.yaml")]
    pub metrics: PathBuf,
    /// Projects catalog YAML.
    #[arg(long, default_value = "projects.yaml")]
    pub projects: PathBuf,
}

#[derive(Parser, Debug)]
pub struct SyncArgs {
    /// Project name; omit to sync every enabled project.
    pub project: Option<String>,
    /// Projects catalog YAML.
    #[arg(long, default_value = "projects.yaml")]
    pub projects: PathBuf,
    /// Metric catalog YAML.
    #[arg(long, default_value = "metrics.yaml")]
    pub metrics: PathBuf,
    /// Tags catalog YAML.
    #[arg(long)]
    pub tags: Option<PathBuf>,
    /// Vars catalog YAML.
    #[arg(long)]
    pub vars: Option<PathBuf>,
    /// Columns catalog YAML.
    #[arg(long)]
    pub columns: Option<PathBuf>,
    /// Skip-dates YAML.
    #[arg(long)]
    pub skip_dates: Option<PathBuf>,
    /// GDPR hide-map CSV.
    #[arg(long)]
    pub hide: Option<PathBuf>,
}

/// Exit codes of the operator contract.
mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const DATABASE: i32 = 2;
    pub const ALREADY_IMPORTED: i32 = 3;
    pub const API: i32 = 4;
    pub const RUNTIME: i32 = 5;
}

impl Commands {
    fn prog(&self) -> &'static str {
        match self {
            Commands::Structure => "structure",
            Commands::Ingest(_) => "gha2db",
            Commands::Enrich(_) => "ghapi2db",
            Commands::Affiliations(_) => "import_affs",
            Commands::Calc(_) => "calc_metric",
            Commands::Sync(_) => "sync",
        }
    }
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs a parsed CLI, returning the process exit code.
pub async fn run_with_cli(cli: Cli) -> i32 {
    let ctx = match Ctx::from_env() {
        Ok(ctx) => ctx,
        Err(err) => {
            error!(error = %err, "configuration error");
            return exit_code::CONFIG;
        }
    };

    let prog = cli.command.prog();
    let limit = ctx.max_run_duration.get(prog).copied();
    let work = run_command(ctx, cli.command);

    match limit {
        Some((duration, code)) => match tokio::time::timeout(duration, work).await {
            Ok(result) => result,
            Err(_) => {
                error!(prog, limit = ?duration, "run duration limit exceeded");
                code
            }
        },
        None => work.await,
    }
}

async fn run_command(ctx: Ctx, command: Commands) -> i32 {
    match command {
        Commands::Structure => {
            let db = match connect(&ctx).await {
                Ok(db) => db,
                Err(code) => return code,
            };
            match schema::structure(&db).await {
                Ok(()) => exit_code::OK,
                Err(err) => {
                    error!(error = %err, "structure failed");
                    exit_code::DATABASE
                }
            }
        }
        Commands::Ingest(args) => run_ingest(ctx, args).await,
        Commands::Enrich(args) => run_enrich(ctx, args).await,
        Commands::Affiliations(args) => run_affiliations(ctx, args).await,
        Commands::Calc(args) => run_calc(ctx, args).await,
        Commands::Sync(args) => run_sync(ctx, args).await,
    }
}

async fn connect(ctx: &Ctx) -> Result<Database, i32> {
    Database::connect(ctx).await.map_err(|err| {
        error!(error = %err, "database unreachable");
        exit_code::DATABASE
    })
}

fn load_hide(path: &Option<PathBuf>) -> Result<Arc<HideMap>, i32> {
    match path {
        Some(path) => match HideMap::load(path) {
            Ok(map) => Ok(Arc::new(map)),
            Err(err) => {
                error!(error = %err, "hide config error");
                Err(exit_code::CONFIG)
            }
        },
        None => Ok(Arc::new(HideMap::empty())),
    }
}

fn day_hour(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(
        &date
            .and_hms_opt(hour.min(23), 0, 0)
            .expect("validated hour"),
    )
}

async fn run_ingest(ctx: Ctx, args: IngestArgs) -> i32 {
    let filters = match (
        Filter::parse(&args.org),
        Filter::parse(&args.repo),
        Filter::parse(&args.actor),
    ) {
        (Ok(org), Ok(repo), Ok(actor)) => Filters { org, repo, actor },
        (Err(err), _, _) | (_, Err(err), _) | (_, _, Err(err)) => {
            error!(error = %err, "bad filter");
            return exit_code::CONFIG;
        }
    };
    let hide = match load_hide(&args.hide) {
        Ok(hide) => hide,
        Err(code) => return code,
    };
    let skip_hours = match &args.skip_dates {
        Some(path) => match load_skip_hours(path) {
            Ok(hours) => hours,
            Err(err) => {
                error!(error = %err, "skip-dates error");
                return exit_code::CONFIG;
            }
        },
        None => Default::default(),
    };
    let db = match connect(&ctx).await {
        Ok(db) => db,
        Err(code) => return code,
    };
    if let Err(err) = schema::structure(&db).await {
        error!(error = %err, "structure failed");
        return exit_code::DATABASE;
    }

    let from = day_hour(args.date_from, args.hour_from);
    let to = day_hour(args.date_to.unwrap_or(args.date_from), args.hour_to);
    let ingestor = Ingestor::new(ctx, db, filters, hide, skip_hours);
    match ingestor.run(from, to).await {
        Ok(_) => exit_code::OK,
        Err(err) => {
            error!(error = %err, "ingestion failed");
            exit_code::RUNTIME
        }
    }
}

async fn run_enrich(ctx: Ctx, args: EnrichArgs) -> i32 {
    let hide = match load_hide(&args.hide) {
        Ok(hide) => hide,
        Err(code) => return code,
    };
    let db = match connect(&ctx).await {
        Ok(db) => db,
        Err(code) => return code,
    };
    let recent = args.recent_hours.unwrap_or(ctx.recent_range_hours);
    let cutoff = Utc::now() - ChronoDuration::hours(recent);
    let enricher = match Enricher::new(ctx, db, hide) {
        Ok(enricher) => Arc::new(enricher),
        Err(err) => {
            error!(error = %err, "enricher setup failed");
            return exit_code::CONFIG;
        }
    };
    match enricher.run(cutoff).await {
        Ok(_) => exit_code::OK,
        Err(err) => {
            error!(error = %err, "enrichment failed");
            exit_code::API
        }
    }
}

async fn run_affiliations(ctx: Ctx, args: AffiliationsArgs) -> i32 {
    let hide = match load_hide(&args.hide) {
        Ok(hide) => hide,
        Err(code) => return code,
    };
    let db = match connect(&ctx).await {
        Ok(db) => db,
        Err(code) => return code,
    };
    let importer = AffsImporter::new(ctx, db, hide);
    match importer
        .import(&args.feed, args.acquisitions.as_deref())
        .await
    {
        Ok(_) => exit_code::OK,
        Err(AffsError::AlreadyImported) => {
            info!("feed and acquisitions already imported");
            exit_code::ALREADY_IMPORTED
        }
        Err(AffsError::Acquisitions(err)) => {
            error!(error = %err, "acquisitions config invalid");
            exit_code::CONFIG
        }
        Err(err) => {
            error!(error = %err, "affiliation import failed");
            exit_code::RUNTIME
        }
    }
}

async fn run_calc(ctx: Ctx, args: CalcArgs) -> i32 {
    let projects = match ProjectsConfig::load(&args.projects) {
        Ok(projects) => projects,
        Err(err) => {
            error!(error = %err, "projects config error");
            return exit_code::CONFIG;
        }
    };
    let project = match projects.get(&args.project) {
        Ok(project) => project.clone(),
        Err(err) => {
            error!(error = %err, "unknown project");
            return exit_code::CONFIG;
        }
    };
    let metrics = match MetricsConfig::load(&args.metrics) {
        Ok(metrics) => metrics,
        Err(err) => {
            error!(error = %err, "metrics config error");
            return exit_code::CONFIG;
        }
    };
    let db = match connect(&ctx).await {
        Ok(db) => db,
        Err(code) => return code,
    };
    let writer = Arc::new(SeriesWriter::new(db));
    let engine = Arc::new(MetricEngine::new(ctx, writer));
    let start = Utc.from_utc_datetime(
        &project.start_date.and_hms_opt(0, 0, 0).expect("midnight"),
    );
    match engine
        .run(&metrics, &args.project, start, Utc::now())
        .await
    {
        Ok(_) => exit_code::OK,
        Err(err) => {
            error!(error = %err, "metric run failed");
            exit_code::RUNTIME
        }
    }
}

async fn run_sync(ctx: Ctx, args: SyncArgs) -> i32 {
    let paths = SyncPaths {
        projects: args.projects.clone(),
        metrics: args.metrics,
        tags: args.tags,
        vars: args.vars,
        columns: args.columns,
        skip_dates: args.skip_dates,
        hide: args.hide,
    };
    let names = match &args.project {
        Some(name) => vec![name.clone()],
        None => match ProjectsConfig::load(&args.projects) {
            Ok(projects) => projects.enabled().iter().map(|s| s.to_string()).collect(),
            Err(err) => {
                error!(error = %err, "projects config error");
                return exit_code::CONFIG;
            }
        },
    };

    let orchestrator = Orchestrator::new(ctx, paths);
    for name in names {
        info!(project = %name, "syncing");
        match orchestrator.sync_project(&name).await {
            Ok(()) => {}
            Err(SyncError::Locked(name)) => {
                error!(project = %name, "sync already running");
                return exit_code::RUNTIME;
            }
            Err(SyncError::Config(err)) => {
                error!(error = %err, "configuration error");
                return exit_code::CONFIG;
            }
            Err(SyncError::Database(err)) => {
                error!(error = %err, "database failure");
                return exit_code::DATABASE;
            }
            Err(SyncError::Enrich(err)) => {
                error!(error = %err, "API failure");
                return exit_code::API;
            }
            Err(err) => {
                error!(error = %err, "sync failed");
                return exit_code::RUNTIME;
            }
        }
    }
    exit_code::OK
}
