//! Environment-driven runtime context.
//!
//! `Ctx` is the explicit bag of knobs threaded through every pipeline stage.
//! It is built from a snapshot of the environment so per-project and
//! per-metric overlays can be applied without mutating process state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use super::ConfigError;

/// A snapshot of environment variables.
pub type EnvMap = HashMap<String, String>;

/// Captures the current process environment.
pub fn env_snapshot() -> EnvMap {
    std::env::vars().collect()
}

/// Applies an override block onto an environment snapshot.
///
/// Key grammar, checked in this order:
/// - `NAME@period` applies only when running for `period`.
/// - `NAME!period` applies for every period except `period`.
/// - `NAME?` applies only when `NAME` is unset or empty.
/// - `NAME??` applies only when `NAME` is unset entirely.
pub fn overlay_env(base: &mut EnvMap, overrides: &BTreeMap<String, String>, period: Option<&str>) {
    for (raw_key, value) in overrides {
        let mut key = raw_key.as_str();

        if let Some((name, only)) = key.split_once('@') {
            if period != Some(only) {
                continue;
            }
            key = name;
        } else if let Some((name, except)) = key.split_once('!') {
            if period == Some(except) {
                continue;
            }
            key = name;
        }

        if let Some(name) = key.strip_suffix("??") {
            if !base.contains_key(name) {
                base.insert(name.to_string(), value.clone());
            }
        } else if let Some(name) = key.strip_suffix('?') {
            let empty = base.get(name).map(|v| v.is_empty()).unwrap_or(true);
            if empty {
                base.insert(name.to_string(), value.clone());
            }
        } else {
            base.insert(key.to_string(), value.clone());
        }
    }
}

/// Runtime context shared by all pipeline stages.
///
/// Field groups mirror the `GHA2DB_*` / `PG_*` variable families. Everything
/// has a default so a bare environment still produces a usable context for
/// tests; `PG_PASS` is the only hard requirement for DB-backed runs.
#[derive(Debug, Clone)]
pub struct Ctx {
    /// Current project name (`GHA2DB_PROJECT`).
    pub project: String,

    // Database settings (PG_*)
    /// Postgres host.
    pub pg_host: String,
    /// Postgres port.
    pub pg_port: u16,
    /// Database name.
    pub pg_db: String,
    /// Database user.
    pub pg_user: String,
    /// Database password.
    pub pg_pass: String,
    /// SSL mode string passed through to the connection URL.
    pub pg_ssl: String,
    /// Optional read-only host; metric SELECTs prefer it when set.
    pub pg_host_ro: Option<String>,

    // Ingestion settings
    /// Parse pre-2015 `EventOld` records instead of the modern layout.
    pub old_format: bool,
    /// Tolerate malformed JSON lines instead of failing the hour.
    pub allow_broken_json: bool,
    /// Worker count for hour-parallel ingestion; 0 means all CPUs.
    pub n_cpus: usize,
    /// Attempt ceiling for archive HTTP downloads.
    pub http_retry: u32,

    // GitHub API settings
    /// Comma-separated OAuth tokens (`GHA2DB_GITHUB_OAUTH`).
    pub github_oauth: Vec<String>,
    /// Attempt ceiling for GitHub API calls.
    pub max_ghapi_retry: u32,
    /// Minimum rate-limit points required before using a token.
    pub min_ghapi_points: u32,
    /// Maximum seconds worth of rate-limit reset the enricher will wait out.
    pub max_ghapi_wait: Duration,
    /// Window defining "recently active" repos, in hours.
    pub recent_range_hours: i64,

    // Metric engine settings
    /// Force recomputation of every period every run.
    pub compute_all: bool,
    /// Restrict recomputation to these period codes when non-empty.
    pub compute_periods: HashSet<String>,
    /// Each period is additionally eligible with probability
    /// `1/recalc_reciprocal` per run.
    pub recalc_reciprocal: u32,
    /// Use probabilistic sampling windows instead of fixed recompute hours.
    pub random_recompute: bool,
    /// Regenerate every series from the project start date.
    pub reset_tsdb: bool,
    /// Parallel histogram worker bound.
    pub max_histograms: usize,

    // Orchestrator settings
    /// Skip the GitHub API enrichment step.
    pub skip_ghapi: bool,
    /// Skip affiliation-derived recomputation.
    pub skip_affs: bool,
    /// Locks older than this are considered orphaned and cleared.
    pub lock_age: Duration,
    /// Mirror operator log lines into the `gha_logs` table.
    pub log_to_db: bool,
    /// Also write annotations into the shared cross-project table.
    pub shared_annotations: bool,
    /// Abort an affiliation import whose inputs were already recorded.
    pub check_imported: bool,
    /// Per-program run-duration limits: name -> (limit, exit code).
    pub max_run_duration: HashMap<String, (Duration, i32)>,
    /// External command keeping local git mirrors current, run per sync.
    pub git_sync_cmd: Option<String>,
}

impl Default for Ctx {
    fn default() -> Self {
        Self {
            project: String::new(),
            pg_host: "localhost".to_string(),
            pg_port: 5432,
            pg_db: "gha".to_string(),
            pg_user: "gha_admin".to_string(),
            pg_pass: String::new(),
            pg_ssl: "disable".to_string(),
            pg_host_ro: None,
            old_format: false,
            allow_broken_json: false,
            n_cpus: 0,
            http_retry: 4,
            github_oauth: Vec::new(),
            max_ghapi_retry: 4,
            min_ghapi_points: 1,
            max_ghapi_wait: Duration::from_secs(600),
            recent_range_hours: 12,
            compute_all: false,
            compute_periods: HashSet::new(),
            recalc_reciprocal: 24,
            random_recompute: false,
            reset_tsdb: false,
            max_histograms: 8,
            skip_ghapi: false,
            skip_affs: false,
            lock_age: Duration::from_secs(12 * 3600),
            log_to_db: true,
            shared_annotations: false,
            check_imported: false,
            max_run_duration: HashMap::new(),
            git_sync_cmd: None,
        }
    }
}

impl Ctx {
    /// Builds a context from the current process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(&env_snapshot())
    }

    /// Builds a context from an environment snapshot.
    pub fn from_env_map(env: &EnvMap) -> Result<Self, ConfigError> {
        let mut ctx = Self::default();

        if let Some(v) = non_empty(env, "GHA2DB_PROJECT") {
            ctx.project = v.to_string();
        }

        if let Some(v) = non_empty(env, "PG_HOST") {
            ctx.pg_host = v.to_string();
        }
        if let Some(v) = non_empty(env, "PG_PORT") {
            ctx.pg_port = parse(v, "PG_PORT")?;
        }
        if let Some(v) = non_empty(env, "PG_DB") {
            ctx.pg_db = v.to_string();
        }
        if let Some(v) = non_empty(env, "PG_USER") {
            ctx.pg_user = v.to_string();
        }
        if let Some(v) = non_empty(env, "PG_PASS") {
            ctx.pg_pass = v.to_string();
        }
        if let Some(v) = non_empty(env, "PG_SSL") {
            ctx.pg_ssl = v.to_string();
        }
        ctx.pg_host_ro = non_empty(env, "PG_HOST_RO").map(|v| v.to_string());

        ctx.old_format = flag(env, "GHA2DB_OLDFMT");
        ctx.allow_broken_json = flag(env, "GHA2DB_ALLOW_BROKEN_JSON");
        if let Some(v) = non_empty(env, "GHA2DB_NCPUS") {
            ctx.n_cpus = parse(v, "GHA2DB_NCPUS")?;
        }
        if let Some(v) = non_empty(env, "GHA2DB_MAX_HTTP_RETRY") {
            ctx.http_retry = parse(v, "GHA2DB_MAX_HTTP_RETRY")?;
        }

        if let Some(v) = non_empty(env, "GHA2DB_GITHUB_OAUTH") {
            if v != "-" {
                ctx.github_oauth = v.split(',').map(|t| t.trim().to_string()).collect();
            }
        }
        if let Some(v) = non_empty(env, "GHA2DB_MAX_GHAPI_RETRY") {
            ctx.max_ghapi_retry = parse(v, "GHA2DB_MAX_GHAPI_RETRY")?;
        }
        if let Some(v) = non_empty(env, "GHA2DB_MIN_GHAPI_POINTS") {
            ctx.min_ghapi_points = parse(v, "GHA2DB_MIN_GHAPI_POINTS")?;
        }
        if let Some(v) = non_empty(env, "GHA2DB_MAX_GHAPI_WAIT") {
            ctx.max_ghapi_wait = Duration::from_secs(parse(v, "GHA2DB_MAX_GHAPI_WAIT")?);
        }
        if let Some(v) = non_empty(env, "GHA2DB_RECENT_RANGE") {
            ctx.recent_range_hours = parse(v, "GHA2DB_RECENT_RANGE")?;
        }

        ctx.compute_all = flag(env, "GHA2DB_COMPUTE_ALL");
        if let Some(v) = non_empty(env, "GHA2DB_COMPUTE_PERIODS") {
            ctx.compute_periods = v.split(',').map(|p| p.trim().to_string()).collect();
        }
        if let Some(v) = non_empty(env, "GHA2DB_RECALC_RECIPROCAL") {
            ctx.recalc_reciprocal = parse(v, "GHA2DB_RECALC_RECIPROCAL")?;
            if ctx.recalc_reciprocal == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "GHA2DB_RECALC_RECIPROCAL".to_string(),
                    message: "must be >= 1".to_string(),
                });
            }
        }
        ctx.random_recompute = flag(env, "GHA2DB_RANDOM_RECOMPUTE");
        ctx.reset_tsdb = flag(env, "GHA2DB_RESETTSDB");
        if let Some(v) = non_empty(env, "GHA2DB_MAX_HISTOGRAMS") {
            ctx.max_histograms = parse(v, "GHA2DB_MAX_HISTOGRAMS")?;
        }

        ctx.skip_ghapi = flag(env, "GHA2DB_GHAPISKIP");
        ctx.skip_affs = flag(env, "GHA2DB_SKIP_AFFS");
        if let Some(v) = non_empty(env, "GHA2DB_MAX_LOCK_AGE") {
            ctx.lock_age = Duration::from_secs(parse(v, "GHA2DB_MAX_LOCK_AGE")?);
        }
        if flag(env, "GHA2DB_SKIP_PIDFILE_LOG") || flag(env, "GHA2DB_SKIP_DB_LOG") {
            ctx.log_to_db = false;
        }
        ctx.shared_annotations = flag(env, "GHA2DB_SHARED_ANNOTATIONS");
        ctx.check_imported = flag(env, "GHA2DB_CHECK_IMPORTED_SHA");
        ctx.git_sync_cmd = non_empty(env, "GHA2DB_GIT_SYNC_CMD").map(|v| v.to_string());

        // Format: "prog1:secs:code,prog2:secs:code"
        if let Some(v) = non_empty(env, "GHA2DB_MAX_RUN_DURATION") {
            for item in v.split(',') {
                let parts: Vec<&str> = item.split(':').collect();
                if parts.len() != 3 {
                    return Err(ConfigError::InvalidValue {
                        key: "GHA2DB_MAX_RUN_DURATION".to_string(),
                        message: format!("expected prog:seconds:code, got '{item}'"),
                    });
                }
                let secs: u64 = parse(parts[1], "GHA2DB_MAX_RUN_DURATION")?;
                let code: i32 = parse(parts[2], "GHA2DB_MAX_RUN_DURATION")?;
                ctx.max_run_duration
                    .insert(parts[0].to_string(), (Duration::from_secs(secs), code));
            }
        }

        Ok(ctx)
    }

    /// Connection URL for the read-write pool.
    pub fn connect_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.pg_user, self.pg_pass, self.pg_host, self.pg_port, self.pg_db, self.pg_ssl
        )
    }

    /// Connection URL for the read-only pool, when configured.
    pub fn connect_url_ro(&self) -> Option<String> {
        self.pg_host_ro.as_ref().map(|host| {
            format!(
                "postgres://{}:{}@{}:{}/{}?sslmode={}",
                self.pg_user, self.pg_pass, host, self.pg_port, self.pg_db, self.pg_ssl
            )
        })
    }

    /// Effective ingestion worker count.
    pub fn workers(&self) -> usize {
        if self.n_cpus > 0 {
            self.n_cpus
        } else {
            num_cpus::get()
        }
    }

    /// Effective histogram worker count.
    pub fn histogram_workers(&self) -> usize {
        num_cpus::get().min(self.max_histograms).max(1)
    }
}

fn non_empty<'a>(env: &'a EnvMap, key: &str) -> Option<&'a str> {
    env.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty())
}

fn flag(env: &EnvMap, key: &str) -> bool {
    non_empty(env, key).is_some()
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn overrides_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_ctx_defaults() {
        let ctx = Ctx::from_env_map(&EnvMap::new()).unwrap();
        assert_eq!(ctx.pg_host, "localhost");
        assert_eq!(ctx.pg_port, 5432);
        assert!(!ctx.reset_tsdb);
        assert_eq!(ctx.recalc_reciprocal, 24);
    }

    #[test]
    fn test_ctx_from_env_map() {
        let env = env_of(&[
            ("GHA2DB_PROJECT", "kubernetes"),
            ("PG_HOST", "db.internal"),
            ("PG_PASS", "secret"),
            ("GHA2DB_OLDFMT", "1"),
            ("GHA2DB_GITHUB_OAUTH", "t1, t2"),
            ("GHA2DB_MAX_RUN_DURATION", "calc_metric:86400:2,sync:43200:0"),
        ]);
        let ctx = Ctx::from_env_map(&env).unwrap();
        assert_eq!(ctx.project, "kubernetes");
        assert_eq!(ctx.pg_host, "db.internal");
        assert!(ctx.old_format);
        assert_eq!(ctx.github_oauth, vec!["t1", "t2"]);
        assert_eq!(
            ctx.max_run_duration.get("calc_metric"),
            Some(&(Duration::from_secs(86400), 2))
        );
    }

    #[test]
    fn test_ctx_rejects_bad_values() {
        let env = env_of(&[("PG_PORT", "not-a-port")]);
        assert!(matches!(
            Ctx::from_env_map(&env),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_connect_url() {
        let env = env_of(&[("PG_PASS", "pw"), ("PG_HOST_RO", "ro.internal")]);
        let ctx = Ctx::from_env_map(&env).unwrap();
        assert_eq!(
            ctx.connect_url(),
            "postgres://gha_admin:pw@localhost:5432/gha?sslmode=disable"
        );
        assert_eq!(
            ctx.connect_url_ro().unwrap(),
            "postgres://gha_admin:pw@ro.internal:5432/gha?sslmode=disable"
        );
    }

    #[test]
    fn test_overlay_plain_override() {
        let mut env = env_of(&[("A", "1")]);
        overlay_env(&mut env, &overrides_of(&[("A", "2"), ("B", "3")]), None);
        assert_eq!(env.get("A").unwrap(), "2");
        assert_eq!(env.get("B").unwrap(), "3");
    }

    #[test]
    fn test_overlay_soft_override() {
        // `?` fills unset or empty, leaves set values alone.
        let mut env = env_of(&[("SET", "x"), ("EMPTY", "")]);
        let ovr = overrides_of(&[("SET?", "y"), ("EMPTY?", "y"), ("UNSET?", "y")]);
        overlay_env(&mut env, &ovr, None);
        assert_eq!(env.get("SET").unwrap(), "x");
        assert_eq!(env.get("EMPTY").unwrap(), "y");
        assert_eq!(env.get("UNSET").unwrap(), "y");
    }

    #[test]
    fn test_overlay_softer_override() {
        // `??` fills only fully-unset variables.
        let mut env = env_of(&[("EMPTY", "")]);
        let ovr = overrides_of(&[("EMPTY??", "y"), ("UNSET??", "y")]);
        overlay_env(&mut env, &ovr, None);
        assert_eq!(env.get("EMPTY").unwrap(), "");
        assert_eq!(env.get("UNSET").unwrap(), "y");
    }

    #[test]
    fn test_overlay_period_scoping() {
        let mut env = EnvMap::new();
        let ovr = overrides_of(&[("ONLY_W@w", "1"), ("NOT_W!w", "1")]);
        overlay_env(&mut env, &ovr, Some("w"));
        assert_eq!(env.get("ONLY_W").map(String::as_str), Some("1"));
        assert!(!env.contains_key("NOT_W"));

        let mut env = EnvMap::new();
        overlay_env(&mut env, &ovr, Some("d"));
        assert!(!env.contains_key("ONLY_W"));
        assert_eq!(env.get("NOT_W").map(String::as_str), Some("1"));
    }
}
