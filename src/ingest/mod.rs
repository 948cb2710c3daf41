//! GitHub Archive ingestion engine.
//!
//! For each archive hour the ingestor downloads
//! `https://data.gharchive.org/<yyyy-mm-dd>-<h>.json.gz`, decompresses it,
//! splits it into newline-delimited JSON events, filters by org/repo/actor
//! and upserts every matching event with all of its denormalized children.
//! Hours are processed in parallel, one worker per hour, and marked in
//! `gha_parsed` once done so re-runs resume where they left off.

pub mod roles;
pub mod writer;

use std::collections::HashSet;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use flate2::read::GzDecoder;
use regex::Regex;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{Ctx, HideMap};
use crate::ghevent::{Event, EventOld};
use crate::retry::RetryPolicy;
use crate::storage::{Database, DatabaseError};

use writer::EventWriter;

const ARCHIVE_BASE_URL: &str = "https://data.gharchive.org";

/// Errors that can occur during ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Archive download failed after retries.
    #[error("Archive fetch failed for {hour}: {message}")]
    FetchFailed { hour: String, message: String },

    /// Gzip stream could not be decoded.
    #[error("Archive decode failed for {hour}: {message}")]
    DecodeFailed { hour: String, message: String },

    /// A JSON line could not be parsed and broken records are not allowed.
    #[error("Broken JSON in {hour}: {message}")]
    BrokenJson { hour: String, message: String },

    /// Database failure.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Query failure.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Invalid filter specification.
    #[error("Invalid filter '{spec}': {message}")]
    InvalidFilter { spec: String, message: String },
}

/// One archive hour, normalized to the top of the hour UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchiveHour(pub DateTime<Utc>);

impl ArchiveHour {
    /// Truncates a timestamp to its archive hour.
    pub fn of(dt: DateTime<Utc>) -> Self {
        Self(
            dt.with_minute(0)
                .and_then(|d| d.with_second(0))
                .and_then(|d| d.with_nanosecond(0))
                .unwrap_or(dt),
        )
    }

    /// File key as used by the archive: hour carries no leading zero.
    pub fn file_key(&self) -> String {
        format!("{}-{}", self.0.format("%Y-%m-%d"), self.0.hour())
    }

    /// Download URL for this hour.
    pub fn url(&self) -> String {
        format!("{ARCHIVE_BASE_URL}/{}.json.gz", self.file_key())
    }

    /// The following hour.
    pub fn next(&self) -> Self {
        Self(self.0 + ChronoDuration::hours(1))
    }
}

/// An org/repo/actor allow-filter: everything, a literal set, or a regex.
#[derive(Debug, Clone)]
pub enum Filter {
    /// No filtering.
    Any,
    /// Comma-separated literal set.
    Set(HashSet<String>),
    /// Anchored regular expression.
    Pattern(Regex),
}

impl Filter {
    /// Parses a filter spec: empty means everything, a `regexp:` prefix
    /// compiles the rest, anything else is a comma-separated literal set.
    pub fn parse(spec: &str) -> Result<Self, IngestError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Filter::Any);
        }
        if let Some(pattern) = spec.strip_prefix("regexp:") {
            let re = Regex::new(pattern).map_err(|e| IngestError::InvalidFilter {
                spec: spec.to_string(),
                message: e.to_string(),
            })?;
            return Ok(Filter::Pattern(re));
        }
        Ok(Filter::Set(
            spec.split(',').map(|s| s.trim().to_string()).collect(),
        ))
    }

    /// Whether a value passes the filter.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Filter::Any => true,
            Filter::Set(set) => set.contains(value),
            Filter::Pattern(re) => re.is_match(value),
        }
    }
}

/// Combined event filters.
#[derive(Debug, Clone)]
pub struct Filters {
    /// Org filter; matched against the org login and the repo owner prefix.
    pub org: Filter,
    /// Repo filter; matched against `org/name` and the bare name.
    pub repo: Filter,
    /// Actor filter; matched against the (unhidden) actor login.
    pub actor: Filter,
}

impl Filters {
    /// A filter set matching everything.
    pub fn all() -> Self {
        Self {
            org: Filter::Any,
            repo: Filter::Any,
            actor: Filter::Any,
        }
    }

    /// Whether an event passes all three filters.
    pub fn matches(&self, event: &Event) -> bool {
        let repo_name = event.repo.name.as_str();
        let owner = repo_name.split('/').next().unwrap_or("");
        let org_value = event
            .org
            .as_ref()
            .map(|o| o.login.as_str())
            .unwrap_or(owner);

        let org_ok = self.org.matches(org_value) || self.org.matches(owner);
        let repo_ok = self.repo.matches(repo_name)
            || repo_name
                .split('/')
                .nth(1)
                .map(|bare| self.repo.matches(bare))
                .unwrap_or(false);
        let actor_ok = self.actor.matches(&event.actor.login);
        org_ok && repo_ok && actor_ok
    }
}

/// Per-run ingestion counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    /// JSON lines seen.
    pub seen: AtomicU64,
    /// Events passing the filters.
    pub matched: AtomicU64,
    /// Events newly inserted.
    pub inserted: AtomicU64,
    /// Broken JSON lines tolerated.
    pub broken: AtomicU64,
    /// Hours that returned 404 and were marked parsed anyway.
    pub missing_hours: AtomicU64,
}

/// Internal HTTP failure carrying its retry classification.
#[derive(Debug)]
struct FetchError {
    message: String,
    transient: bool,
}

impl FetchError {
    fn transient(message: String) -> Self {
        Self {
            message,
            transient: true,
        }
    }

    fn fatal(message: String) -> Self {
        Self {
            message,
            transient: false,
        }
    }

    fn is_transient(err: &FetchError) -> bool {
        err.transient
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The hourly archive ingestor.
pub struct Ingestor {
    ctx: Ctx,
    db: Database,
    http: Client,
    filters: Filters,
    hide: Arc<HideMap>,
    skip_hours: HashSet<String>,
}

impl Ingestor {
    /// Creates an ingestor.
    pub fn new(
        ctx: Ctx,
        db: Database,
        filters: Filters,
        hide: Arc<HideMap>,
        skip_hours: HashSet<String>,
    ) -> Self {
        Self {
            ctx,
            db,
            http: Client::builder()
                .timeout(Duration::from_secs(180))
                .user_agent("devstats/0.1")
                .build()
                .unwrap_or_else(|_| Client::new()),
            filters,
            hide,
            skip_hours,
        }
    }

    /// Ingests every unparsed hour in `[from, to]`, bounded by the worker
    /// count. Hour ordering is not guaranteed.
    pub async fn run(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Arc<IngestStats>, IngestError> {
        let parsed = self.parsed_hours(from, to).await?;
        let mut hours = Vec::new();
        let mut hour = ArchiveHour::of(from);
        let last = ArchiveHour::of(to);
        while hour.0 <= last.0 {
            let key = hour.file_key();
            if !parsed.contains(&hour.0) && !self.skip_hours.contains(&key) {
                hours.push(hour);
            }
            hour = hour.next();
        }
        info!(
            hours = hours.len(),
            workers = self.ctx.workers(),
            "ingesting archive range"
        );

        let stats = Arc::new(IngestStats::default());
        let semaphore = Arc::new(Semaphore::new(self.ctx.workers()));
        let writer = Arc::new(EventWriter::new(self.db.clone(), self.hide.clone()));
        let mut handles = Vec::with_capacity(hours.len());

        for hour in hours {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore");
            let this = self.clone_for_worker();
            let stats = stats.clone();
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.process_hour(hour, &writer, &stats).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(result) => result?,
                Err(join_err) => {
                    return Err(IngestError::FetchFailed {
                        hour: "?".to_string(),
                        message: join_err.to_string(),
                    })
                }
            }
        }

        info!(
            seen = stats.seen.load(Ordering::Relaxed),
            matched = stats.matched.load(Ordering::Relaxed),
            inserted = stats.inserted.load(Ordering::Relaxed),
            broken = stats.broken.load(Ordering::Relaxed),
            "ingestion finished"
        );
        Ok(stats)
    }

    fn clone_for_worker(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            db: self.db.clone(),
            http: self.http.clone(),
            filters: self.filters.clone(),
            hide: self.hide.clone(),
            skip_hours: self.skip_hours.clone(),
        }
    }

    /// Downloads, decodes and writes one archive hour.
    async fn process_hour(
        &self,
        hour: ArchiveHour,
        writer: &EventWriter,
        stats: &IngestStats,
    ) -> Result<(), IngestError> {
        let key = hour.file_key();
        let body = match self.fetch_hour(&hour).await? {
            Some(bytes) => bytes,
            None => {
                // Missing hour: remember it so we never re-fetch.
                warn!(hour = %key, "archive hour missing (404), marking parsed");
                stats.missing_hours.fetch_add(1, Ordering::Relaxed);
                self.mark_parsed(&hour).await?;
                return Ok(());
            }
        };

        let mut decoder = GzDecoder::new(body.as_slice());
        let mut raw = String::new();
        decoder
            .read_to_string(&mut raw)
            .map_err(|e| IngestError::DecodeFailed {
                hour: key.clone(),
                message: e.to_string(),
            })?;

        for line in raw.lines() {
            if line.is_empty() {
                continue;
            }
            stats.seen.fetch_add(1, Ordering::Relaxed);
            let mut event = match self.parse_line(line) {
                Ok(event) => event,
                Err(message) => {
                    if self.ctx.allow_broken_json {
                        stats.broken.fetch_add(1, Ordering::Relaxed);
                        debug!(hour = %key, error = %message, "skipping broken line");
                        continue;
                    }
                    return Err(IngestError::BrokenJson {
                        hour: key.clone(),
                        message,
                    });
                }
            };
            if !self.filters.matches(&event) {
                continue;
            }
            stats.matched.fetch_add(1, Ordering::Relaxed);
            if self.ctx.old_format && event.actor.id < 0 && !event.actor.login.is_empty() {
                // Old records carry a login only; reuse the newest actor
                // row with that login before minting a synthetic one.
                event.actor.id = writer.actor_id_for_login(&event.actor.login).await?;
            }
            if writer.write_event(&event).await? {
                stats.inserted.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.mark_parsed(&hour).await?;
        debug!(hour = %key, "hour done");
        Ok(())
    }

    fn parse_line(&self, line: &str) -> Result<Event, String> {
        if self.ctx.old_format {
            serde_json::from_str::<EventOld>(line)
                .map(|old| old.normalize())
                .map_err(|e| e.to_string())
        } else {
            serde_json::from_str::<Event>(line).map_err(|e| e.to_string())
        }
    }

    /// Fetches one hour. `None` means the archive has no file for it
    /// (404-like); transient HTTP failures retry with backoff and jitter.
    async fn fetch_hour(&self, hour: &ArchiveHour) -> Result<Option<Vec<u8>>, IngestError> {
        let policy = RetryPolicy::new(self.ctx.http_retry)
            .with_initial_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(120));
        let url = hour.url();
        policy
            .run("archive-fetch", FetchError::is_transient, || async {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| FetchError::transient(e.to_string()))?;
                let status = response.status();
                if status.as_u16() == 404 || status.as_u16() == 410 {
                    return Ok(None);
                }
                if status.is_server_error() {
                    return Err(FetchError::transient(format!("HTTP {status}")));
                }
                if !status.is_success() {
                    return Err(FetchError::fatal(format!("HTTP {status}")));
                }
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| FetchError::transient(e.to_string()))?;
                Ok(Some(bytes.to_vec()))
            })
            .await
            .map_err(|e| IngestError::FetchFailed {
                hour: hour.file_key(),
                message: e.message,
            })
    }

    async fn parsed_hours(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashSet<DateTime<Utc>>, IngestError> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT dt FROM gha_parsed WHERE dt >= $1 AND dt <= $2")
            .bind(from)
            .bind(to)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.iter().map(|r| r.get::<DateTime<Utc>, _>("dt")).collect())
    }

    async fn mark_parsed(&self, hour: &ArchiveHour) -> Result<(), IngestError> {
        sqlx::query("INSERT INTO gha_parsed(dt) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(hour.0)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ghevent::{EventActor, EventRepo};
    use chrono::TimeZone;

    fn event(org: Option<&str>, repo: &str, actor: &str) -> Event {
        Event {
            id: "1".to_string(),
            event_type: "PushEvent".to_string(),
            public: true,
            created_at: Utc::now(),
            actor: EventActor {
                id: 1,
                login: actor.to_string(),
            },
            repo: EventRepo {
                id: 2,
                name: repo.to_string(),
            },
            org: org.map(|login| crate::ghevent::EventOrg {
                id: 3,
                login: login.to_string(),
            }),
            payload: Default::default(),
        }
    }

    #[test]
    fn test_archive_hour_key_no_leading_zero() {
        let dt = Utc.with_ymd_and_hms(2020, 3, 1, 5, 30, 10).unwrap();
        let hour = ArchiveHour::of(dt);
        assert_eq!(hour.file_key(), "2020-03-01-5");
        assert_eq!(hour.url(), "https://data.gharchive.org/2020-03-01-5.json.gz");
        assert_eq!(hour.next().file_key(), "2020-03-01-6");

        let dt = Utc.with_ymd_and_hms(2020, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(ArchiveHour::of(dt).file_key(), "2020-03-01-12");
    }

    #[test]
    fn test_filter_parse() {
        assert!(matches!(Filter::parse("").unwrap(), Filter::Any));
        let set = Filter::parse("kubernetes, prometheus").unwrap();
        assert!(set.matches("kubernetes"));
        assert!(set.matches("prometheus"));
        assert!(!set.matches("etcd"));
        let re = Filter::parse(r"regexp:^kube.*$").unwrap();
        assert!(re.matches("kubernetes"));
        assert!(!re.matches("prometheus"));
        assert!(Filter::parse("regexp:[broken").is_err());
    }

    #[test]
    fn test_filters_match_org_and_repo() {
        let filters = Filters {
            org: Filter::parse("kubernetes").unwrap(),
            repo: Filter::Any,
            actor: Filter::Any,
        };
        assert!(filters.matches(&event(Some("kubernetes"), "kubernetes/kubernetes", "alice")));
        // Owner prefix counts when the event has no org block.
        assert!(filters.matches(&event(None, "kubernetes/minikube", "alice")));
        assert!(!filters.matches(&event(Some("prometheus"), "prometheus/prometheus", "alice")));
    }

    #[test]
    fn test_filters_match_bare_repo_name() {
        let filters = Filters {
            org: Filter::Any,
            repo: Filter::parse("kubernetes/kubernetes,minikube").unwrap(),
            actor: Filter::Any,
        };
        assert!(filters.matches(&event(None, "kubernetes/kubernetes", "a")));
        assert!(filters.matches(&event(None, "kubernetes/minikube", "a")));
        assert!(!filters.matches(&event(None, "kubernetes/kops", "a")));
    }

    #[test]
    fn test_filters_actor() {
        let filters = Filters {
            org: Filter::Any,
            repo: Filter::Any,
            actor: Filter::parse("alice,bob").unwrap(),
        };
        assert!(filters.matches(&event(None, "o/r", "alice")));
        assert!(!filters.matches(&event(None, "o/r", "mallory")));
    }
}

