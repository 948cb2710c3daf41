//! GitHub API enricher.
//!
//! The archive tells us what happened; the API tells us where things stand
//! now. For every repo with recent activity the enricher pages through
//! issue events since a cutoff, refreshes issue/PR state, reconciles commit
//! author/committer linkage and updates the repo's license and language
//! statistics.
//!
//! API access runs through a token pool with per-token rate tracking and a
//! dynamically adjusted worker bound: abuse detection (403 with
//! retry-after semantics) halves into backoff and decrements concurrency,
//! successes grow it back to the ceiling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{Ctx, HideMap};
use crate::ghevent::{Actor, Event, EventActor, EventRepo, Payload};
use crate::ingest::writer::EventWriter;
use crate::storage::{Database, DatabaseError};
use crate::utils::clean_text;

const GITHUB_API_BASE: &str = "https://api.github.com";

/// Event type recorded for API-sourced (non-archive) rows.
const ARTIFICIAL_EVENT: &str = "ArtificialEvent";

/// Provenance marker for API-sourced emails and names.
const ORIGIN_API: i16 = 1;

/// Errors that can occur during API enrichment.
#[derive(Debug, Error)]
pub enum EnrichError {
    /// HTTP-level failure after retries.
    #[error("API request failed: {0}")]
    Http(String),

    /// All tokens are exhausted and the reset is too far away.
    #[error("Rate limited: reset in {0:?} exceeds the configured wait")]
    RateLimited(Duration),

    /// The repository is gone (404); terminal for that repo only.
    #[error("Repository not found: {0}")]
    NotFound(String),

    /// Retry ceiling exceeded.
    #[error("Giving up on {what} after {attempts} attempts: {message}")]
    Fatal {
        what: String,
        attempts: u32,
        message: String,
    },

    /// No tokens configured.
    #[error("No GitHub OAuth tokens configured")]
    NoTokens,

    /// Database failure.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Query failure.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Ingest-writer failure while upserting enriched state.
    #[error("Writer error: {0}")]
    Writer(#[from] crate::ingest::IngestError),
}

/// Outcome of a single API page fetch, mirroring the per-page state machine.
enum PageState {
    Ok(serde_json::Value),
    Abuse { retry_after: Option<u64> },
    NotFound,
    RateLow { reset_in: Duration },
    Err(String),
}

/// Per-token rate-limit snapshot.
#[derive(Debug, Clone, Copy)]
struct RateInfo {
    remaining: i64,
    reset: DateTime<Utc>,
}

/// Pool of OAuth tokens with a "best token" hint.
pub struct TokenPool {
    tokens: Vec<String>,
    http: Client,
}

impl TokenPool {
    /// Creates a pool; fails when no tokens are supplied.
    pub fn new(tokens: Vec<String>, http: Client) -> Result<Self, EnrichError> {
        if tokens.is_empty() {
            return Err(EnrichError::NoTokens);
        }
        Ok(Self { tokens, http })
    }

    /// Number of tokens in the pool.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True when the pool is empty (never, by construction).
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Queries rate-limit state for every token and returns the index of
    /// the one with the most remaining points, with its snapshot.
    async fn hint(&self) -> Result<(usize, RateInfo), EnrichError> {
        let mut best: Option<(usize, RateInfo)> = None;
        for (i, token) in self.tokens.iter().enumerate() {
            let info = match self.rate_of(token).await {
                Ok(info) => info,
                Err(err) => {
                    debug!(token_index = i, error = %err, "rate query failed, skipping token");
                    continue;
                }
            };
            let better = match best {
                Some((_, current)) => info.remaining > current.remaining,
                None => true,
            };
            if better {
                best = Some((i, info));
            }
        }
        best.ok_or_else(|| EnrichError::Http("all rate-limit queries failed".to_string()))
    }

    async fn rate_of(&self, token: &str) -> Result<RateInfo, EnrichError> {
        #[derive(Deserialize)]
        struct RateLimit {
            resources: Resources,
        }
        #[derive(Deserialize)]
        struct Resources {
            core: Core,
        }
        #[derive(Deserialize)]
        struct Core {
            remaining: i64,
            reset: i64,
        }

        let response = self
            .http
            .get(format!("{GITHUB_API_BASE}/rate_limit"))
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| EnrichError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EnrichError::Http(format!(
                "rate_limit returned {}",
                response.status()
            )));
        }
        let parsed: RateLimit = response
            .json()
            .await
            .map_err(|e| EnrichError::Http(e.to_string()))?;
        Ok(RateInfo {
            remaining: parsed.resources.core.remaining,
            reset: Utc
                .timestamp_opt(parsed.resources.core.reset, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    fn token(&self, index: usize) -> &str {
        &self.tokens[index]
    }
}

/// Shared worker bound that shrinks on abuse detection and grows back on
/// success, floor 1, ceiling `min(cpus, 16)`.
pub struct AdaptiveLimiter {
    semaphore: Arc<Semaphore>,
    allowed: AtomicUsize,
    ceiling: usize,
}

impl AdaptiveLimiter {
    /// Creates a limiter at its ceiling.
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling)),
            allowed: AtomicUsize::new(ceiling),
            ceiling,
        }
    }

    /// Current allowed concurrency.
    pub fn allowed(&self) -> usize {
        self.allowed.load(Ordering::SeqCst)
    }

    /// Acquires a worker slot.
    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore closed")
    }

    /// Abuse detected: burn one permit (floor 1).
    pub fn on_abuse(&self) {
        let current = self.allowed.load(Ordering::SeqCst);
        if current <= 1 {
            return;
        }
        if self
            .allowed
            .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            match self.semaphore.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    // All permits are in flight; retire one as it returns.
                    let semaphore = self.semaphore.clone();
                    tokio::spawn(async move {
                        if let Ok(permit) = semaphore.acquire().await {
                            permit.forget();
                        }
                    });
                }
            }
        }
    }

    /// Successful call: grow back toward the ceiling.
    pub fn on_success(&self) {
        let current = self.allowed.load(Ordering::SeqCst);
        if current >= self.ceiling {
            return;
        }
        if self
            .allowed
            .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.semaphore.add_permits(1);
        }
    }
}

/// Per-run enrichment counters.
#[derive(Debug, Default)]
pub struct EnrichStats {
    /// Repos processed.
    pub repos: AtomicU64,
    /// Issue events applied.
    pub issue_events: AtomicU64,
    /// Duplicate GitHub event IDs skipped.
    pub duplicate_events: AtomicU64,
    /// PR details refreshed.
    pub prs: AtomicU64,
    /// Commits reconciled.
    pub commits: AtomicU64,
    /// Repos whose license was updated.
    pub licenses: AtomicU64,
    /// Repos whose language map was updated.
    pub languages: AtomicU64,
    /// Repos that turned out missing (404).
    pub missing_repos: AtomicU64,
}

/// A repo recently seen in the event stream.
#[derive(Debug, Clone)]
pub struct RecentRepo {
    pub id: i64,
    pub name: String,
}

/// The GitHub API enricher.
pub struct Enricher {
    ctx: Ctx,
    db: Database,
    http: Client,
    tokens: Arc<TokenPool>,
    limiter: Arc<AdaptiveLimiter>,
    writer: Arc<EventWriter>,
    /// `event_id -> (issue_id, seen count)`; catches duplicates across
    /// paginated fetches. Process-local: cross-shard duplicates are
    /// absorbed by the warehouse unique keys instead.
    dedup: Mutex<HashMap<i64, (i64, u32)>>,
}

impl Enricher {
    /// Creates an enricher.
    pub fn new(ctx: Ctx, db: Database, hide: Arc<HideMap>) -> Result<Self, EnrichError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent("devstats/0.1")
            .build()
            .unwrap_or_else(|_| Client::new());
        let tokens = Arc::new(TokenPool::new(ctx.github_oauth.clone(), http.clone())?);
        let ceiling = num_cpus::get().min(16);
        Ok(Self {
            writer: Arc::new(EventWriter::new(db.clone(), hide)),
            limiter: Arc::new(AdaptiveLimiter::new(ceiling)),
            ctx,
            db,
            http,
            tokens,
            dedup: Mutex::new(HashMap::new()),
        })
    }

    /// Repos with any event since the cutoff.
    pub async fn recent_repos(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<RecentRepo>, EnrichError> {
        let rows = sqlx::query(
            "SELECT DISTINCT repo_id, dup_repo_name FROM gha_events WHERE created_at >= $1",
        )
        .bind(cutoff)
        .fetch_all(self.db.read_pool())
        .await?;
        Ok(rows
            .iter()
            .map(|r| RecentRepo {
                id: r.get("repo_id"),
                name: r.get("dup_repo_name"),
            })
            .filter(|r| r.name.contains('/'))
            .collect())
    }

    /// Enriches every recently active repo. Per-repo failures are recorded
    /// and skipped; only pool-wide conditions abort the run.
    pub async fn run(self: Arc<Self>, cutoff: DateTime<Utc>) -> Result<Arc<EnrichStats>, EnrichError> {
        let repos = self.recent_repos(cutoff).await?;
        info!(
            repos = repos.len(),
            tokens = self.tokens.len(),
            allowed = self.limiter.allowed(),
            "starting API enrichment"
        );
        let stats = Arc::new(EnrichStats::default());
        let mut handles = Vec::with_capacity(repos.len());

        for repo in repos {
            let permit = self.limiter.acquire().await;
            let this = self.clone();
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                match this.enrich_repo(&repo, cutoff, &stats).await {
                    Ok(()) => {}
                    Err(EnrichError::NotFound(name)) => {
                        stats.missing_repos.fetch_add(1, Ordering::Relaxed);
                        warn!(repo = %name, "repo missing on API, skipping");
                    }
                    Err(err) => {
                        warn!(repo = %repo.name, error = %err, "repo enrichment failed");
                    }
                }
            }));
        }
        futures::future::join_all(handles).await;

        info!(
            repos = stats.repos.load(Ordering::Relaxed),
            issue_events = stats.issue_events.load(Ordering::Relaxed),
            prs = stats.prs.load(Ordering::Relaxed),
            commits = stats.commits.load(Ordering::Relaxed),
            "API enrichment finished"
        );
        Ok(stats)
    }

    async fn enrich_repo(
        &self,
        repo: &RecentRepo,
        cutoff: DateTime<Utc>,
        stats: &EnrichStats,
    ) -> Result<(), EnrichError> {
        self.sync_issue_events(repo, cutoff, stats).await?;
        self.sync_commits(repo, cutoff, stats).await?;
        self.sync_license(repo, stats).await?;
        self.sync_languages(repo, stats).await?;
        stats.repos.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // =========================================================================
    // Issue events
    // =========================================================================

    async fn sync_issue_events(
        &self,
        repo: &RecentRepo,
        cutoff: DateTime<Utc>,
        stats: &EnrichStats,
    ) -> Result<(), EnrichError> {
        #[derive(Deserialize)]
        struct IssueEvent {
            id: i64,
            #[serde(default)]
            actor: Option<Actor>,
            #[serde(default)]
            event: Option<String>,
            #[serde(default)]
            issue: Option<crate::ghevent::Issue>,
            created_at: DateTime<Utc>,
        }

        let mut page = 1u32;
        loop {
            let path = format!(
                "repos/{}/issues/events?per_page=100&page={page}",
                repo.name
            );
            let body = self.api_get(&path, &repo.name).await?;
            let events: Vec<IssueEvent> = match serde_json::from_value(body) {
                Ok(events) => events,
                Err(err) => {
                    warn!(repo = %repo.name, error = %err, "unparseable issue events page");
                    return Ok(());
                }
            };
            if events.is_empty() {
                return Ok(());
            }
            let mut page_done = false;
            for event in &events {
                if event.created_at < cutoff {
                    page_done = true;
                    continue;
                }
                let Some(issue) = &event.issue else {
                    continue;
                };

                {
                    let mut dedup = self.dedup.lock().await;
                    let entry = dedup.entry(event.id).or_insert((issue.id, 0));
                    entry.1 += 1;
                    if entry.1 > 1 {
                        stats.duplicate_events.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }

                self.apply_issue_event(
                    repo,
                    event.id,
                    event.actor.as_ref(),
                    event.event.as_deref(),
                    issue,
                    event.created_at,
                    stats,
                )
                .await?;
                stats.issue_events.fetch_add(1, Ordering::Relaxed);
            }
            if page_done || events.len() < 100 {
                return Ok(());
            }
            page += 1;
        }
    }

    /// Wraps API state into an artificial archive event and routes it
    /// through the same transactional writer the ingestor uses.
    #[allow(clippy::too_many_arguments)]
    async fn apply_issue_event(
        &self,
        repo: &RecentRepo,
        gh_event_id: i64,
        actor: Option<&Actor>,
        action: Option<&str>,
        issue: &crate::ghevent::Issue,
        created_at: DateTime<Utc>,
        stats: &EnrichStats,
    ) -> Result<(), EnrichError> {
        let actor = actor.cloned().unwrap_or(Actor {
            id: 0,
            login: String::new(),
            name: None,
        });

        let mut payload = Payload {
            action: action.map(|a| a.to_string()),
            issue: Some(issue.clone()),
            ..Default::default()
        };

        // PR-backed issues also refresh the PR detail.
        if issue.pull_request.is_some() {
            if let Some(pr) = self.fetch_pull_request(repo, issue.number).await? {
                payload.pull_request = Some(pr);
                stats.prs.fetch_add(1, Ordering::Relaxed);
            }
        }

        let artificial = Event {
            id: format!("api:{gh_event_id}"),
            event_type: ARTIFICIAL_EVENT.to_string(),
            public: true,
            created_at,
            actor: EventActor {
                id: actor.id,
                login: actor.login.clone(),
            },
            repo: EventRepo {
                id: repo.id,
                name: repo.name.clone(),
            },
            // The events API carries no org block; the writer derives the
            // repo's org_login from the owner prefix.
            org: None,
            payload,
        };
        self.writer.write_event(&artificial).await?;
        Ok(())
    }

    async fn fetch_pull_request(
        &self,
        repo: &RecentRepo,
        number: i32,
    ) -> Result<Option<crate::ghevent::PullRequest>, EnrichError> {
        let path = format!("repos/{}/pulls/{number}", repo.name);
        let body = match self.api_get(&path, &repo.name).await {
            Ok(body) => body,
            Err(EnrichError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        match serde_json::from_value(body) {
            Ok(pr) => Ok(Some(pr)),
            Err(err) => {
                debug!(repo = %repo.name, number, error = %err, "unparseable PR detail");
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Commits
    // =========================================================================

    async fn sync_commits(
        &self,
        repo: &RecentRepo,
        cutoff: DateTime<Utc>,
        stats: &EnrichStats,
    ) -> Result<(), EnrichError> {
        #[derive(Deserialize)]
        struct ApiCommit {
            sha: String,
            #[serde(default)]
            commit: Option<CommitDetail>,
            #[serde(default)]
            author: Option<Actor>,
            #[serde(default)]
            committer: Option<Actor>,
        }
        #[derive(Deserialize)]
        struct CommitDetail {
            #[serde(default)]
            author: Option<Signature>,
            #[serde(default)]
            committer: Option<Signature>,
        }
        #[derive(Deserialize)]
        struct Signature {
            #[serde(default)]
            name: Option<String>,
            #[serde(default)]
            email: Option<String>,
            #[serde(default)]
            date: Option<DateTime<Utc>>,
        }

        let path = format!(
            "repos/{}/commits?per_page=100&since={}",
            repo.name,
            urlencoding::encode(&cutoff.to_rfc3339())
        );
        let body = match self.api_get(&path, &repo.name).await {
            Ok(body) => body,
            // Empty repos return 409; treat like nothing to do.
            Err(EnrichError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let commits: Vec<ApiCommit> = match serde_json::from_value(body) {
            Ok(commits) => commits,
            Err(_) => return Ok(()),
        };

        for api in &commits {
            let date = api
                .commit
                .as_ref()
                .and_then(|c| c.author.as_ref())
                .and_then(|a| a.date);
            let Some(event_id) = self.nearest_commit_row(&api.sha, date).await? else {
                continue;
            };

            let author_id = match &api.author {
                Some(author) => {
                    let signature = api.commit.as_ref().and_then(|c| c.author.as_ref());
                    self.record_identity(
                        author,
                        signature.and_then(|s| s.name.as_deref()),
                        signature.and_then(|s| s.email.as_deref()),
                    )
                    .await?;
                    Some(author.id)
                }
                None => None,
            };
            let committer_id = match &api.committer {
                Some(committer) => {
                    let signature = api.commit.as_ref().and_then(|c| c.committer.as_ref());
                    self.record_identity(
                        committer,
                        signature.and_then(|s| s.name.as_deref()),
                        signature.and_then(|s| s.email.as_deref()),
                    )
                    .await?;
                    Some(committer.id)
                }
                None => None,
            };

            if author_id.is_some() || committer_id.is_some() {
                sqlx::query(
                    "UPDATE gha_commits SET author_id = COALESCE($1, author_id), \
                     committer_id = COALESCE($2, committer_id) WHERE sha = $3 AND event_id = $4",
                )
                .bind(author_id)
                .bind(committer_id)
                .bind(&api.sha)
                .bind(&event_id)
                .execute(self.db.pool())
                .await?;
                stats.commits.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Locates the DB commit row closest in time to the API-reported date.
    async fn nearest_commit_row(
        &self,
        sha: &str,
        api_date: Option<DateTime<Utc>>,
    ) -> Result<Option<String>, EnrichError> {
        let rows = sqlx::query(
            "SELECT event_id, dup_created_at FROM gha_commits WHERE sha = $1",
        )
        .bind(sha)
        .fetch_all(self.db.read_pool())
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let target = api_date.unwrap_or_else(Utc::now);
        let nearest = rows
            .iter()
            .min_by_key(|row| {
                let created: DateTime<Utc> = row.get("dup_created_at");
                (created - target).num_seconds().abs()
            })
            .map(|row| row.get::<String, _>("event_id"));
        Ok(nearest)
    }

    /// Upserts the actor plus `(email, name)` edges with API provenance.
    async fn record_identity(
        &self,
        actor: &Actor,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<(), EnrichError> {
        sqlx::query(
            "INSERT INTO gha_actors(id, login, name) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET login = EXCLUDED.login, \
             name = COALESCE(EXCLUDED.name, gha_actors.name)",
        )
        .bind(actor.id)
        .bind(clean_text(&actor.login, crate::storage::schema::maxlen::LOGIN))
        .bind(name.map(|n| clean_text(n, crate::storage::schema::maxlen::NAME)))
        .execute(self.db.pool())
        .await?;
        if let Some(email) = email.filter(|e| !e.is_empty()) {
            sqlx::query(
                "INSERT INTO gha_actors_emails(actor_id, email, origin) VALUES ($1, $2, $3) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(actor.id)
            .bind(clean_text(email, crate::storage::schema::maxlen::EMAIL))
            .bind(ORIGIN_API)
            .execute(self.db.pool())
            .await?;
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            sqlx::query(
                "INSERT INTO gha_actors_names(actor_id, name, origin) VALUES ($1, $2, $3) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(actor.id)
            .bind(clean_text(name, crate::storage::schema::maxlen::NAME))
            .bind(ORIGIN_API)
            .execute(self.db.pool())
            .await?;
        }
        Ok(())
    }

    // =========================================================================
    // License & languages
    // =========================================================================

    async fn sync_license(&self, repo: &RecentRepo, stats: &EnrichStats) -> Result<(), EnrichError> {
        #[derive(Deserialize)]
        struct LicenseBody {
            #[serde(default)]
            license: Option<License>,
        }
        #[derive(Deserialize)]
        struct License {
            #[serde(default)]
            key: Option<String>,
            #[serde(default)]
            name: Option<String>,
        }

        let path = format!("repos/{}/license", repo.name);
        let body = match self.api_get(&path, &repo.name).await {
            Ok(body) => body,
            // Many repos simply have no license file.
            Err(EnrichError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let parsed: LicenseBody = match serde_json::from_value(body) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(()),
        };
        let Some(license) = parsed.license else {
            return Ok(());
        };
        sqlx::query(
            "UPDATE gha_repos SET license_key = $1, license_name = $2, updated_at = now() \
             WHERE name = $3",
        )
        .bind(license.key)
        .bind(license.name)
        .bind(&repo.name)
        .execute(self.db.pool())
        .await?;
        stats.licenses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn sync_languages(
        &self,
        repo: &RecentRepo,
        stats: &EnrichStats,
    ) -> Result<(), EnrichError> {
        let path = format!("repos/{}/languages", repo.name);
        let body = match self.api_get(&path, &repo.name).await {
            Ok(body) => body,
            Err(EnrichError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let langs: HashMap<String, i64> = match serde_json::from_value(body) {
            Ok(langs) => langs,
            Err(_) => return Ok(()),
        };
        let total: i64 = langs.values().sum();
        if total <= 0 {
            return Ok(());
        }

        sqlx::query("DELETE FROM gha_repos_langs WHERE repo_name = $1")
            .bind(&repo.name)
            .execute(self.db.pool())
            .await?;
        for (lang, loc) in &langs {
            sqlx::query(
                "INSERT INTO gha_repos_langs(repo_id, repo_name, lang_name, lang_loc, \
                 lang_perc) VALUES ($1, $2, $3, $4, $5) ON CONFLICT (repo_name, lang_name) \
                 DO UPDATE SET lang_loc = EXCLUDED.lang_loc, lang_perc = EXCLUDED.lang_perc, \
                 dt = now()",
            )
            .bind(repo.id)
            .bind(&repo.name)
            .bind(clean_text(lang, 60))
            .bind(loc)
            .bind(100.0 * *loc as f64 / total as f64)
            .execute(self.db.pool())
            .await?;
        }
        stats.languages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // =========================================================================
    // API transport
    // =========================================================================

    /// One API GET through the page state machine: token selection with
    /// rate hint, abuse backoff with concurrency decrement, bounded
    /// retries for everything else.
    async fn api_get(&self, path: &str, repo: &str) -> Result<serde_json::Value, EnrichError> {
        let mut trial = 0u32;
        loop {
            let (index, rate) = self.tokens.hint().await?;
            if rate.remaining <= self.ctx.min_ghapi_points as i64 {
                let reset_in = (rate.reset - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if reset_in > self.ctx.max_ghapi_wait {
                    return Err(EnrichError::RateLimited(reset_in));
                }
                debug!(wait = ?reset_in, "rate limit low, waiting for reset");
                tokio::time::sleep(reset_in + Duration::from_secs(1)).await;
                continue;
            }

            match self.try_get(path, self.tokens.token(index)).await {
                PageState::Ok(value) => {
                    self.limiter.on_success();
                    return Ok(value);
                }
                PageState::NotFound => return Err(EnrichError::NotFound(repo.to_string())),
                PageState::Abuse { retry_after } => {
                    self.limiter.on_abuse();
                    let backoff = retry_after
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << (trial + 3).min(10)));
                    warn!(
                        repo,
                        allowed = self.limiter.allowed(),
                        backoff = ?backoff,
                        "abuse detection triggered"
                    );
                    tokio::time::sleep(backoff).await;
                    trial += 1;
                }
                PageState::RateLow { reset_in } => {
                    if reset_in > self.ctx.max_ghapi_wait {
                        return Err(EnrichError::RateLimited(reset_in));
                    }
                    tokio::time::sleep(reset_in + Duration::from_secs(1)).await;
                }
                PageState::Err(message) => {
                    trial += 1;
                    if trial >= self.ctx.max_ghapi_retry {
                        return Err(EnrichError::Fatal {
                            what: path.to_string(),
                            attempts: trial,
                            message,
                        });
                    }
                    tokio::time::sleep(Duration::from_secs(1 << trial.min(6))).await;
                }
            }
        }
    }

    async fn try_get(&self, path: &str, token: &str) -> PageState {
        let response = match self
            .http
            .get(format!("{GITHUB_API_BASE}/{path}"))
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return PageState::Err(err.to_string()),
        };

        let status = response.status();
        match status.as_u16() {
            200..=299 => match response.json().await {
                Ok(value) => PageState::Ok(value),
                Err(err) => PageState::Err(err.to_string()),
            },
            404 | 409 | 451 => PageState::NotFound,
            403 | 429 => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse().ok());
                let remaining = response
                    .headers()
                    .get("x-ratelimit-remaining")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<i64>().ok());
                if remaining == Some(0) {
                    let reset = response
                        .headers()
                        .get("x-ratelimit-reset")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<i64>().ok())
                        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());
                    let reset_in = reset
                        .map(|r| (r - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(Duration::from_secs(60));
                    PageState::RateLow { reset_in }
                } else {
                    PageState::Abuse { retry_after }
                }
            }
            500..=599 => PageState::Err(format!("HTTP {status}")),
            _ => PageState::Err(format!("HTTP {status}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limiter_decrements_to_floor() {
        let limiter = AdaptiveLimiter::new(3);
        assert_eq!(limiter.allowed(), 3);
        limiter.on_abuse();
        assert_eq!(limiter.allowed(), 2);
        limiter.on_abuse();
        assert_eq!(limiter.allowed(), 1);
        // Floor is 1.
        limiter.on_abuse();
        assert_eq!(limiter.allowed(), 1);
    }

    #[tokio::test]
    async fn test_limiter_grows_back_to_ceiling() {
        let limiter = AdaptiveLimiter::new(2);
        limiter.on_abuse();
        assert_eq!(limiter.allowed(), 1);
        limiter.on_success();
        assert_eq!(limiter.allowed(), 2);
        // Ceiling is 2.
        limiter.on_success();
        assert_eq!(limiter.allowed(), 2);
    }

    #[test]
    fn test_token_pool_requires_tokens() {
        let result = TokenPool::new(Vec::new(), Client::new());
        assert!(matches!(result, Err(EnrichError::NoTokens)));
        let pool = TokenPool::new(vec!["t".to_string()], Client::new()).unwrap();
        assert_eq!(pool.len(), 1);
    }
}
