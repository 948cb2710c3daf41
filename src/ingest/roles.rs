//! Commit-message trailer roles.
//!
//! Kernel-style trailers (`Signed-off-by: Jane <jane@x.io>`) carry the real
//! attribution graph of a commit. Free-form trailer names are folded into a
//! small set of canonical roles through a closed lookup table; unknown
//! trailers are ignored. Each canonical role becomes one row in
//! `gha_commits_roles`, unique on `(sha, event_id, role, email, name)`.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use sqlx::Row;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::config::HideMap;
use crate::storage::Database;
use crate::utils::clean_text;

use super::IngestError;

/// Canonical role names.
pub mod role {
    pub const AUTHORED: &str = "authored";
    pub const COMMITTED: &str = "committed";
    pub const SIGNED_OFF: &str = "signed_off";
    pub const CO_AUTHORED: &str = "co_authored";
    pub const REVIEWED: &str = "reviewed";
    pub const TESTED: &str = "tested";
    pub const REPORTED: &str = "reported";
    pub const ACKED: &str = "acked";
    pub const SUGGESTED: &str = "suggested";
    pub const APPROVED: &str = "approved";
    pub const HELPED: &str = "helped";
    pub const MENTORED: &str = "mentored";
    pub const INFLUENCED: &str = "influenced";
    pub const INFORMED: &str = "informed";
}

use role::*;

/// Closed canonicalization table: lowercased trailer name to the canonical
/// roles it asserts. Collected from a decade of free-form trailers in the
/// archive; entries outside this table do not produce role rows.
const TRAILER_ROLES: &[(&str, &[&str])] = &[
    // authorship
    ("author", &[AUTHORED]),
    ("authored-by", &[AUTHORED]),
    ("authored by", &[AUTHORED]),
    ("authors", &[AUTHORED]),
    ("original-author", &[AUTHORED]),
    ("original author", &[AUTHORED]),
    ("original-authored-by", &[AUTHORED]),
    ("patch-by", &[AUTHORED]),
    ("patch by", &[AUTHORED]),
    ("patch-from", &[AUTHORED]),
    ("patch from", &[AUTHORED]),
    ("written-by", &[AUTHORED]),
    ("written by", &[AUTHORED]),
    ("contributed-by", &[AUTHORED]),
    ("contributed by", &[AUTHORED]),
    ("created-by", &[AUTHORED]),
    ("created by", &[AUTHORED]),
    ("implemented-by", &[AUTHORED]),
    ("implemented by", &[AUTHORED]),
    ("fixed-by", &[AUTHORED]),
    ("fixed by", &[AUTHORED]),
    ("fix-by", &[AUTHORED]),
    // committer
    ("committer", &[COMMITTED]),
    ("committed-by", &[COMMITTED]),
    ("committed by", &[COMMITTED]),
    ("commited-by", &[COMMITTED]),
    ("commit-by", &[COMMITTED]),
    ("applied-by", &[COMMITTED]),
    ("applied by", &[COMMITTED]),
    ("merged-by", &[COMMITTED]),
    ("merged by", &[COMMITTED]),
    ("cherry-picked-by", &[COMMITTED]),
    ("cherry picked by", &[COMMITTED]),
    ("backported-by", &[COMMITTED]),
    ("rebased-by", &[COMMITTED]),
    // sign-off
    ("signed-off-by", &[SIGNED_OFF]),
    ("signed off by", &[SIGNED_OFF]),
    ("signed-off by", &[SIGNED_OFF]),
    ("signed off-by", &[SIGNED_OFF]),
    ("signed-of-by", &[SIGNED_OFF]),
    ("signed-offby", &[SIGNED_OFF]),
    ("signedoffby", &[SIGNED_OFF]),
    ("signed-off", &[SIGNED_OFF]),
    ("signed off", &[SIGNED_OFF]),
    ("signed-by", &[SIGNED_OFF]),
    ("signed by", &[SIGNED_OFF]),
    ("signed", &[SIGNED_OFF]),
    ("signeed-off-by", &[SIGNED_OFF]),
    ("signef-off-by", &[SIGNED_OFF]),
    ("signe-off-by", &[SIGNED_OFF]),
    ("sgned-off-by", &[SIGNED_OFF]),
    ("sigend-off-by", &[SIGNED_OFF]),
    ("sigend off by", &[SIGNED_OFF]),
    ("sighed-off-by", &[SIGNED_OFF]),
    ("sign-off-by", &[SIGNED_OFF]),
    ("sign off by", &[SIGNED_OFF]),
    ("signoff-by", &[SIGNED_OFF]),
    ("signoff", &[SIGNED_OFF]),
    ("sign-off", &[SIGNED_OFF]),
    ("sign off", &[SIGNED_OFF]),
    ("sob", &[SIGNED_OFF]),
    ("s-o-b", &[SIGNED_OFF]),
    ("singed-off-by", &[SIGNED_OFF]),
    ("singned-off-by", &[SIGNED_OFF]),
    ("signd-off-by", &[SIGNED_OFF]),
    ("dually-signed-off-by", &[SIGNED_OFF]),
    ("also-signed-off-by", &[SIGNED_OFF]),
    ("signed-off-by the second", &[SIGNED_OFF]),
    // co-author
    ("co-authored-by", &[CO_AUTHORED]),
    ("co authored by", &[CO_AUTHORED]),
    ("co-authored by", &[CO_AUTHORED]),
    ("coauthored-by", &[CO_AUTHORED]),
    ("coauthored by", &[CO_AUTHORED]),
    ("co-author", &[CO_AUTHORED]),
    ("co author", &[CO_AUTHORED]),
    ("coauthor", &[CO_AUTHORED]),
    ("co-authors", &[CO_AUTHORED]),
    ("coauthors", &[CO_AUTHORED]),
    ("co-written-by", &[CO_AUTHORED]),
    ("co-developed-by", &[CO_AUTHORED]),
    ("co-developed by", &[CO_AUTHORED]),
    ("codeveloped-by", &[CO_AUTHORED]),
    ("co-credit-to", &[CO_AUTHORED]),
    ("pair-programmed-with", &[CO_AUTHORED]),
    ("paired-with", &[CO_AUTHORED]),
    ("with", &[CO_AUTHORED]),
    // review
    ("reviewed-by", &[REVIEWED]),
    ("reviewed by", &[REVIEWED]),
    ("reviewed", &[REVIEWED]),
    ("review-by", &[REVIEWED]),
    ("review by", &[REVIEWED]),
    ("reviewer", &[REVIEWED]),
    ("reviewers", &[REVIEWED]),
    ("reveiwed-by", &[REVIEWED]),
    ("reviwed-by", &[REVIEWED]),
    ("reviewd-by", &[REVIEWED]),
    ("rewieved-by", &[REVIEWED]),
    ("reviewed-off-by", &[REVIEWED]),
    ("code-reviewed-by", &[REVIEWED]),
    ("partially-reviewed-by", &[REVIEWED]),
    ("proofread-by", &[REVIEWED]),
    ("checked-by", &[REVIEWED]),
    ("checked by", &[REVIEWED]),
    ("vetted-by", &[REVIEWED]),
    ("lgtm-by", &[REVIEWED]),
    // testing
    ("tested-by", &[TESTED]),
    ("tested by", &[TESTED]),
    ("tested", &[TESTED]),
    ("test-by", &[TESTED]),
    ("testted-by", &[TESTED]),
    ("teted-by", &[TESTED]),
    ("verified-by", &[TESTED]),
    ("verified by", &[TESTED]),
    ("validated-by", &[TESTED]),
    ("validated by", &[TESTED]),
    ("confirmed-by", &[TESTED]),
    ("confirmed by", &[TESTED]),
    ("reproduced-by", &[TESTED]),
    ("build-tested-by", &[TESTED]),
    ("regression-tested-by", &[TESTED]),
    ("runtime-tested-by", &[TESTED]),
    ("compile-tested-by", &[TESTED]),
    ("bisected-by", &[TESTED]),
    ("benchmarked-by", &[TESTED]),
    // reporting
    ("reported-by", &[REPORTED]),
    ("reported by", &[REPORTED]),
    ("reported", &[REPORTED]),
    ("report-by", &[REPORTED]),
    ("reportedy-by", &[REPORTED]),
    ("reproted-by", &[REPORTED]),
    ("bug-reported-by", &[REPORTED]),
    ("issue-reported-by", &[REPORTED]),
    ("reported-and-tested-by", &[REPORTED, TESTED]),
    ("reported-and-reviewed-by", &[REPORTED, REVIEWED]),
    ("reported-tested-by", &[REPORTED, TESTED]),
    ("found-by", &[REPORTED]),
    ("found by", &[REPORTED]),
    ("discovered-by", &[REPORTED]),
    ("spotted-by", &[REPORTED]),
    ("noticed-by", &[REPORTED]),
    ("caught-by", &[REPORTED]),
    ("diagnosed-by", &[REPORTED]),
    ("analyzed-by", &[REPORTED]),
    ("analysed-by", &[REPORTED]),
    ("debugged-by", &[REPORTED]),
    ("root-caused-by", &[REPORTED]),
    // acks
    ("acked-by", &[ACKED]),
    ("acked by", &[ACKED]),
    ("acked", &[ACKED]),
    ("ack-by", &[ACKED]),
    ("ack", &[ACKED]),
    ("acked-off-by", &[ACKED]),
    ("akced-by", &[ACKED]),
    ("aced-by", &[ACKED]),
    ("acked-and-tested-by", &[ACKED, TESTED]),
    ("acked-and-reviewed-by", &[ACKED, REVIEWED]),
    ("nacked-by", &[ACKED]),
    ("nak-by", &[ACKED]),
    // suggestions
    ("suggested-by", &[SUGGESTED]),
    ("suggested by", &[SUGGESTED]),
    ("suggested", &[SUGGESTED]),
    ("sugested-by", &[SUGGESTED]),
    ("suggsted-by", &[SUGGESTED]),
    ("suggestions-by", &[SUGGESTED]),
    ("proposed-by", &[SUGGESTED]),
    ("proposed by", &[SUGGESTED]),
    ("recommended-by", &[SUGGESTED]),
    ("requested-by", &[SUGGESTED]),
    ("requested by", &[SUGGESTED]),
    ("idea-by", &[SUGGESTED]),
    ("idea-from", &[SUGGESTED]),
    ("idea", &[SUGGESTED]),
    ("initial-patch-by", &[SUGGESTED, AUTHORED]),
    // approvals
    ("approved-by", &[APPROVED]),
    ("approved by", &[APPROVED]),
    ("approved", &[APPROVED]),
    ("aproved-by", &[APPROVED]),
    ("approved-for-merge-by", &[APPROVED]),
    ("blessed-by", &[APPROVED]),
    ("endorsed-by", &[APPROVED]),
    ("okayed-by", &[APPROVED]),
    ("accepted-by", &[APPROVED]),
    // help
    ("helped-by", &[HELPED]),
    ("helped by", &[HELPED]),
    ("help-by", &[HELPED]),
    ("help-from", &[HELPED]),
    ("with-help-from", &[HELPED]),
    ("with help from", &[HELPED]),
    ("assisted-by", &[HELPED]),
    ("assisted by", &[HELPED]),
    ("supported-by", &[HELPED]),
    ("guided-by", &[HELPED]),
    ("improved-by", &[HELPED]),
    ("thanks-to", &[HELPED]),
    ("thanks to", &[HELPED]),
    ("special-thanks-to", &[HELPED]),
    ("courtesy-of", &[HELPED]),
    // mentoring
    ("mentored-by", &[MENTORED]),
    ("mentored by", &[MENTORED]),
    ("mentor", &[MENTORED]),
    ("mentors", &[MENTORED]),
    ("coached-by", &[MENTORED]),
    ("supervised-by", &[MENTORED]),
    ("sponsored-by", &[MENTORED]),
    // influence
    ("inspired-by", &[INFLUENCED]),
    ("inspired by", &[INFLUENCED]),
    ("based-on-patch-by", &[INFLUENCED]),
    ("based on patch by", &[INFLUENCED]),
    ("based-on-work-by", &[INFLUENCED]),
    ("based-on-work-from", &[INFLUENCED]),
    ("based-on-code-by", &[INFLUENCED]),
    ("based-on-code-from", &[INFLUENCED]),
    ("based-on-a-patch-by", &[INFLUENCED]),
    ("based-on", &[INFLUENCED]),
    ("based on", &[INFLUENCED]),
    ("original-patch-by", &[INFLUENCED]),
    ("original patch by", &[INFLUENCED]),
    ("original-work-by", &[INFLUENCED]),
    ("original-idea-by", &[INFLUENCED]),
    ("adapted-from", &[INFLUENCED]),
    ("derived-from-code-by", &[INFLUENCED]),
    ("inherited-from", &[INFLUENCED]),
    ("influenced-by", &[INFLUENCED]),
    // notification
    ("cc", &[INFORMED]),
    ("cc'd", &[INFORMED]),
    ("cced", &[INFORMED]),
    ("ccd", &[INFORMED]),
    ("cc-by", &[INFORMED]),
    ("c.c", &[INFORMED]),
    ("copied-to", &[INFORMED]),
    ("informed-by", &[INFORMED]),
    ("notified-by", &[INFORMED]),
    ("fyi", &[INFORMED]),
];

fn trailer_table() -> &'static HashMap<&'static str, &'static [&'static str]> {
    static TABLE: OnceLock<HashMap<&'static str, &'static [&'static str]>> = OnceLock::new();
    TABLE.get_or_init(|| TRAILER_ROLES.iter().copied().collect())
}

fn trailer_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z][-A-Za-z0-9_'. ]*?):\s*(.+)$").expect("static regex"))
}

/// One canonical role extracted from a commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRole {
    /// Canonical role name.
    pub role: &'static str,
    /// Display name part of the trailer value, possibly empty.
    pub name: String,
    /// Email part of the trailer value, possibly empty.
    pub email: String,
}

/// Splits `Jane Doe <jane@x.io>` into name and email parts.
fn split_name_email(value: &str) -> (String, String) {
    match value.split_once('<') {
        Some((name, rest)) => {
            let email = rest.trim_end().trim_end_matches('>').trim().to_string();
            (name.trim().to_string(), email)
        }
        None => {
            let trimmed = value.trim();
            if trimmed.contains('@') && !trimmed.contains(' ') {
                (String::new(), trimmed.to_string())
            } else {
                (trimmed.to_string(), String::new())
            }
        }
    }
}

/// Parses a commit message line-by-line against the trailer table.
pub fn parse_commit_roles(message: &str) -> Vec<CommitRole> {
    let mut out = Vec::new();
    for line in message.lines() {
        let line = line.trim();
        let Some(captures) = trailer_regex().captures(line) else {
            continue;
        };
        let trailer_name = captures[1].trim().to_lowercase();
        let Some(roles) = trailer_table().get(trailer_name.as_str()) else {
            continue;
        };
        let (name, email) = split_name_email(&captures[2]);
        if name.is_empty() && email.is_empty() {
            continue;
        }
        for role in roles.iter() {
            let entry = CommitRole {
                role,
                name: name.clone(),
                email: email.clone(),
            };
            if !out.contains(&entry) {
                out.push(entry);
            }
        }
    }
    out
}

/// Sharded `(name, email) -> actor` cache.
///
/// The trailer pass resolves the same few thousand identities millions of
/// times; sharding keeps writers from serializing on one lock.
pub struct ActorCache {
    shards: Vec<Mutex<HashMap<(String, String), Option<(i64, String)>>>>,
}

const CACHE_SHARDS: usize = 16;

impl Default for ActorCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            shards: (0..CACHE_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &(String, String)) -> &Mutex<HashMap<(String, String), Option<(i64, String)>>> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % CACHE_SHARDS]
    }

    fn get(&self, key: &(String, String)) -> Option<Option<(i64, String)>> {
        self.shard(key).lock().expect("cache lock").get(key).cloned()
    }

    fn put(&self, key: (String, String), value: Option<(i64, String)>) {
        self.shard(&key).lock().expect("cache lock").insert(key, value);
    }
}

/// Resolves a trailer identity against the warehouse identity graph,
/// preferring the email edge over the name edge.
pub async fn lookup_actor(
    db: &Database,
    cache: &ActorCache,
    name: &str,
    email: &str,
) -> Result<Option<(i64, String)>, IngestError> {
    let key = (name.to_string(), email.to_string());
    if let Some(hit) = cache.get(&key) {
        return Ok(hit);
    }

    let mut found: Option<(i64, String)> = None;
    if !email.is_empty() {
        let row = sqlx::query(
            "SELECT a.id, a.login FROM gha_actors a \
             JOIN gha_actors_emails ae ON a.id = ae.actor_id \
             WHERE ae.email = $1 ORDER BY a.id DESC LIMIT 1",
        )
        .bind(email)
        .fetch_optional(db.pool())
        .await?;
        found = row.map(|r| (r.get::<i64, _>("id"), r.get::<String, _>("login")));
    }
    if found.is_none() && !name.is_empty() {
        let row = sqlx::query(
            "SELECT a.id, a.login FROM gha_actors a \
             JOIN gha_actors_names an ON a.id = an.actor_id \
             WHERE an.name = $1 ORDER BY a.id DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(db.pool())
        .await?;
        found = row.map(|r| (r.get::<i64, _>("id"), r.get::<String, _>("login")));
    }

    cache.put(key, found.clone());
    Ok(found)
}

/// Batch size for the standalone role refresh.
const REFRESH_BATCH: i64 = 1000;

/// Re-derives `gha_commits_roles` for the whole commits table.
///
/// Runs the same trailer parser over every stored commit message in
/// keyset-paginated batches. Idempotent through the unique index on
/// `(sha, event_id, role, actor_email, actor_name)`.
pub async fn refresh_commit_roles(
    db: &Database,
    hide: &HideMap,
) -> Result<u64, IngestError> {
    let cache = ActorCache::new();
    let mut inserted = 0u64;
    let mut scanned = 0u64;
    let mut cursor: Option<(String, String)> = None;

    loop {
        let rows = match &cursor {
            Some((sha, event_id)) => {
                sqlx::query(
                    "SELECT sha, event_id, message, dup_repo_id, dup_repo_name, dup_created_at \
                     FROM gha_commits WHERE (sha, event_id) > ($1, $2) \
                     ORDER BY sha, event_id LIMIT $3",
                )
                .bind(sha)
                .bind(event_id)
                .bind(REFRESH_BATCH)
                .fetch_all(db.pool())
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT sha, event_id, message, dup_repo_id, dup_repo_name, dup_created_at \
                     FROM gha_commits ORDER BY sha, event_id LIMIT $1",
                )
                .bind(REFRESH_BATCH)
                .fetch_all(db.pool())
                .await?
            }
        };
        if rows.is_empty() {
            break;
        }
        scanned += rows.len() as u64;

        for row in &rows {
            let sha: String = row.get("sha");
            let event_id: String = row.get("event_id");
            let message: String = row.get("message");
            let repo_id: i64 = row.get("dup_repo_id");
            let repo_name: String = row.get("dup_repo_name");
            let created_at: chrono::DateTime<chrono::Utc> = row.get("dup_created_at");

            for role in parse_commit_roles(&message) {
                inserted += insert_commit_role(
                    db, &cache, hide, &sha, &event_id, &role, repo_id, &repo_name, created_at,
                )
                .await?;
            }
            cursor = Some((sha, event_id));
        }
        debug!(scanned, inserted, "role refresh batch done");
    }

    info!(scanned, inserted, "commit role refresh finished");
    Ok(inserted)
}

/// Inserts one role row, resolving the actor through the identity graph.
#[allow(clippy::too_many_arguments)]
pub async fn insert_commit_role(
    db: &Database,
    cache: &ActorCache,
    hide: &HideMap,
    sha: &str,
    event_id: &str,
    role: &CommitRole,
    repo_id: i64,
    repo_name: &str,
    created_at: chrono::DateTime<chrono::Utc>,
) -> Result<u64, IngestError> {
    let actor = lookup_actor(db, cache, &role.name, &role.email).await?;
    let (actor_id, actor_login) = match actor {
        Some((id, login)) => (Some(id), Some(hide.maybe_hide(&login).to_string())),
        None => (None, None),
    };
    let result = sqlx::query(
        "INSERT INTO gha_commits_roles(\
         sha, event_id, role, actor_id, actor_login, actor_name, actor_email, \
         repo_id, repo_name, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) ON CONFLICT DO NOTHING",
    )
    .bind(sha)
    .bind(event_id)
    .bind(role.role)
    .bind(actor_id)
    .bind(actor_login)
    .bind(clean_text(hide.maybe_hide(&role.name), crate::storage::schema::maxlen::NAME))
    .bind(clean_text(hide.maybe_hide(&role.email), crate::storage::schema::maxlen::EMAIL))
    .bind(repo_id)
    .bind(repo_name)
    .bind(created_at)
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signed_off() {
        let message = "Fix the frobnicator\n\nSigned-off-by: Jane Doe <jane@x.io>\n";
        let roles = parse_commit_roles(message);
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].role, SIGNED_OFF);
        assert_eq!(roles[0].name, "Jane Doe");
        assert_eq!(roles[0].email, "jane@x.io");
    }

    #[test]
    fn test_parse_multiple_trailers() {
        let message = "Subject\n\nReviewed-by: A <a@x.io>\nTested-by: B <b@x.io>\nCo-authored-by: C <c@x.io>";
        let roles = parse_commit_roles(message);
        let names: Vec<&str> = roles.iter().map(|r| r.role).collect();
        assert_eq!(names, vec![REVIEWED, TESTED, CO_AUTHORED]);
    }

    #[test]
    fn test_parse_variant_spellings() {
        let roles = parse_commit_roles("x\n\nSigned off by: A <a@x.io>\nsingned-off-by: B <b@x.io>");
        assert_eq!(roles.len(), 2);
        assert!(roles.iter().all(|r| r.role == SIGNED_OFF));
    }

    #[test]
    fn test_multi_role_trailer() {
        let roles = parse_commit_roles("x\n\nReported-and-tested-by: A <a@x.io>");
        let names: Vec<&str> = roles.iter().map(|r| r.role).collect();
        assert_eq!(names, vec![REPORTED, TESTED]);
    }

    #[test]
    fn test_unknown_trailer_ignored() {
        assert!(parse_commit_roles("x\n\nChange-Id: Iabc123").is_empty());
        assert!(parse_commit_roles("plain message, no trailers").is_empty());
    }

    #[test]
    fn test_value_without_email() {
        let roles = parse_commit_roles("x\n\nThanks-to: Somebody Helpful");
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "Somebody Helpful");
        assert_eq!(roles[0].email, "");
    }

    #[test]
    fn test_value_bare_email() {
        let roles = parse_commit_roles("x\n\nReported-by: crash@berkeley.edu");
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "");
        assert_eq!(roles[0].email, "crash@berkeley.edu");
    }

    #[test]
    fn test_duplicate_roles_deduplicated() {
        let message = "x\n\nReviewed-by: A <a@x.io>\nReviewed-by: A <a@x.io>";
        assert_eq!(parse_commit_roles(message).len(), 1);
    }

    #[test]
    fn test_table_has_no_duplicate_keys() {
        let mut seen = std::collections::HashSet::new();
        for (key, _) in TRAILER_ROLES {
            assert!(seen.insert(*key), "duplicate trailer key: {key}");
        }
        assert!(TRAILER_ROLES.len() > 200);
    }

    #[test]
    fn test_cache_round_trip() {
        let cache = ActorCache::new();
        let key = ("Jane".to_string(), "jane@x.io".to_string());
        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), Some((42, "jane".to_string())));
        assert_eq!(cache.get(&key), Some(Some((42, "jane".to_string()))));
    }
}
