//! GitHub Archive event models.
//!
//! Two wire layouts exist: the modern one (2015+) with `actor`/`repo`/`org`
//! references and a typed payload, and the flat pre-2015 layout where the
//! actor is a bare login and the repository is embedded. The ingestor picks
//! the parser from configuration; both deserialize with serde and tolerate
//! the field drift GitHub accumulated over a decade.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::utils::{synthetic_id, synthetic_event_id};

/// Modern (2015+) archive event.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default = "default_true")]
    pub public: bool,
    pub created_at: DateTime<Utc>,
    pub actor: EventActor,
    pub repo: EventRepo,
    #[serde(default)]
    pub org: Option<EventOrg>,
    #[serde(default)]
    pub payload: Payload,
}

fn default_true() -> bool {
    true
}

/// Actor reference on the event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct EventActor {
    pub id: i64,
    pub login: String,
}

/// Repo reference on the event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct EventRepo {
    pub id: i64,
    pub name: String,
}

/// Org reference on the event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct EventOrg {
    pub id: i64,
    pub login: String,
}

/// Typed event payload; every field is optional because each event type
/// populates a different subset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub push_id: Option<i64>,
    #[serde(default)]
    pub size: Option<i32>,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub head: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub issue: Option<Issue>,
    #[serde(default)]
    pub pull_request: Option<PullRequest>,
    #[serde(default)]
    pub comment: Option<Comment>,
    #[serde(default)]
    pub review: Option<Review>,
    #[serde(default)]
    pub release: Option<Release>,
    #[serde(default)]
    pub forkee: Option<Forkee>,
    #[serde(default)]
    pub pages: Option<Vec<Page>>,
    #[serde(default)]
    pub member: Option<Actor>,
    #[serde(default)]
    pub commits: Option<Vec<PayloadCommit>>,
    #[serde(default)]
    pub ref_type: Option<String>,
    #[serde(default)]
    pub master_branch: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub number: Option<i32>,
    #[serde(default)]
    pub team: Option<Team>,
}

/// A fully-described GitHub user inside a payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Actor {
    pub id: i64,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub number: i32,
    #[serde(default)]
    pub comments: i32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub milestone: Option<Milestone>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub assignee: Option<Actor>,
    #[serde(default)]
    pub assignees: Vec<Actor>,
    #[serde(default)]
    pub user: Option<Actor>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Present when the "issue" is really a pull request.
    #[serde(default)]
    pub pull_request: Option<Value>,
}

fn default_state() -> String {
    "open".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub id: i64,
    pub number: i32,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<Actor>,
    #[serde(default)]
    pub base: Option<Branch>,
    #[serde(default)]
    pub head: Option<Branch>,
    #[serde(default)]
    pub merged_by: Option<Actor>,
    #[serde(default)]
    pub assignee: Option<Actor>,
    #[serde(default)]
    pub assignees: Option<Vec<Actor>>,
    #[serde(default)]
    pub requested_reviewers: Option<Vec<Actor>>,
    #[serde(default)]
    pub milestone: Option<Milestone>,
    #[serde(default)]
    pub merged: Option<bool>,
    #[serde(default)]
    pub mergeable: Option<bool>,
    #[serde(default)]
    pub draft: Option<bool>,
    #[serde(default)]
    pub merge_commit_sha: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub additions: Option<i32>,
    #[serde(default)]
    pub deletions: Option<i32>,
    #[serde(default)]
    pub changed_files: Option<i32>,
    #[serde(default)]
    pub comments: Option<i32>,
    #[serde(default)]
    pub commits: Option<i32>,
}

/// Base/head reference of a pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub user: Option<Actor>,
    #[serde(default)]
    pub repo: Option<Forkee>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Milestone {
    pub id: i64,
    pub number: i32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub creator: Option<Actor>,
    #[serde(default)]
    pub open_issues: i32,
    #[serde(default)]
    pub closed_issues: i32,
    #[serde(default)]
    pub due_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub default: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub id: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub user: Option<Actor>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub commit_id: Option<String>,
    #[serde(default)]
    pub original_commit_id: Option<String>,
    #[serde(default)]
    pub diff_hunk: Option<String>,
    #[serde(default)]
    pub position: Option<i32>,
    #[serde(default)]
    pub original_position: Option<i32>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub pull_request_review_id: Option<i64>,
    #[serde(default)]
    pub line: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Review {
    pub id: i64,
    #[serde(default)]
    pub user: Option<Actor>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub commit_id: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub id: i64,
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub target_commitish: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub author: Option<Actor>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub download_count: i32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Embedded repository object (fork payloads, PR base/head repos).
#[derive(Debug, Clone, Deserialize)]
pub struct Forkee {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub owner: Option<Actor>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub stargazers_count: i32,
    #[serde(default)]
    pub forks: i32,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub open_issues: i32,
    #[serde(default)]
    pub watchers: i32,
    #[serde(default)]
    pub public: Option<bool>,
    #[serde(default)]
    pub private: Option<bool>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub page_name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadCommit {
    pub sha: String,
    #[serde(default)]
    pub author: Option<CommitAuthor>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub distinct: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitAuthor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Team {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub permission: String,
}

// =============================================================================
// Pre-2015 layout
// =============================================================================

/// Flat pre-2015 archive event.
#[derive(Debug, Clone, Deserialize)]
pub struct EventOld {
    #[serde(rename = "type")]
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub public: bool,
    #[serde(default)]
    pub actor: Option<OldActor>,
    #[serde(default)]
    pub actor_attributes: Option<OldActorAttributes>,
    #[serde(default)]
    pub repository: Option<OldRepository>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Old-format actor: usually a bare login, occasionally an object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OldActor {
    Login(String),
    Object {
        login: String,
        #[serde(default)]
        id: Option<i64>,
    },
}

impl OldActor {
    pub fn login(&self) -> &str {
        match self {
            OldActor::Login(login) => login,
            OldActor::Object { login, .. } => login,
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            OldActor::Login(_) => None,
            OldActor::Object { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OldActorAttributes {
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OldRepository {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl OldRepository {
    /// Full `owner/name` form used by the warehouse.
    pub fn full_name(&self) -> String {
        match (&self.owner, &self.name) {
            (Some(owner), Some(name)) => format!("{owner}/{name}"),
            (None, Some(name)) => name.clone(),
            _ => String::new(),
        }
    }
}

impl EventOld {
    /// Actor login, preferring the envelope over the attributes block.
    pub fn actor_login(&self) -> &str {
        if let Some(actor) = &self.actor {
            return actor.login();
        }
        self.actor_attributes
            .as_ref()
            .and_then(|a| a.login.as_deref())
            .unwrap_or("")
    }

    /// Converts an old-format record into the normalized envelope, hashing
    /// a synthetic event ID and actor ID where the archive supplies none.
    pub fn normalize(&self) -> Event {
        let login = self.actor_login().to_string();
        let actor_id = self
            .actor
            .as_ref()
            .and_then(|a| a.id())
            .unwrap_or_else(|| synthetic_id(&login));
        let repo_name = self
            .repository
            .as_ref()
            .map(|r| r.full_name())
            .unwrap_or_default();
        let repo_id = self
            .repository
            .as_ref()
            .and_then(|r| r.id)
            .unwrap_or_else(|| synthetic_id(&repo_name));
        let id = synthetic_event_id(
            &self.event_type,
            &login,
            &repo_name,
            &self.created_at.to_rfc3339(),
        );

        Event {
            id,
            event_type: self.event_type.clone(),
            public: self.public,
            created_at: self.created_at,
            actor: EventActor {
                id: actor_id,
                login,
            },
            repo: EventRepo {
                id: repo_id,
                name: repo_name,
            },
            org: None,
            payload: self.old_payload(),
        }
    }

    /// Extracts the handful of payload fields the old schema shares with
    /// the modern one.
    fn old_payload(&self) -> Payload {
        let mut payload = Payload::default();
        let Some(raw) = &self.payload else {
            return payload;
        };
        payload.size = raw.get("size").and_then(Value::as_i64).map(|v| v as i32);
        payload.head = raw
            .get("head")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        payload.git_ref = raw
            .get("ref")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        payload.action = raw
            .get("action")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        payload.ref_type = raw
            .get("ref_type")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        payload.master_branch = raw
            .get("master_branch")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        payload.description = raw
            .get("description")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        payload.number = raw
            .get("number")
            .and_then(Value::as_i64)
            .map(|v| v as i32);
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERN_PUSH: &str = r#"{
        "id": "2489651045",
        "type": "PushEvent",
        "actor": {"id": 123, "login": "alice"},
        "repo": {"id": 456, "name": "kubernetes/kubernetes"},
        "org": {"id": 789, "login": "kubernetes"},
        "payload": {
            "push_id": 536863970,
            "size": 1,
            "ref": "refs/heads/master",
            "head": "abc123",
            "before": "def456",
            "commits": [
                {"sha": "abc123", "author": {"name": "Alice A", "email": "a@x.io"},
                 "message": "Fix races\n\nSigned-off-by: Bob <b@x.io>", "distinct": true}
            ]
        },
        "public": true,
        "created_at": "2020-03-01T12:34:56Z"
    }"#;

    const OLD_PUSH: &str = r#"{
        "type": "PushEvent",
        "created_at": "2014-01-01T10:00:00Z",
        "public": true,
        "actor": "bob",
        "actor_attributes": {"login": "bob", "name": "Bob B", "email": "b@x.io"},
        "repository": {"id": 99, "name": "old-repo", "owner": "someorg"},
        "payload": {"size": 2, "head": "ffff", "ref": "refs/heads/main"}
    }"#;

    #[test]
    fn test_parse_modern_event() {
        let event: Event = serde_json::from_str(MODERN_PUSH).unwrap();
        assert_eq!(event.id, "2489651045");
        assert_eq!(event.event_type, "PushEvent");
        assert_eq!(event.actor.login, "alice");
        assert_eq!(event.repo.name, "kubernetes/kubernetes");
        assert_eq!(event.org.as_ref().unwrap().login, "kubernetes");
        let commits = event.payload.commits.as_ref().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].author.as_ref().unwrap().email, "a@x.io");
    }

    #[test]
    fn test_parse_old_event_and_normalize() {
        let old: EventOld = serde_json::from_str(OLD_PUSH).unwrap();
        assert_eq!(old.actor_login(), "bob");
        let event = old.normalize();
        assert!(event.id.starts_with("h:"));
        assert!(event.actor.id < 0);
        assert_eq!(event.repo.name, "someorg/old-repo");
        assert_eq!(event.payload.size, Some(2));
        // Same input yields the same synthetic ID.
        let again: EventOld = serde_json::from_str(OLD_PUSH).unwrap();
        assert_eq!(event.id, again.normalize().id);
    }

    #[test]
    fn test_old_actor_object_form() {
        let raw = r#"{"type": "WatchEvent", "created_at": "2013-05-01T00:00:00Z",
                      "actor": {"login": "carol", "id": 777}}"#;
        let old: EventOld = serde_json::from_str(raw).unwrap();
        let event = old.normalize();
        assert_eq!(event.actor.id, 777);
        assert_eq!(event.actor.login, "carol");
    }

    #[test]
    fn test_payload_defaults_empty() {
        let raw = r#"{"id": "1", "type": "WatchEvent",
                      "actor": {"id": 1, "login": "a"},
                      "repo": {"id": 2, "name": "o/r"},
                      "created_at": "2020-01-01T00:00:00Z"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert!(event.payload.issue.is_none());
        assert!(event.public);
    }
}
