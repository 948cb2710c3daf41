//! Normalized event writer.
//!
//! One archive event becomes one transaction: the event row, its payload
//! row and every child (issue, PR, comment, commits, roles, …) either all
//! land or none do. Inserts are `ON CONFLICT DO NOTHING` throughout, so
//! re-ingesting an hour is a no-op and at-least-once delivery is safe.
//!
//! Child rows carry denormalized `dup_*` copies of the actor login, repo
//! name, event type and event timestamp so analytical queries never join
//! back to `gha_events`.

use std::sync::Arc;

use sqlx::{Postgres, Row, Transaction};

use crate::config::HideMap;
use crate::ghevent::{
    Actor, Branch, Comment, Event, Forkee, Issue, Label, Milestone, Page, PayloadCommit,
    PullRequest, Release, Review, Team,
};
use crate::storage::schema::maxlen;
use crate::storage::Database;
use crate::utils::{clean_text, synthetic_id};

use super::roles::{lookup_actor, parse_commit_roles, ActorCache};
use super::IngestError;

type Tx<'a> = Transaction<'a, Postgres>;

/// Writes archive events into the warehouse.
pub struct EventWriter {
    db: Database,
    hide: Arc<HideMap>,
    cache: ActorCache,
}

impl EventWriter {
    /// Creates a writer sharing the given pools and hide map.
    pub fn new(db: Database, hide: Arc<HideMap>) -> Self {
        Self {
            db,
            hide,
            cache: ActorCache::new(),
        }
    }

    fn login(&self, login: &str) -> String {
        clean_text(self.hide.maybe_hide(login), maxlen::LOGIN)
    }

    /// Upserts one event and all of its children in a single transaction.
    ///
    /// Returns `false` without side effects when the event is already
    /// present (by ID, which is synthetic-hashed for pre-2015 records).
    pub async fn write_event(&self, event: &Event) -> Result<bool, IngestError> {
        let existing = sqlx::query("SELECT 1 FROM gha_events WHERE id = $1")
            .bind(&event.id)
            .fetch_optional(self.db.pool())
            .await?;
        if existing.is_some() {
            return Ok(false);
        }

        let mut tx = self.db.pool().begin().await?;

        if let Some(org) = &event.org {
            sqlx::query("INSERT INTO gha_orgs(id, login) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                .bind(org.id)
                .bind(&org.login)
                .execute(&mut *tx)
                .await?;
        }

        let org_login = event.org.as_ref().map(|o| o.login.clone()).or_else(|| {
            event
                .repo
                .name
                .split_once('/')
                .map(|(owner, _)| owner.to_string())
        });
        sqlx::query(
            "INSERT INTO gha_repos(id, name, org_id, org_login) VALUES ($1, $2, $3, $4) \
             ON CONFLICT DO NOTHING",
        )
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(event.org.as_ref().map(|o| o.id))
        .bind(org_login)
        .execute(&mut *tx)
        .await?;

        self.ensure_actor(&mut tx, event.actor.id, &event.actor.login, None)
            .await?;

        let actor_login = self.login(&event.actor.login);
        sqlx::query(
            "INSERT INTO gha_events(id, type, actor_id, repo_id, org_id, forkee_id, public, \
             created_at, dup_actor_login, dup_repo_name) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) ON CONFLICT DO NOTHING",
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(event.actor.id)
        .bind(event.repo.id)
        .bind(event.org.as_ref().map(|o| o.id))
        .bind(event.payload.forkee.as_ref().map(|f| f.id))
        .bind(event.public)
        .bind(event.created_at)
        .bind(&actor_login)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .execute(&mut *tx)
        .await?;

        self.write_payload(&mut tx, event).await?;

        if let Some(issue) = &event.payload.issue {
            self.write_issue(&mut tx, event, issue).await?;
        }
        if let Some(pr) = &event.payload.pull_request {
            self.write_pull_request(&mut tx, event, pr).await?;
        }
        if let Some(comment) = &event.payload.comment {
            self.write_comment(&mut tx, event, comment).await?;
        }
        if let Some(review) = &event.payload.review {
            self.write_review(&mut tx, event, review).await?;
        }
        if let Some(release) = &event.payload.release {
            self.write_release(&mut tx, event, release).await?;
        }
        if let Some(forkee) = &event.payload.forkee {
            self.write_forkee(&mut tx, event, forkee).await?;
        }
        if let Some(pages) = &event.payload.pages {
            self.write_pages(&mut tx, event, pages).await?;
        }
        if let Some(member) = &event.payload.member {
            self.ensure_actor(&mut tx, member.id, &member.login, member.name.as_deref())
                .await?;
        }
        if let Some(commits) = &event.payload.commits {
            self.write_commits(&mut tx, event, commits).await?;
        }
        if let Some(team) = &event.payload.team {
            self.write_team(&mut tx, event, team).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Finds the newest actor with the given login (case-insensitive), or
    /// creates a synthetic one with a hashed negative ID.
    pub async fn actor_id_for_login(&self, login: &str) -> Result<i64, IngestError> {
        let row = sqlx::query(
            "SELECT id FROM gha_actors WHERE lower(login) = lower($1) ORDER BY id DESC LIMIT 1",
        )
        .bind(login)
        .fetch_optional(self.db.pool())
        .await?;
        if let Some(row) = row {
            return Ok(row.get::<i64, _>("id"));
        }
        let id = synthetic_id(login);
        sqlx::query("INSERT INTO gha_actors(id, login) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(id)
            .bind(self.login(login))
            .execute(self.db.pool())
            .await?;
        Ok(id)
    }

    async fn ensure_actor(
        &self,
        tx: &mut Tx<'_>,
        id: i64,
        login: &str,
        name: Option<&str>,
    ) -> Result<(), IngestError> {
        sqlx::query("INSERT INTO gha_actors(id, login, name) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING")
            .bind(id)
            .bind(self.login(login))
            .bind(name.map(|n| clean_text(self.hide.maybe_hide(n), maxlen::NAME)))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn ensure_actor_obj(&self, tx: &mut Tx<'_>, actor: &Actor) -> Result<(), IngestError> {
        self.ensure_actor(tx, actor.id, &actor.login, actor.name.as_deref())
            .await
    }

    async fn write_payload(&self, tx: &mut Tx<'_>, event: &Event) -> Result<(), IngestError> {
        let p = &event.payload;
        sqlx::query(
            "INSERT INTO gha_payloads(event_id, push_id, size, ref, head, befor, action, \
             issue_id, pull_request_id, comment_id, ref_type, master_branch, description, \
             number, forkee_id, release_id, member_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&event.id)
        .bind(p.push_id)
        .bind(p.size)
        .bind(p.git_ref.as_ref().map(|r| clean_text(r, maxlen::REF)))
        .bind(&p.head)
        .bind(&p.before)
        .bind(&p.action)
        .bind(p.issue.as_ref().map(|i| i.id))
        .bind(p.pull_request.as_ref().map(|pr| pr.id))
        .bind(p.comment.as_ref().map(|c| c.id))
        .bind(&p.ref_type)
        .bind(p.master_branch.as_ref().map(|b| clean_text(b, maxlen::REF)))
        .bind(p.description.as_ref().map(|d| clean_text(d, maxlen::BODY)))
        .bind(p.number)
        .bind(p.forkee.as_ref().map(|f| f.id))
        .bind(p.release.as_ref().map(|r| r.id))
        .bind(p.member.as_ref().map(|m| m.id))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_issue(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        issue: &Issue,
    ) -> Result<(), IngestError> {
        if let Some(milestone) = &issue.milestone {
            self.write_milestone(tx, event, milestone).await?;
        }
        let user = match &issue.user {
            Some(user) => {
                self.ensure_actor_obj(tx, user).await?;
                user.clone()
            }
            None => Actor {
                id: event.actor.id,
                login: event.actor.login.clone(),
                name: None,
            },
        };
        if let Some(assignee) = &issue.assignee {
            self.ensure_actor_obj(tx, assignee).await?;
        }

        let created_at = issue.created_at.unwrap_or(event.created_at);
        let updated_at = issue.updated_at.unwrap_or(event.created_at);
        let is_pr = issue.pull_request.is_some();

        sqlx::query(
            "INSERT INTO gha_issues(id, event_id, assignee_id, body, closed_at, comments, \
             created_at, locked, milestone_id, number, state, title, updated_at, user_id, \
             is_pull_request, dup_actor_id, dup_actor_login, dup_repo_id, dup_repo_name, \
             dup_type, dup_created_at, dup_user_login) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21, $22) ON CONFLICT DO NOTHING",
        )
        .bind(issue.id)
        .bind(&event.id)
        .bind(issue.assignee.as_ref().map(|a| a.id))
        .bind(issue.body.as_ref().map(|b| clean_text(b, maxlen::BODY)))
        .bind(issue.closed_at)
        .bind(issue.comments)
        .bind(created_at)
        .bind(issue.locked)
        .bind(issue.milestone.as_ref().map(|m| m.id))
        .bind(issue.number)
        .bind(&issue.state)
        .bind(clean_text(&issue.title, maxlen::BODY))
        .bind(updated_at)
        .bind(user.id)
        .bind(is_pr)
        .bind(event.actor.id)
        .bind(self.login(&event.actor.login))
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(&event.event_type)
        .bind(event.created_at)
        .bind(self.login(&user.login))
        .execute(&mut **tx)
        .await?;

        for assignee in &issue.assignees {
            self.ensure_actor_obj(tx, assignee).await?;
            self.write_issue_assignee(tx, event, issue.id, assignee.id)
                .await?;
        }
        if let Some(assignee) = &issue.assignee {
            self.write_issue_assignee(tx, event, issue.id, assignee.id)
                .await?;
        }
        for label in &issue.labels {
            self.write_label(tx, event, label).await?;
            self.write_issue_label(tx, event, issue, label).await?;
        }
        Ok(())
    }

    async fn write_issue_assignee(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        issue_id: i64,
        assignee_id: i64,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "INSERT INTO gha_issues_assignees(issue_id, event_id, assignee_id, dup_actor_id, \
             dup_actor_login, dup_repo_id, dup_repo_name, dup_type, dup_created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT DO NOTHING",
        )
        .bind(issue_id)
        .bind(&event.id)
        .bind(assignee_id)
        .bind(event.actor.id)
        .bind(self.login(&event.actor.login))
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(&event.event_type)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_label(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        label: &Label,
    ) -> Result<(), IngestError> {
        let label_id = label
            .id
            .unwrap_or_else(|| synthetic_id(&label.name));
        sqlx::query(
            "INSERT INTO gha_labels(id, event_id, name, color, is_default, dup_type, \
             dup_created_at) VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT DO NOTHING",
        )
        .bind(label_id)
        .bind(&event.id)
        .bind(clean_text(&label.name, maxlen::NAME))
        .bind(&label.color)
        .bind(label.default)
        .bind(&event.event_type)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_issue_label(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        issue: &Issue,
        label: &Label,
    ) -> Result<(), IngestError> {
        let label_id = label
            .id
            .unwrap_or_else(|| synthetic_id(&label.name));
        sqlx::query(
            "INSERT INTO gha_issues_labels(issue_id, event_id, label_id, dup_actor_id, \
             dup_actor_login, dup_repo_id, dup_repo_name, dup_type, dup_created_at, \
             dup_issue_number, dup_label_name) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) ON CONFLICT DO NOTHING",
        )
        .bind(issue.id)
        .bind(&event.id)
        .bind(label_id)
        .bind(event.actor.id)
        .bind(self.login(&event.actor.login))
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(&event.event_type)
        .bind(event.created_at)
        .bind(issue.number)
        .bind(clean_text(&label.name, maxlen::NAME))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_milestone(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        milestone: &Milestone,
    ) -> Result<(), IngestError> {
        if let Some(creator) = &milestone.creator {
            self.ensure_actor_obj(tx, creator).await?;
        }
        sqlx::query(
            "INSERT INTO gha_milestones(id, event_id, closed_at, closed_issues, created_at, \
             creator_id, description, due_on, number, open_issues, state, title, updated_at, \
             dup_actor_id, dup_actor_login, dup_repo_id, dup_repo_name, dup_type, dup_created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19) ON CONFLICT DO NOTHING",
        )
        .bind(milestone.id)
        .bind(&event.id)
        .bind(milestone.closed_at)
        .bind(milestone.closed_issues)
        .bind(milestone.created_at.unwrap_or(event.created_at))
        .bind(milestone.creator.as_ref().map(|c| c.id))
        .bind(
            milestone
                .description
                .as_ref()
                .map(|d| clean_text(d, maxlen::BODY)),
        )
        .bind(milestone.due_on)
        .bind(milestone.number)
        .bind(milestone.open_issues)
        .bind(&milestone.state)
        .bind(clean_text(&milestone.title, maxlen::TITLE))
        .bind(milestone.updated_at.unwrap_or(event.created_at))
        .bind(event.actor.id)
        .bind(self.login(&event.actor.login))
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(&event.event_type)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_pull_request(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        pr: &PullRequest,
    ) -> Result<(), IngestError> {
        if let Some(milestone) = &pr.milestone {
            self.write_milestone(tx, event, milestone).await?;
        }
        let user = match &pr.user {
            Some(user) => {
                self.ensure_actor_obj(tx, user).await?;
                user.clone()
            }
            None => Actor {
                id: event.actor.id,
                login: event.actor.login.clone(),
                name: None,
            },
        };
        if let Some(merged_by) = &pr.merged_by {
            self.ensure_actor_obj(tx, merged_by).await?;
        }
        if let Some(assignee) = &pr.assignee {
            self.ensure_actor_obj(tx, assignee).await?;
        }
        let base_sha = match &pr.base {
            Some(base) => {
                self.write_branch(tx, event, base).await?;
                base.sha.clone().unwrap_or_default()
            }
            None => String::new(),
        };
        let head_sha = match &pr.head {
            Some(head) => {
                self.write_branch(tx, event, head).await?;
                head.sha.clone().unwrap_or_default()
            }
            None => String::new(),
        };

        sqlx::query(
            "INSERT INTO gha_pull_requests(id, event_id, user_id, base_sha, head_sha, \
             merged_by_id, assignee_id, milestone_id, number, state, title, body, created_at, \
             updated_at, closed_at, merged_at, merge_commit_sha, merged, mergeable, additions, \
             deletions, changed_files, comments, commits, draft, dup_actor_id, dup_actor_login, \
             dup_repo_id, dup_repo_name, dup_type, dup_created_at, dup_user_login) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32) \
             ON CONFLICT DO NOTHING",
        )
        .bind(pr.id)
        .bind(&event.id)
        .bind(user.id)
        .bind(&base_sha)
        .bind(&head_sha)
        .bind(pr.merged_by.as_ref().map(|a| a.id))
        .bind(pr.assignee.as_ref().map(|a| a.id))
        .bind(pr.milestone.as_ref().map(|m| m.id))
        .bind(pr.number)
        .bind(&pr.state)
        .bind(clean_text(&pr.title, maxlen::BODY))
        .bind(pr.body.as_ref().map(|b| clean_text(b, maxlen::BODY)))
        .bind(pr.created_at.unwrap_or(event.created_at))
        .bind(pr.updated_at.unwrap_or(event.created_at))
        .bind(pr.closed_at)
        .bind(pr.merged_at)
        .bind(&pr.merge_commit_sha)
        .bind(pr.merged)
        .bind(pr.mergeable)
        .bind(pr.additions)
        .bind(pr.deletions)
        .bind(pr.changed_files)
        .bind(pr.comments)
        .bind(pr.commits)
        .bind(pr.draft)
        .bind(event.actor.id)
        .bind(self.login(&event.actor.login))
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(&event.event_type)
        .bind(event.created_at)
        .bind(self.login(&user.login))
        .execute(&mut **tx)
        .await?;

        if let Some(assignees) = &pr.assignees {
            for assignee in assignees {
                self.ensure_actor_obj(tx, assignee).await?;
                sqlx::query(
                    "INSERT INTO gha_pull_requests_assignees(pull_request_id, event_id, \
                     assignee_id, dup_actor_id, dup_actor_login, dup_repo_id, dup_repo_name, \
                     dup_type, dup_created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                     ON CONFLICT DO NOTHING",
                )
                .bind(pr.id)
                .bind(&event.id)
                .bind(assignee.id)
                .bind(event.actor.id)
                .bind(self.login(&event.actor.login))
                .bind(event.repo.id)
                .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
                .bind(&event.event_type)
                .bind(event.created_at)
                .execute(&mut **tx)
                .await?;
            }
        }
        if let Some(reviewers) = &pr.requested_reviewers {
            for reviewer in reviewers {
                self.ensure_actor_obj(tx, reviewer).await?;
                sqlx::query(
                    "INSERT INTO gha_pull_requests_requested_reviewers(pull_request_id, \
                     event_id, requested_reviewer_id, dup_actor_id, dup_actor_login, \
                     dup_repo_id, dup_repo_name, dup_type, dup_created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT DO NOTHING",
                )
                .bind(pr.id)
                .bind(&event.id)
                .bind(reviewer.id)
                .bind(event.actor.id)
                .bind(self.login(&event.actor.login))
                .bind(event.repo.id)
                .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
                .bind(&event.event_type)
                .bind(event.created_at)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn write_branch(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        branch: &Branch,
    ) -> Result<(), IngestError> {
        let Some(sha) = &branch.sha else {
            return Ok(());
        };
        if let Some(user) = &branch.user {
            self.ensure_actor_obj(tx, user).await?;
        }
        if let Some(repo) = &branch.repo {
            self.write_forkee(tx, event, repo).await?;
        }
        sqlx::query(
            "INSERT INTO gha_branches(sha, event_id, user_id, repo_id, label, ref, dup_type, \
             dup_created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT DO NOTHING",
        )
        .bind(sha)
        .bind(&event.id)
        .bind(branch.user.as_ref().map(|u| u.id))
        .bind(branch.repo.as_ref().map(|r| r.id))
        .bind(
            branch
                .label
                .as_ref()
                .map(|l| clean_text(l, maxlen::REF))
                .unwrap_or_default(),
        )
        .bind(
            branch
                .git_ref
                .as_ref()
                .map(|r| clean_text(r, maxlen::REF))
                .unwrap_or_default(),
        )
        .bind(&event.event_type)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_forkee(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        forkee: &Forkee,
    ) -> Result<(), IngestError> {
        let owner = match &forkee.owner {
            Some(owner) => {
                self.ensure_actor_obj(tx, owner).await?;
                owner.clone()
            }
            None => Actor {
                id: event.actor.id,
                login: event.actor.login.clone(),
                name: None,
            },
        };
        let public = forkee.public.or(forkee.private.map(|p| !p));
        sqlx::query(
            "INSERT INTO gha_forkees(id, event_id, name, full_name, owner_id, description, \
             fork, created_at, updated_at, pushed_at, homepage, size, language, \
             stargazers_count, forks, default_branch, open_issues, watchers, public, \
             dup_actor_id, dup_actor_login, dup_repo_id, dup_repo_name, dup_type, \
             dup_created_at, dup_owner_login) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21, $22, $23, $24, $25, $26) ON CONFLICT DO NOTHING",
        )
        .bind(forkee.id)
        .bind(&event.id)
        .bind(clean_text(&forkee.name, 80))
        .bind(clean_text(&forkee.full_name, maxlen::REPO_NAME))
        .bind(owner.id)
        .bind(
            forkee
                .description
                .as_ref()
                .map(|d| clean_text(d, maxlen::BODY)),
        )
        .bind(forkee.fork)
        .bind(forkee.created_at.unwrap_or(event.created_at))
        .bind(forkee.updated_at.unwrap_or(event.created_at))
        .bind(forkee.pushed_at)
        .bind(&forkee.homepage)
        .bind(forkee.size)
        .bind(&forkee.language)
        .bind(forkee.stargazers_count)
        .bind(forkee.forks)
        .bind(
            forkee
                .default_branch
                .clone()
                .unwrap_or_else(|| "master".to_string()),
        )
        .bind(forkee.open_issues)
        .bind(forkee.watchers)
        .bind(public)
        .bind(event.actor.id)
        .bind(self.login(&event.actor.login))
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(&event.event_type)
        .bind(event.created_at)
        .bind(self.login(&owner.login))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_comment(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        comment: &Comment,
    ) -> Result<(), IngestError> {
        let user = match &comment.user {
            Some(user) => {
                self.ensure_actor_obj(tx, user).await?;
                user.clone()
            }
            None => Actor {
                id: event.actor.id,
                login: event.actor.login.clone(),
                name: None,
            },
        };
        sqlx::query(
            "INSERT INTO gha_comments(id, event_id, body, created_at, updated_at, user_id, \
             commit_id, original_commit_id, diff_hunk, position, original_position, path, \
             pull_request_review_id, line, dup_actor_id, dup_actor_login, dup_repo_id, \
             dup_repo_name, dup_type, dup_created_at, dup_user_login) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21) ON CONFLICT DO NOTHING",
        )
        .bind(comment.id)
        .bind(&event.id)
        .bind(clean_text(&comment.body, maxlen::BODY))
        .bind(comment.created_at.unwrap_or(event.created_at))
        .bind(comment.updated_at.unwrap_or(event.created_at))
        .bind(user.id)
        .bind(&comment.commit_id)
        .bind(&comment.original_commit_id)
        .bind(
            comment
                .diff_hunk
                .as_ref()
                .map(|d| clean_text(d, maxlen::BODY)),
        )
        .bind(comment.position)
        .bind(comment.original_position)
        .bind(&comment.path)
        .bind(comment.pull_request_review_id)
        .bind(comment.line)
        .bind(event.actor.id)
        .bind(self.login(&event.actor.login))
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(&event.event_type)
        .bind(event.created_at)
        .bind(self.login(&user.login))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_review(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        review: &Review,
    ) -> Result<(), IngestError> {
        let user = match &review.user {
            Some(user) => {
                self.ensure_actor_obj(tx, user).await?;
                user.clone()
            }
            None => Actor {
                id: event.actor.id,
                login: event.actor.login.clone(),
                name: None,
            },
        };
        let pull_request_id = event
            .payload
            .pull_request
            .as_ref()
            .map(|pr| pr.id)
            .unwrap_or(0);
        sqlx::query(
            "INSERT INTO gha_reviews(id, event_id, pull_request_id, user_id, body, state, \
             commit_id, submitted_at, dup_actor_id, dup_actor_login, dup_repo_id, \
             dup_repo_name, dup_type, dup_created_at, dup_user_login) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT DO NOTHING",
        )
        .bind(review.id)
        .bind(&event.id)
        .bind(pull_request_id)
        .bind(user.id)
        .bind(review.body.as_ref().map(|b| clean_text(b, maxlen::BODY)))
        .bind(&review.state)
        .bind(&review.commit_id)
        .bind(review.submitted_at)
        .bind(event.actor.id)
        .bind(self.login(&event.actor.login))
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(&event.event_type)
        .bind(event.created_at)
        .bind(self.login(&user.login))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_release(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        release: &Release,
    ) -> Result<(), IngestError> {
        let author = match &release.author {
            Some(author) => {
                self.ensure_actor_obj(tx, author).await?;
                author.clone()
            }
            None => Actor {
                id: event.actor.id,
                login: event.actor.login.clone(),
                name: None,
            },
        };
        sqlx::query(
            "INSERT INTO gha_releases(id, event_id, tag_name, target_commitish, name, draft, \
             prerelease, created_at, published_at, body, author_id, dup_actor_id, \
             dup_actor_login, dup_repo_id, dup_repo_name, dup_type, dup_created_at, \
             dup_author_login) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18) ON CONFLICT DO NOTHING",
        )
        .bind(release.id)
        .bind(&event.id)
        .bind(clean_text(&release.tag_name, maxlen::REF))
        .bind(clean_text(&release.target_commitish, maxlen::REF))
        .bind(release.name.as_ref().map(|n| clean_text(n, maxlen::REF)))
        .bind(release.draft)
        .bind(release.prerelease)
        .bind(release.created_at.unwrap_or(event.created_at))
        .bind(release.published_at)
        .bind(release.body.as_ref().map(|b| clean_text(b, maxlen::BODY)))
        .bind(author.id)
        .bind(event.actor.id)
        .bind(self.login(&event.actor.login))
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(&event.event_type)
        .bind(event.created_at)
        .bind(self.login(&author.login))
        .execute(&mut **tx)
        .await?;

        for asset in &release.assets {
            sqlx::query(
                "INSERT INTO gha_assets(id, event_id, name, label, content_type, size, \
                 download_count, created_at, updated_at, dup_actor_id, dup_actor_login, \
                 dup_repo_id, dup_repo_name, dup_type, dup_created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(asset.id)
            .bind(&event.id)
            .bind(clean_text(&asset.name, maxlen::REF))
            .bind(&asset.label)
            .bind(&asset.content_type)
            .bind(asset.size)
            .bind(asset.download_count)
            .bind(asset.created_at.unwrap_or(event.created_at))
            .bind(asset.updated_at.unwrap_or(event.created_at))
            .bind(event.actor.id)
            .bind(self.login(&event.actor.login))
            .bind(event.repo.id)
            .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
            .bind(&event.event_type)
            .bind(event.created_at)
            .execute(&mut **tx)
            .await?;

            sqlx::query(
                "INSERT INTO gha_releases_assets(release_id, event_id, asset_id, dup_repo_id, \
                 dup_repo_name, dup_type, dup_created_at) VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(release.id)
            .bind(&event.id)
            .bind(asset.id)
            .bind(event.repo.id)
            .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
            .bind(&event.event_type)
            .bind(event.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn write_pages(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        pages: &[Page],
    ) -> Result<(), IngestError> {
        for page in pages {
            let Some(sha) = &page.sha else {
                continue;
            };
            sqlx::query(
                "INSERT INTO gha_pages(sha, event_id, action, title, dup_actor_id, \
                 dup_actor_login, dup_repo_id, dup_repo_name, dup_type, dup_created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) ON CONFLICT DO NOTHING",
            )
            .bind(sha)
            .bind(&event.id)
            .bind(page.action.clone().unwrap_or_default())
            .bind(clean_text(
                page.title
                    .as_deref()
                    .or(page.page_name.as_deref())
                    .unwrap_or(""),
                300,
            ))
            .bind(event.actor.id)
            .bind(self.login(&event.actor.login))
            .bind(event.repo.id)
            .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
            .bind(&event.event_type)
            .bind(event.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn write_commits(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        commits: &[PayloadCommit],
    ) -> Result<(), IngestError> {
        for commit in commits {
            let (author_name, author_email) = match &commit.author {
                Some(author) => (author.name.clone(), author.email.clone()),
                None => (String::new(), String::new()),
            };
            sqlx::query(
                "INSERT INTO gha_commits(sha, event_id, author_name, author_email, message, \
                 is_distinct, dup_actor_id, dup_actor_login, dup_repo_id, dup_repo_name, \
                 dup_type, dup_created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(&commit.sha)
            .bind(&event.id)
            .bind(clean_text(self.hide.maybe_hide(&author_name), maxlen::NAME))
            .bind(clean_text(self.hide.maybe_hide(&author_email), maxlen::EMAIL))
            .bind(clean_text(&commit.message, maxlen::BODY))
            .bind(commit.distinct.unwrap_or(true))
            .bind(event.actor.id)
            .bind(self.login(&event.actor.login))
            .bind(event.repo.id)
            .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
            .bind(&event.event_type)
            .bind(event.created_at)
            .execute(&mut **tx)
            .await?;

            for role in parse_commit_roles(&commit.message) {
                let actor = lookup_actor(&self.db, &self.cache, &role.name, &role.email).await?;
                let (actor_id, actor_login) = match actor {
                    Some((id, login)) => (Some(id), Some(self.login(&login))),
                    None => (None, None),
                };
                sqlx::query(
                    "INSERT INTO gha_commits_roles(sha, event_id, role, actor_id, actor_login, \
                     actor_name, actor_email, repo_id, repo_name, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) ON CONFLICT DO NOTHING",
                )
                .bind(&commit.sha)
                .bind(&event.id)
                .bind(role.role)
                .bind(actor_id)
                .bind(actor_login)
                .bind(clean_text(self.hide.maybe_hide(&role.name), maxlen::NAME))
                .bind(clean_text(self.hide.maybe_hide(&role.email), maxlen::EMAIL))
                .bind(event.repo.id)
                .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
                .bind(event.created_at)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn write_team(
        &self,
        tx: &mut Tx<'_>,
        event: &Event,
        team: &Team,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "INSERT INTO gha_teams(id, event_id, name, slug, permission, dup_actor_id, \
             dup_actor_login, dup_repo_id, dup_repo_name, dup_type, dup_created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) ON CONFLICT DO NOTHING",
        )
        .bind(team.id)
        .bind(&event.id)
        .bind(clean_text(&team.name, maxlen::LOGIN))
        .bind(clean_text(&team.slug, maxlen::LOGIN))
        .bind(&team.permission)
        .bind(event.actor.id)
        .bind(self.login(&event.actor.login))
        .bind(event.repo.id)
        .bind(clean_text(&event.repo.name, maxlen::REPO_NAME))
        .bind(&event.event_type)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            "INSERT INTO gha_teams_repositories(team_id, event_id, repository_id, dup_type, \
             dup_created_at) VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
        )
        .bind(team.id)
        .bind(&event.id)
        .bind(event.repo.id)
        .bind(&event.event_type)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
