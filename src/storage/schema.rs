//! Warehouse DDL and declared column maxima.
//!
//! The event warehouse schema is fixed: the pipeline never invents event
//! tables at runtime (time-series tables are the exception, created on
//! demand by `series`). The statements here are all `IF NOT EXISTS` so the
//! structure pass stays idempotent.

/// Declared byte-length maxima for denormalized text columns. Writers
/// truncate through `utils::clean_text` against these.
pub mod maxlen {
    /// Actor login.
    pub const LOGIN: usize = 120;
    /// Actor or author display name.
    pub const NAME: usize = 160;
    /// Email address.
    pub const EMAIL: usize = 160;
    /// `org/repo` name.
    pub const REPO_NAME: usize = 160;
    /// Issue / PR / milestone title.
    pub const TITLE: usize = 1000;
    /// Free-form body or commit message.
    pub const BODY: usize = 65535;
    /// Company name after canonicalization.
    pub const COMPANY: usize = 160;
    /// Git ref or branch label.
    pub const REF: usize = 200;
}

pub const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_events (
    id VARCHAR(40) PRIMARY KEY,
    type VARCHAR(40) NOT NULL,
    actor_id BIGINT NOT NULL,
    repo_id BIGINT NOT NULL,
    org_id BIGINT,
    forkee_id BIGINT,
    public BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL
)
"#;

pub const CREATE_ACTORS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_actors (
    id BIGINT PRIMARY KEY,
    login VARCHAR(120) NOT NULL,
    name VARCHAR(160),
    country_id VARCHAR(2),
    sex VARCHAR(1),
    sex_prob DOUBLE PRECISION,
    tz VARCHAR(40),
    tz_offset INTEGER,
    age INTEGER
)
"#;

pub const CREATE_ACTORS_EMAILS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_actors_emails (
    actor_id BIGINT NOT NULL,
    email VARCHAR(160) NOT NULL,
    origin SMALLINT NOT NULL DEFAULT 0,
    PRIMARY KEY (actor_id, email)
)
"#;

pub const CREATE_ACTORS_NAMES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_actors_names (
    actor_id BIGINT NOT NULL,
    name VARCHAR(160) NOT NULL,
    origin SMALLINT NOT NULL DEFAULT 0,
    PRIMARY KEY (actor_id, name)
)
"#;

pub const CREATE_ACTORS_AFFILIATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_actors_affiliations (
    actor_id BIGINT NOT NULL,
    company_name VARCHAR(160) NOT NULL,
    original_company_name VARCHAR(160) NOT NULL,
    dt_from TIMESTAMPTZ NOT NULL,
    dt_to TIMESTAMPTZ NOT NULL,
    source VARCHAR(30) NOT NULL DEFAULT '',
    PRIMARY KEY (actor_id, company_name, dt_from, dt_to)
)
"#;

pub const CREATE_REPOS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_repos (
    id BIGINT NOT NULL,
    name VARCHAR(160) NOT NULL,
    org_id BIGINT,
    org_login VARCHAR(100),
    license_key VARCHAR(40),
    license_name VARCHAR(80),
    updated_at TIMESTAMPTZ,
    PRIMARY KEY (id, name)
)
"#;

pub const CREATE_REPOS_LANGS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_repos_langs (
    repo_id BIGINT NOT NULL,
    repo_name VARCHAR(160) NOT NULL,
    lang_name VARCHAR(60) NOT NULL,
    lang_loc BIGINT NOT NULL,
    lang_perc DOUBLE PRECISION NOT NULL,
    dt TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (repo_name, lang_name)
)
"#;

pub const CREATE_ORGS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_orgs (
    id BIGINT PRIMARY KEY,
    login VARCHAR(100) NOT NULL
)
"#;

pub const CREATE_PAYLOADS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_payloads (
    event_id VARCHAR(40) PRIMARY KEY,
    push_id BIGINT,
    size INTEGER,
    ref VARCHAR(200),
    head VARCHAR(40),
    befor VARCHAR(40),
    action VARCHAR(40),
    issue_id BIGINT,
    pull_request_id BIGINT,
    comment_id BIGINT,
    ref_type VARCHAR(20),
    master_branch VARCHAR(200),
    description TEXT,
    number INTEGER,
    forkee_id BIGINT,
    release_id BIGINT,
    member_id BIGINT
)
"#;

pub const CREATE_COMMITS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_commits (
    sha VARCHAR(40) NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    author_name VARCHAR(160) NOT NULL,
    author_email VARCHAR(160) NOT NULL DEFAULT '',
    message TEXT NOT NULL,
    is_distinct BOOLEAN NOT NULL DEFAULT TRUE,
    author_id BIGINT,
    committer_id BIGINT,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (sha, event_id)
)
"#;

pub const CREATE_COMMITS_ROLES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_commits_roles (
    sha VARCHAR(40) NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    role VARCHAR(40) NOT NULL,
    actor_id BIGINT,
    actor_login VARCHAR(120),
    actor_name VARCHAR(160) NOT NULL DEFAULT '',
    actor_email VARCHAR(160) NOT NULL DEFAULT '',
    repo_id BIGINT NOT NULL,
    repo_name VARCHAR(160) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    UNIQUE (sha, event_id, role, actor_email, actor_name)
)
"#;

pub const CREATE_PAGES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_pages (
    sha VARCHAR(40) NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    action VARCHAR(20) NOT NULL,
    title VARCHAR(300) NOT NULL,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (sha, event_id, action, title)
)
"#;

pub const CREATE_COMMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_comments (
    id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    body TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    user_id BIGINT NOT NULL,
    commit_id VARCHAR(40),
    original_commit_id VARCHAR(40),
    diff_hunk TEXT,
    position INTEGER,
    original_position INTEGER,
    path TEXT,
    pull_request_review_id BIGINT,
    line INTEGER,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    dup_user_login VARCHAR(120) NOT NULL,
    PRIMARY KEY (id, event_id)
)
"#;

pub const CREATE_ISSUES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_issues (
    id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    assignee_id BIGINT,
    body TEXT,
    closed_at TIMESTAMPTZ,
    comments INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    locked BOOLEAN NOT NULL DEFAULT FALSE,
    milestone_id BIGINT,
    number INTEGER NOT NULL,
    state VARCHAR(20) NOT NULL,
    title TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    user_id BIGINT NOT NULL,
    is_pull_request BOOLEAN NOT NULL DEFAULT FALSE,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    dup_user_login VARCHAR(120) NOT NULL,
    PRIMARY KEY (id, event_id)
)
"#;

pub const CREATE_ISSUES_ASSIGNEES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_issues_assignees (
    issue_id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    assignee_id BIGINT NOT NULL,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (issue_id, event_id, assignee_id)
)
"#;

pub const CREATE_ISSUES_LABELS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_issues_labels (
    issue_id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    label_id BIGINT NOT NULL,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    dup_issue_number INTEGER NOT NULL,
    dup_label_name VARCHAR(160) NOT NULL,
    PRIMARY KEY (issue_id, event_id, label_id)
)
"#;

pub const CREATE_LABELS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_labels (
    id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    name VARCHAR(160) NOT NULL,
    color VARCHAR(8) NOT NULL,
    is_default BOOLEAN,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (id, event_id)
)
"#;

pub const CREATE_MILESTONES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_milestones (
    id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    closed_at TIMESTAMPTZ,
    closed_issues INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    creator_id BIGINT,
    description TEXT,
    due_on TIMESTAMPTZ,
    number INTEGER NOT NULL,
    open_issues INTEGER NOT NULL DEFAULT 0,
    state VARCHAR(20) NOT NULL,
    title VARCHAR(1000) NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (id, event_id)
)
"#;

pub const CREATE_PULL_REQUESTS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_pull_requests (
    id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    user_id BIGINT NOT NULL,
    base_sha VARCHAR(40) NOT NULL,
    head_sha VARCHAR(40) NOT NULL,
    merged_by_id BIGINT,
    assignee_id BIGINT,
    milestone_id BIGINT,
    number INTEGER NOT NULL,
    state VARCHAR(20) NOT NULL,
    title TEXT NOT NULL,
    body TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    closed_at TIMESTAMPTZ,
    merged_at TIMESTAMPTZ,
    merge_commit_sha VARCHAR(40),
    merged BOOLEAN,
    mergeable BOOLEAN,
    additions INTEGER,
    deletions INTEGER,
    changed_files INTEGER,
    comments INTEGER,
    commits INTEGER,
    draft BOOLEAN,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    dup_user_login VARCHAR(120) NOT NULL,
    PRIMARY KEY (id, event_id)
)
"#;

pub const CREATE_PULL_REQUESTS_ASSIGNEES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_pull_requests_assignees (
    pull_request_id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    assignee_id BIGINT NOT NULL,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (pull_request_id, event_id, assignee_id)
)
"#;

pub const CREATE_PULL_REQUESTS_REQUESTED_REVIEWERS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_pull_requests_requested_reviewers (
    pull_request_id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    requested_reviewer_id BIGINT NOT NULL,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (pull_request_id, event_id, requested_reviewer_id)
)
"#;

pub const CREATE_BRANCHES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_branches (
    sha VARCHAR(40) NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    user_id BIGINT,
    repo_id BIGINT,
    label VARCHAR(200) NOT NULL DEFAULT '',
    ref VARCHAR(200) NOT NULL DEFAULT '',
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (sha, event_id)
)
"#;

pub const CREATE_FORKEES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_forkees (
    id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    name VARCHAR(80) NOT NULL,
    full_name VARCHAR(200) NOT NULL,
    owner_id BIGINT NOT NULL,
    description TEXT,
    fork BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    pushed_at TIMESTAMPTZ,
    homepage TEXT,
    size BIGINT NOT NULL DEFAULT 0,
    language VARCHAR(60),
    stargazers_count INTEGER NOT NULL DEFAULT 0,
    forks INTEGER NOT NULL DEFAULT 0,
    default_branch VARCHAR(200) NOT NULL DEFAULT 'master',
    open_issues INTEGER NOT NULL DEFAULT 0,
    watchers INTEGER NOT NULL DEFAULT 0,
    public BOOLEAN,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    dup_owner_login VARCHAR(120) NOT NULL,
    PRIMARY KEY (id, event_id)
)
"#;

pub const CREATE_RELEASES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_releases (
    id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    tag_name VARCHAR(200) NOT NULL,
    target_commitish VARCHAR(200) NOT NULL,
    name VARCHAR(200),
    draft BOOLEAN NOT NULL DEFAULT FALSE,
    prerelease BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL,
    published_at TIMESTAMPTZ,
    body TEXT,
    author_id BIGINT NOT NULL,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    dup_author_login VARCHAR(120) NOT NULL,
    PRIMARY KEY (id, event_id)
)
"#;

pub const CREATE_ASSETS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_assets (
    id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    name VARCHAR(200) NOT NULL,
    label VARCHAR(120),
    content_type VARCHAR(80) NOT NULL,
    size BIGINT NOT NULL,
    download_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (id, event_id)
)
"#;

pub const CREATE_RELEASES_ASSETS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_releases_assets (
    release_id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    asset_id BIGINT NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (release_id, event_id, asset_id)
)
"#;

pub const CREATE_REVIEWS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_reviews (
    id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    pull_request_id BIGINT NOT NULL,
    user_id BIGINT NOT NULL,
    body TEXT,
    state VARCHAR(20) NOT NULL,
    commit_id VARCHAR(40),
    submitted_at TIMESTAMPTZ,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    dup_user_login VARCHAR(120) NOT NULL,
    PRIMARY KEY (id, event_id)
)
"#;

pub const CREATE_TEAMS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_teams (
    id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    name VARCHAR(120) NOT NULL,
    slug VARCHAR(120) NOT NULL,
    permission VARCHAR(20) NOT NULL,
    dup_actor_id BIGINT NOT NULL,
    dup_actor_login VARCHAR(120) NOT NULL,
    dup_repo_id BIGINT NOT NULL,
    dup_repo_name VARCHAR(160) NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (id, event_id)
)
"#;

pub const CREATE_TEAMS_REPOSITORIES: &str = r#"
CREATE TABLE IF NOT EXISTS gha_teams_repositories (
    team_id BIGINT NOT NULL,
    event_id VARCHAR(40) NOT NULL,
    repository_id BIGINT NOT NULL,
    dup_type VARCHAR(40) NOT NULL,
    dup_created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (team_id, event_id, repository_id)
)
"#;

pub const CREATE_PARSED: &str = r#"
CREATE TABLE IF NOT EXISTS gha_parsed (
    dt TIMESTAMPTZ PRIMARY KEY
)
"#;

pub const CREATE_IMPORTED_SHAS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_imported_shas (
    sha VARCHAR(64) PRIMARY KEY,
    dt TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

pub const CREATE_COMPUTED: &str = r#"
CREATE TABLE IF NOT EXISTS gha_computed (
    metric VARCHAR(100) NOT NULL,
    dt TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

pub const CREATE_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_logs (
    id BIGSERIAL PRIMARY KEY,
    dt TIMESTAMPTZ NOT NULL DEFAULT now(),
    run_dt TIMESTAMPTZ,
    prog VARCHAR(30) NOT NULL DEFAULT '',
    proj VARCHAR(30) NOT NULL DEFAULT '',
    msg TEXT NOT NULL DEFAULT ''
)
"#;

pub const CREATE_VARS: &str = r#"
CREATE TABLE IF NOT EXISTS gha_vars (
    name VARCHAR(60) PRIMARY KEY,
    value_s TEXT,
    value_dt TIMESTAMPTZ,
    value_i BIGINT
)
"#;

pub const CREATE_QUICK_RANGES: &str = r#"
CREATE TABLE IF NOT EXISTS tquick_ranges (
    suffix VARCHAR(20) PRIMARY KEY,
    name VARCHAR(120) NOT NULL,
    data VARCHAR(120) NOT NULL
)
"#;

pub const CREATE_ANNOTATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS annotations (
    time TIMESTAMPTZ PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT ''
)
"#;

pub const CREATE_ANNOTATIONS_SHARED: &str = r#"
CREATE TABLE IF NOT EXISTS annotations_shared (
    time TIMESTAMPTZ NOT NULL,
    repo VARCHAR(160) NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (time, repo)
)
"#;

/// Secondary indexes on hot lookup paths.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS gha_events_created_at_idx ON gha_events(created_at);
CREATE INDEX IF NOT EXISTS gha_events_type_idx ON gha_events(type);
CREATE INDEX IF NOT EXISTS gha_events_actor_id_idx ON gha_events(actor_id);
CREATE INDEX IF NOT EXISTS gha_events_repo_id_idx ON gha_events(repo_id);
CREATE INDEX IF NOT EXISTS gha_actors_login_idx ON gha_actors(login);
CREATE INDEX IF NOT EXISTS gha_actors_lower_login_idx ON gha_actors(lower(login));
CREATE INDEX IF NOT EXISTS gha_actors_emails_email_idx ON gha_actors_emails(email);
CREATE INDEX IF NOT EXISTS gha_actors_names_name_idx ON gha_actors_names(name);
CREATE INDEX IF NOT EXISTS gha_commits_dup_created_at_idx ON gha_commits(dup_created_at);
CREATE INDEX IF NOT EXISTS gha_commits_sha_idx ON gha_commits(sha);
CREATE INDEX IF NOT EXISTS gha_commits_roles_sha_idx ON gha_commits_roles(sha);
CREATE INDEX IF NOT EXISTS gha_issues_dup_created_at_idx ON gha_issues(dup_created_at);
CREATE INDEX IF NOT EXISTS gha_issues_number_idx ON gha_issues(number);
CREATE INDEX IF NOT EXISTS gha_pull_requests_dup_created_at_idx ON gha_pull_requests(dup_created_at);
CREATE INDEX IF NOT EXISTS gha_pull_requests_number_idx ON gha_pull_requests(number);
CREATE INDEX IF NOT EXISTS gha_computed_metric_idx ON gha_computed(metric);
CREATE INDEX IF NOT EXISTS gha_logs_proj_idx ON gha_logs(proj);
CREATE INDEX IF NOT EXISTS gha_logs_dt_idx ON gha_logs(dt)
"#;

/// Returns all schema statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_EVENTS,
        CREATE_ACTORS,
        CREATE_ACTORS_EMAILS,
        CREATE_ACTORS_NAMES,
        CREATE_ACTORS_AFFILIATIONS,
        CREATE_REPOS,
        CREATE_REPOS_LANGS,
        CREATE_ORGS,
        CREATE_PAYLOADS,
        CREATE_COMMITS,
        CREATE_COMMITS_ROLES,
        CREATE_PAGES,
        CREATE_COMMENTS,
        CREATE_ISSUES,
        CREATE_ISSUES_ASSIGNEES,
        CREATE_ISSUES_LABELS,
        CREATE_LABELS,
        CREATE_MILESTONES,
        CREATE_PULL_REQUESTS,
        CREATE_PULL_REQUESTS_ASSIGNEES,
        CREATE_PULL_REQUESTS_REQUESTED_REVIEWERS,
        CREATE_BRANCHES,
        CREATE_FORKEES,
        CREATE_RELEASES,
        CREATE_ASSETS,
        CREATE_RELEASES_ASSETS,
        CREATE_REVIEWS,
        CREATE_TEAMS,
        CREATE_TEAMS_REPOSITORIES,
        CREATE_PARSED,
        CREATE_IMPORTED_SHAS,
        CREATE_COMPUTED,
        CREATE_LOGS,
        CREATE_VARS,
        CREATE_QUICK_RANGES,
        CREATE_ANNOTATIONS,
        CREATE_ANNOTATIONS_SHARED,
    ]
}

/// Applies the whole schema plus indexes. Safe to run on every start.
pub async fn structure(db: &super::Database) -> Result<(), super::DatabaseError> {
    for statement in all_schema_statements() {
        db.exec(statement).await?;
    }
    for statement in CREATE_INDEXES.split(';') {
        let statement = statement.trim();
        if !statement.is_empty() {
            db.exec(statement).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent() {
        for statement in all_schema_statements() {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "non-idempotent DDL: {statement}"
            );
        }
    }

    #[test]
    fn test_events_first() {
        let statements = all_schema_statements();
        assert!(statements[0].contains("gha_events"));
        assert_eq!(statements.len(), 37);
    }

    #[test]
    fn test_index_list_splits() {
        let count = CREATE_INDEXES
            .split(';')
            .filter(|s| !s.trim().is_empty())
            .count();
        assert_eq!(count, 18);
    }
}
