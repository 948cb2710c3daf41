//! Integration tests over the pure pipeline logic: event parsing and
//! filtering, affiliation interval mapping, template expansion, period
//! schedules and quick-range generation. Database-backed paths are
//! exercised separately against a live warehouse.

use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeZone, Utc};

use devstats::affs::{parse_affiliations, AcquisitionRules};
use devstats::config::{overlay_env, Project};
use devstats::ingest::roles::parse_commit_roles;
use devstats::ingest::{Filter, Filters};
use devstats::metrics::{compute_period_at, expand, ComputeFlags, Metric, TemplateContext};
use devstats::sync::annotations::{build_annotations, build_quick_ranges};

fn sample_project() -> Project {
    serde_yaml::from_str(
        r#"
main_repo: kubernetes/kubernetes
start_date: 2014-06-01
join_date: 2016-03-10
incubating_date: 2016-11-01
graduated_date: 2018-03-06
"#,
    )
    .unwrap()
}

#[test]
fn affiliation_feed_maps_through_acquisitions() {
    // Feed: bob worked at Acme until 2019, then Globex; the acquisition
    // ruleset folds Acme spellings into "Acme Corp".
    let rules = AcquisitionRules::compile(vec![(
        "^Acme.*$".to_string(),
        "Acme Corp".to_string(),
    )])
    .unwrap();

    let intervals = parse_affiliations("Acme < 2019-01-01, Globex");
    assert_eq!(intervals.len(), 2);

    let mapped: Vec<(String, String)> = intervals
        .iter()
        .map(|i| (rules.map_company(&i.company), i.company.clone()))
        .collect();
    assert_eq!(
        mapped,
        vec![
            ("Acme Corp".to_string(), "Acme".to_string()),
            ("Globex".to_string(), "Globex".to_string())
        ]
    );
    assert_eq!(
        intervals[0].from,
        NaiveDate::from_ymd_opt(1900, 1, 1).unwrap()
    );
    assert_eq!(
        intervals[0].to,
        NaiveDate::from_ymd_opt(2019, 1, 1).unwrap()
    );
    assert_eq!(
        intervals[1].to,
        NaiveDate::from_ymd_opt(2100, 1, 1).unwrap()
    );
}

#[test]
fn template_window_expansion_matches_contract() {
    let (sql, hours) = expand(
        "count where {{period:e.created_at}}",
        &TemplateContext::interval("7 days"),
    );
    assert_eq!(
        sql,
        "count where  (e.created_at >= now() - '7 days'::interval) "
    );
    assert_eq!(hours, "168.000000");
}

#[test]
fn daily_and_weekly_metrics_recompute_sunday_23() {
    // Sunday 2020-03-08 23:00 UTC is both a daily-ineligible hour (23 is
    // not a fixed daily hour) and the weekly recompute slot.
    let now = Utc.with_ymd_and_hms(2020, 3, 8, 23, 0, 0).unwrap();
    let flags = ComputeFlags::default();
    let mut rng = rand::thread_rng();
    assert!(compute_period_at("w", now, false, &flags, &mut rng));
    assert!(compute_period_at("h", now, false, &flags, &mut rng));

    let daily_slot = Utc.with_ymd_and_hms(2020, 3, 8, 13, 0, 0).unwrap();
    assert!(compute_period_at("d", daily_slot, false, &flags, &mut rng));
}

#[test]
fn metric_spec_periods_and_projects() {
    let metric: Metric = serde_yaml::from_str(
        r#"
name: PRs merged
periods: d,w
series_name_or_func: prs_merged
sql: select 'x', 1
project: "kubernetes,!prometheus"
"#,
    )
    .unwrap();
    assert_eq!(metric.period_combinations().len(), 2);
    assert!(metric.runs_for_project("kubernetes"));
    assert!(!metric.runs_for_project("prometheus"));
}

#[test]
fn quick_ranges_cover_adjacent_annotation_pairs() {
    let project = sample_project();
    let now = Utc.with_ymd_and_hms(2020, 3, 1, 12, 0, 0).unwrap();
    let annotations = build_annotations(&project, &[]);
    // join, incubating, graduated
    assert_eq!(annotations.len(), 3);

    let ranges = build_quick_ranges(&project, &annotations, now);
    let suffixes: Vec<&str> = ranges.iter().map(|(s, _, _)| s.as_str()).collect();
    assert!(suffixes.contains(&"a_0_1"));
    assert!(suffixes.contains(&"a_1_2"));
    assert!(suffixes.contains(&"a_2_n"));
    assert!(suffixes.contains(&"c_b"));
    assert!(suffixes.contains(&"c_j"));
    assert!(suffixes.contains(&"c_i_g"));

    // Every adjacent pair exactly once.
    let pair_count = suffixes
        .iter()
        .filter(|s| s.starts_with("a_") && !s.ends_with("_n"))
        .count();
    assert_eq!(pair_count, annotations.len() - 1);
}

#[test]
fn commit_trailers_feed_role_rows() {
    let message = "Improve scheduler throughput\n\n\
                   Signed-off-by: Jane Doe <jane@example.com>\n\
                   Reviewed-by: Rob Reviewer <rob@example.com>\n\
                   Reported-and-tested-by: Tess Tester <tess@example.com>\n\
                   Change-Id: I0123456789abcdef\n";
    let roles = parse_commit_roles(message);
    let kinds: Vec<&str> = roles.iter().map(|r| r.role).collect();
    assert_eq!(kinds, vec!["signed_off", "reviewed", "reported", "tested"]);
    assert!(roles.iter().all(|r| r.email.ends_with("@example.com")));
}

#[test]
fn org_and_repo_filters_compose() {
    let filters = Filters {
        org: Filter::parse("kubernetes").unwrap(),
        repo: Filter::parse("regexp:^kubernetes/(kubernetes|minikube)$").unwrap(),
        actor: Filter::Any,
    };
    let raw = r#"{
        "id": "1", "type": "PushEvent",
        "actor": {"id": 1, "login": "alice"},
        "repo": {"id": 2, "name": "kubernetes/minikube"},
        "created_at": "2020-01-01T00:00:00Z"
    }"#;
    let event: devstats::ghevent::Event = serde_json::from_str(raw).unwrap();
    assert!(filters.matches(&event));

    let other = r#"{
        "id": "2", "type": "PushEvent",
        "actor": {"id": 1, "login": "alice"},
        "repo": {"id": 3, "name": "kubernetes/kops"},
        "created_at": "2020-01-01T00:00:00Z"
    }"#;
    let event: devstats::ghevent::Event = serde_json::from_str(other).unwrap();
    assert!(!filters.matches(&event));
}

#[test]
fn env_overlay_layers_compose_in_precedence_order() {
    // shell < project env < metric env, with soft-set honored.
    let mut env: devstats::config::EnvMap =
        [("GHA2DB_NCPUS".to_string(), "4".to_string())].into();

    let project_env: BTreeMap<String, String> = [
        ("GHA2DB_NCPUS".to_string(), "8".to_string()),
        ("GHA2DB_RECENT_RANGE?".to_string(), "24".to_string()),
    ]
    .into();
    overlay_env(&mut env, &project_env, None);

    let metric_env: BTreeMap<String, String> = [
        ("GHA2DB_RECENT_RANGE?".to_string(), "48".to_string()),
        ("GHA2DB_COMPUTE_ALL@w".to_string(), "1".to_string()),
    ]
    .into();
    overlay_env(&mut env, &metric_env, Some("d"));

    assert_eq!(env.get("GHA2DB_NCPUS").unwrap(), "8");
    // Soft-set sticks with the first layer that set it.
    assert_eq!(env.get("GHA2DB_RECENT_RANGE").unwrap(), "24");
    // Period-scoped key does not apply for period d.
    assert!(!env.contains_key("GHA2DB_COMPUTE_ALL"));

    let ctx = devstats::Ctx::from_env_map(&env).unwrap();
    assert_eq!(ctx.n_cpus, 8);
    assert_eq!(ctx.recent_range_hours, 24);
}

#[test]
fn old_event_normalization_is_stable_and_synthetic() {
    let raw = r#"{
        "type": "PushEvent",
        "created_at": "2014-01-01T10:00:00Z",
        "actor": "bob",
        "repository": {"id": 99, "name": "legacy", "owner": "someorg"},
        "payload": {"size": 2, "ref": "refs/heads/main"}
    }"#;
    let old: devstats::ghevent::EventOld = serde_json::from_str(raw).unwrap();
    let a = old.normalize();
    let b = old.normalize();
    assert_eq!(a.id, b.id);
    assert!(a.id.starts_with("h:"));
    assert!(a.actor.id < 0, "synthetic actor IDs are negative");
    assert_eq!(a.repo.name, "someorg/legacy");
}
