//! Annotation and quick-range generation.
//!
//! Annotations mark project milestones on every dashboard chart. Quick
//! ranges are the named windows the dashboards offer: fixed trailing
//! windows (`d`, `w`, `m`, …), one absolute range per adjacent annotation
//! pair (`a_0_1`, `a_1_2`, …, `a_<N-1>_n`), and foundation-date splits
//! (`c_b`, `c_j`, …) when the project has a join date.
//!
//! Everything here is pure: "now" is injected so regeneration is
//! deterministic under test.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::config::Project;

/// One annotation: `(time, title, description)`.
pub type Annotation = (DateTime<Utc>, String, String);

/// One quick range: `(suffix, name, data)`.
///
/// `data` is either a relative interval (`1 day`) or an absolute
/// `from;to` pair in `%Y-%m-%d %H:%M:%S`.
pub type QuickRange = (String, String, String);

fn at_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight"))
}

fn range_data(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    format!(
        "{};{}",
        from.format("%Y-%m-%d %H:%M:%S"),
        to.format("%Y-%m-%d %H:%M:%S")
    )
}

/// Builds the project's annotation list: milestones plus caller-supplied
/// extra rows (release tags, for example), ordered by time.
pub fn build_annotations(project: &Project, extra: &[Annotation]) -> Vec<Annotation> {
    let mut out: Vec<Annotation> = project
        .milestones()
        .into_iter()
        .map(|(date, title)| {
            (
                at_midnight(date),
                title.to_string(),
                format!("{} - {}", project.main_repo, title),
            )
        })
        .collect();
    out.extend(extra.iter().cloned());
    out.sort_by_key(|(time, _, _)| *time);
    out.dedup_by_key(|(time, _, _)| *time);
    out
}

/// Fixed trailing windows every project gets.
fn fixed_ranges() -> Vec<QuickRange> {
    [
        ("d", "Last day", "1 day"),
        ("w", "Last week", "1 week"),
        ("d10", "Last 10 days", "10 days"),
        ("m", "Last month", "1 month"),
        ("q", "Last quarter", "3 months"),
        ("y", "Last year", "1 year"),
        ("y2", "Last 2 years", "2 years"),
        ("y3", "Last 3 years", "3 years"),
        ("y5", "Last 5 years", "5 years"),
        ("y10", "Last decade", "10 years"),
    ]
    .iter()
    .map(|(suffix, name, data)| (suffix.to_string(), name.to_string(), data.to_string()))
    .collect()
}

/// Builds the full quick-range catalog.
///
/// Every adjacent annotation pair `(i, i+1)` yields exactly one range
/// `a_<i>_<i+1>`; the final annotation yields the open-ended `a_<N-1>_n`
/// closed at `now`.
pub fn build_quick_ranges(
    project: &Project,
    annotations: &[Annotation],
    now: DateTime<Utc>,
) -> Vec<QuickRange> {
    let mut out = fixed_ranges();

    for (i, window) in annotations.windows(2).enumerate() {
        let (from, from_title, _) = &window[0];
        let (to, to_title, _) = &window[1];
        out.push((
            format!("a_{}_{}", i, i + 1),
            format!("{from_title} - {to_title}"),
            range_data(*from, *to),
        ));
    }
    if let Some((last, title, _)) = annotations.last() {
        out.push((
            format!("a_{}_n", annotations.len() - 1),
            format!("{title} - now"),
            range_data(*last, now),
        ));
    }

    let start = at_midnight(project.start_date);
    if let Some(join) = project.join_date {
        let join = at_midnight(join);
        out.push((
            "c_b".to_string(),
            "Before joining foundation".to_string(),
            range_data(start, join),
        ));
        out.push((
            "c_j".to_string(),
            "Since joining foundation".to_string(),
            range_data(join, now),
        ));
        if let (Some(incubating), Some(graduated)) =
            (project.incubating_date, project.graduated_date)
        {
            out.push((
                "c_i_g".to_string(),
                "Incubation period".to_string(),
                range_data(at_midnight(incubating), at_midnight(graduated)),
            ));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn project() -> Project {
        Project {
            main_repo: "kubernetes/kubernetes".to_string(),
            start_date: NaiveDate::from_ymd_opt(2014, 6, 1).unwrap(),
            join_date: Some(NaiveDate::from_ymd_opt(2016, 3, 10).unwrap()),
            incubating_date: None,
            graduated_date: Some(NaiveDate::from_ymd_opt(2018, 3, 6).unwrap()),
            archived_date: None,
            orgs: Vec::new(),
            repos: Vec::new(),
            env: BTreeMap::new(),
            project_scale: 1.0,
            disabled: false,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_annotations_from_milestones() {
        let annotations = build_annotations(&project(), &[]);
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].1, "Joined foundation");
        assert_eq!(annotations[1].1, "Graduated");
        assert!(annotations[0].0 < annotations[1].0);
    }

    #[test]
    fn test_extra_annotations_merged_in_order() {
        let extra = vec![(
            Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap(),
            "v1.0".to_string(),
            "first stable release".to_string(),
        )];
        let annotations = build_annotations(&project(), &extra);
        assert_eq!(annotations.len(), 3);
        assert_eq!(annotations[1].1, "v1.0");
    }

    #[test]
    fn test_adjacent_pairs_covered() {
        let annotations = build_annotations(&project(), &[]);
        let ranges = build_quick_ranges(&project(), &annotations, now());
        let suffixes: Vec<&str> = ranges.iter().map(|(s, _, _)| s.as_str()).collect();
        // Exactly one a_i_j per adjacent pair, then the open-ended one.
        assert!(suffixes.contains(&"a_0_1"));
        assert!(suffixes.contains(&"a_1_n"));
        assert!(!suffixes.contains(&"a_0_2"));
        assert_eq!(suffixes.iter().filter(|s| s.starts_with("a_")).count(), 2);
    }

    #[test]
    fn test_fixed_and_foundation_ranges() {
        let annotations = build_annotations(&project(), &[]);
        let ranges = build_quick_ranges(&project(), &annotations, now());
        let get = |suffix: &str| ranges.iter().find(|(s, _, _)| s == suffix);
        assert_eq!(get("d").unwrap().2, "1 day");
        assert_eq!(get("y10").unwrap().2, "10 years");
        let c_b = get("c_b").unwrap();
        assert_eq!(c_b.2, "2014-06-01 00:00:00;2016-03-10 00:00:00");
        let c_j = get("c_j").unwrap();
        assert!(c_j.2.starts_with("2016-03-10 00:00:00;2020-03-01"));
        // No incubating date, so no incubation split.
        assert!(get("c_i_g").is_none());
    }

    #[test]
    fn test_no_annotations_no_a_ranges() {
        let mut p = project();
        p.join_date = None;
        p.graduated_date = None;
        let annotations = build_annotations(&p, &[]);
        assert!(annotations.is_empty());
        let ranges = build_quick_ranges(&p, &annotations, now());
        assert!(ranges.iter().all(|(s, _, _)| !s.starts_with("a_")));
        assert!(ranges.iter().all(|(s, _, _)| !s.starts_with("c_")));
    }
}
