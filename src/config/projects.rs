//! Projects catalog loaded from YAML.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;

use super::ConfigError;

/// One tracked project.
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    /// Main repository, `org/name` form.
    pub main_repo: String,
    /// First archive date to ingest.
    pub start_date: NaiveDate,
    /// Foundation join date, drives annotations and `c_*` quick ranges.
    #[serde(default)]
    pub join_date: Option<NaiveDate>,
    /// Incubation milestone.
    #[serde(default)]
    pub incubating_date: Option<NaiveDate>,
    /// Graduation milestone.
    #[serde(default)]
    pub graduated_date: Option<NaiveDate>,
    /// Archive milestone; an archived project stops syncing.
    #[serde(default)]
    pub archived_date: Option<NaiveDate>,
    /// Org allow-list for ingestion; defaults to the main repo's owner.
    #[serde(default)]
    pub orgs: Vec<String>,
    /// Repo allow-list for ingestion; empty means every repo in the orgs.
    #[serde(default)]
    pub repos: Vec<String>,
    /// Per-project environment overrides.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Relative dashboard weight, unused by the pipeline itself.
    #[serde(default = "default_scale")]
    pub project_scale: f64,
    /// Disabled projects are skipped by the orchestrator.
    #[serde(default)]
    pub disabled: bool,
}

fn default_scale() -> f64 {
    1.0
}

impl Project {
    /// Org filter spec for the ingestor: configured orgs, or the main
    /// repo's owner.
    pub fn org_filter_spec(&self) -> String {
        if !self.orgs.is_empty() {
            return self.orgs.join(",");
        }
        self.main_repo
            .split('/')
            .next()
            .unwrap_or(&self.main_repo)
            .to_string()
    }

    /// Repo filter spec for the ingestor; empty means unrestricted.
    pub fn repo_filter_spec(&self) -> String {
        self.repos.join(",")
    }

    /// Milestone annotations as `(date, title)` pairs, ordered by date.
    pub fn milestones(&self) -> Vec<(NaiveDate, &'static str)> {
        let mut out = Vec::new();
        if let Some(d) = self.join_date {
            out.push((d, "Joined foundation"));
        }
        if let Some(d) = self.incubating_date {
            out.push((d, "Moved to incubation"));
        }
        if let Some(d) = self.graduated_date {
            out.push((d, "Graduated"));
        }
        if let Some(d) = self.archived_date {
            out.push((d, "Archived"));
        }
        out.sort_by_key(|(d, _)| *d);
        out
    }
}

/// The full projects catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectsConfig {
    /// Projects keyed by short name.
    pub projects: BTreeMap<String, Project>,
}

impl ProjectsConfig {
    /// Loads the catalog from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Returns an enabled project by name.
    pub fn get(&self, name: &str) -> Result<&Project, ConfigError> {
        match self.projects.get(name) {
            Some(p) if !p.disabled => Ok(p),
            _ => Err(ConfigError::UnknownProject(name.to_string())),
        }
    }

    /// Names of all enabled projects, in catalog order.
    pub fn enabled(&self) -> Vec<&str> {
        self.projects
            .iter()
            .filter(|(_, p)| !p.disabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
projects:
  kubernetes:
    main_repo: kubernetes/kubernetes
    start_date: 2014-06-01
    join_date: 2016-03-10
    graduated_date: 2018-03-06
    env:
      GHA2DB_NCPUS: "8"
  legacy:
    main_repo: old/old
    start_date: 2012-07-01
    disabled: true
"#;

    fn write_sample() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_and_get() {
        let f = write_sample();
        let config = ProjectsConfig::load(f.path()).unwrap();
        let k8s = config.get("kubernetes").unwrap();
        assert_eq!(k8s.main_repo, "kubernetes/kubernetes");
        assert_eq!(k8s.start_date, NaiveDate::from_ymd_opt(2014, 6, 1).unwrap());
        assert_eq!(k8s.env.get("GHA2DB_NCPUS").unwrap(), "8");
        assert_eq!(k8s.project_scale, 1.0);
    }

    #[test]
    fn test_disabled_project_is_unknown() {
        let f = write_sample();
        let config = ProjectsConfig::load(f.path()).unwrap();
        assert!(config.get("legacy").is_err());
        assert!(config.get("nope").is_err());
        assert_eq!(config.enabled(), vec!["kubernetes"]);
    }

    #[test]
    fn test_milestones_ordered() {
        let f = write_sample();
        let config = ProjectsConfig::load(f.path()).unwrap();
        let milestones = config.get("kubernetes").unwrap().milestones();
        assert_eq!(milestones.len(), 2);
        assert_eq!(milestones[0].1, "Joined foundation");
        assert_eq!(milestones[1].1, "Graduated");
    }
}
