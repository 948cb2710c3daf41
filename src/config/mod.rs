//! Runtime configuration for the pipeline.
//!
//! Configuration comes from three layers, lowest precedence first: the shell
//! environment, the per-project `env` block in projects YAML, and per-metric
//! `env` overlays. Overlay keys honor a small grammar: a trailing `?` sets
//! the variable only when it is unset or empty, `??` only when unset
//! entirely, `@period` restricts the override to one period and `!period`
//! to every period except one.

mod context;
mod hide;
mod projects;

pub use context::{env_snapshot, overlay_env, Ctx, EnvMap};
pub use hide::HideMap;
pub use projects::{Project, ProjectsConfig};

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable or config field has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// A referenced project is not defined or disabled.
    #[error("Unknown or disabled project: {0}")]
    UnknownProject(String),

    /// Hide-map CSV is malformed.
    #[error("Hide config error: {0}")]
    HideConfig(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// CSV parsing error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct SkipDatesFile {
    #[serde(default)]
    skip_dates: Vec<String>,
}

/// Loads the set of archive hours to bypass, in canonical `YYYY-MM-DD-H`
/// form (hour without leading zero, matching archive file names).
pub fn load_skip_hours(path: &Path) -> Result<HashSet<String>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: SkipDatesFile = serde_yaml::from_str(&raw)?;
    Ok(parsed.skip_dates.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_skip_hours() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "skip_dates:\n  - 2016-10-21-14\n  - 2016-10-21-15").unwrap();
        let hours = load_skip_hours(f.path()).unwrap();
        assert_eq!(hours.len(), 2);
        assert!(hours.contains("2016-10-21-14"));
    }

    #[test]
    fn test_load_skip_hours_empty() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "skip_dates: []").unwrap();
        assert!(load_skip_hours(f.path()).unwrap().is_empty());
    }
}
