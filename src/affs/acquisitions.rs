//! Company acquisition ruleset.
//!
//! An ordered YAML list of `[regex, canonical_name]` pairs folds the many
//! spellings and acquired subsidiaries of a company into one canonical
//! name. Rules are compiled once and matched in declaration order; the
//! first match wins. A company matching no rule maps to itself.
//!
//! Validation happens at load time, not at match time: ambiguous rulesets
//! are operator errors that must abort the run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating the ruleset.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// Two rules share the same regex.
    #[error("Duplicate acquisition regex: '{0}'")]
    DuplicateRegex(String),

    /// Two rules produce the same canonical name.
    #[error("Duplicate acquisition target: '{0}'")]
    DuplicateName(String),

    /// A canonical name matches another rule's regex, which would hide a
    /// transitive merge.
    #[error(
        "Acquisition target '{name}' (rule '{rule}') matches regex '{other}' of another rule"
    )]
    TransitiveMatch {
        name: String,
        rule: String,
        other: String,
    },

    /// A regex failed to compile.
    #[error("Invalid acquisition regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    /// IO error while reading the file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Deserialize)]
struct AcquisitionsFile {
    #[serde(default)]
    acquisitions: Vec<(String, String)>,
}

/// Compiled, validated acquisition matcher with a per-company cache and
/// hit statistics.
pub struct AcquisitionRules {
    rules: Vec<(Regex, String)>,
    cache: Mutex<HashMap<String, String>>,
    hits: Mutex<HashMap<String, u64>>,
}

impl AcquisitionRules {
    /// An empty ruleset: every company maps to itself.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            cache: Mutex::new(HashMap::new()),
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Loads and validates the ruleset from a YAML file.
    pub fn load(path: &Path) -> Result<Self, AcquisitionError> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: AcquisitionsFile = serde_yaml::from_str(&raw)?;
        Self::compile(parsed.acquisitions)
    }

    /// Compiles an ordered list of `(regex, canonical_name)` pairs.
    pub fn compile(pairs: Vec<(String, String)>) -> Result<Self, AcquisitionError> {
        let mut seen_patterns = HashMap::new();
        let mut seen_names = HashMap::new();
        let mut rules = Vec::with_capacity(pairs.len());

        for (pattern, name) in &pairs {
            if seen_patterns.insert(pattern.clone(), name.clone()).is_some() {
                return Err(AcquisitionError::DuplicateRegex(pattern.clone()));
            }
            if seen_names.insert(name.clone(), pattern.clone()).is_some() {
                return Err(AcquisitionError::DuplicateName(name.clone()));
            }
            let regex = Regex::new(pattern).map_err(|e| AcquisitionError::InvalidRegex {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            rules.push((regex, name.clone()));
        }

        // A canonical name caught by a different rule means the operator
        // wrote A->B and something matching B->C without merging A->C.
        for (i, (_, name)) in rules.iter().enumerate() {
            for (j, (other_regex, _)) in rules.iter().enumerate() {
                if i != j && other_regex.is_match(name) {
                    return Err(AcquisitionError::TransitiveMatch {
                        name: name.clone(),
                        rule: rules[i].0.as_str().to_string(),
                        other: other_regex.as_str().to_string(),
                    });
                }
            }
        }

        Ok(Self {
            rules,
            cache: Mutex::new(HashMap::new()),
            hits: Mutex::new(HashMap::new()),
        })
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules are loaded.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Maps a company to its canonical name; identity when nothing matches.
    pub fn map_company(&self, company: &str) -> String {
        if let Some(hit) = self.cache.lock().expect("cache lock").get(company) {
            return hit.clone();
        }
        let mapped = self
            .rules
            .iter()
            .find(|(regex, _)| regex.is_match(company))
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| company.to_string());
        self.cache
            .lock()
            .expect("cache lock")
            .insert(company.to_string(), mapped.clone());
        if mapped != company {
            *self
                .hits
                .lock()
                .expect("stats lock")
                .entry(mapped.clone())
                .or_insert(0) += 1;
        }
        mapped
    }

    /// Canonical names with how many distinct mappings they absorbed.
    pub fn stats(&self) -> HashMap<String, u64> {
        self.hits.lock().expect("stats lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(pairs: &[(&str, &str)]) -> Result<AcquisitionRules, AcquisitionError> {
        AcquisitionRules::compile(
            pairs
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_first_match_wins() {
        let rules = rules(&[
            (r"(?i)^red\s*hat.*$", "Red Hat"),
            (r"(?i)^ibm.*$", "IBM"),
        ])
        .unwrap();
        assert_eq!(rules.map_company("RedHat Inc."), "Red Hat");
        assert_eq!(rules.map_company("red hat"), "Red Hat");
        assert_eq!(rules.map_company("IBM Research"), "IBM");
    }

    #[test]
    fn test_no_match_is_identity() {
        let rules = rules(&[(r"^Acme.*$", "Acme Corp")]).unwrap();
        assert_eq!(rules.map_company("Globex"), "Globex");
        let empty = AcquisitionRules::empty();
        assert_eq!(empty.map_company("Anything"), "Anything");
    }

    #[test]
    fn test_duplicate_regex_rejected() {
        let result = rules(&[(r"^A.*$", "A Corp"), (r"^A.*$", "Other")]);
        assert!(matches!(result, Err(AcquisitionError::DuplicateRegex(_))));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = rules(&[(r"^A.*$", "Corp"), (r"^B.*$", "Corp")]);
        assert!(matches!(result, Err(AcquisitionError::DuplicateName(_))));
    }

    #[test]
    fn test_transitive_match_rejected() {
        // "Acme Corp" itself matches the second rule: a missed merge.
        let result = rules(&[(r"^Acme.*$", "Acme Corp"), (r"^Acme Corp$", "Umbrella")]);
        let err = result.err().expect("should fail validation");
        let message = err.to_string();
        assert!(message.contains("Acme Corp"));
        assert!(message.contains("Umbrella") || message.contains("^Acme"));
    }

    #[test]
    fn test_cache_and_stats() {
        let rules = rules(&[(r"^Acme.*$", "Acme Corp")]).unwrap();
        assert_eq!(rules.map_company("Acme Inc"), "Acme Corp");
        assert_eq!(rules.map_company("Acme Inc"), "Acme Corp");
        // Cached second hit still counts one distinct mapping.
        assert_eq!(rules.stats().get("Acme Corp"), Some(&1));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let result = rules(&[(r"[broken", "X")]);
        assert!(matches!(result, Err(AcquisitionError::InvalidRegex { .. })));
    }
}
