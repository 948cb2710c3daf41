//! GDPR hide map.
//!
//! Operators supply a CSV of `sha1,anon` pairs: the SHA-1 of a login to
//! erase and the replacement to store in its place. The map is loaded once
//! at startup and treated as immutable; every login written to the warehouse
//! is routed through [`HideMap::maybe_hide`] so downstream joins keep
//! working on the replacement value.

use std::collections::HashMap;
use std::path::Path;

use crate::utils::sha1_hex;

use super::ConfigError;

/// Immutable login-anonymization table.
#[derive(Debug, Clone, Default)]
pub struct HideMap {
    by_sha: HashMap<String, String>,
}

impl HideMap {
    /// An empty map; every login passes through unchanged.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads the map from a CSV file with header `sha1,anon`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        if headers.len() < 2 || &headers[0] != "sha1" || &headers[1] != "anon" {
            return Err(ConfigError::HideConfig(format!(
                "expected header sha1,anon, got {:?}",
                headers
            )));
        }
        let mut by_sha = HashMap::new();
        for record in reader.records() {
            let record = record?;
            if record.len() < 2 {
                return Err(ConfigError::HideConfig(format!(
                    "short row: {:?}",
                    record
                )));
            }
            by_sha.insert(record[0].to_lowercase(), record[1].to_string());
        }
        Ok(Self { by_sha })
    }

    /// Returns the replacement for a hidden login, or the login itself.
    pub fn maybe_hide<'a>(&'a self, login: &'a str) -> &'a str {
        if self.by_sha.is_empty() {
            return login;
        }
        match self.by_sha.get(&sha1_hex(login)) {
            Some(anon) => anon.as_str(),
            None => login,
        }
    }

    /// Number of hidden logins.
    pub fn len(&self) -> usize {
        self.by_sha.len()
    }

    /// True when no logins are hidden.
    pub fn is_empty(&self) -> bool {
        self.by_sha.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_maybe_hide() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        // sha1("alice")
        writeln!(f, "sha1,anon").unwrap();
        writeln!(f, "522b276a356bdf39013dfabea2cd43e141ecc9e8,anon-1").unwrap();
        let map = HideMap::load(f.path()).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.maybe_hide("alice"), "anon-1");
        assert_eq!(map.maybe_hide("bob"), "bob");
    }

    #[test]
    fn test_empty_map_passthrough() {
        let map = HideMap::empty();
        assert_eq!(map.maybe_hide("alice"), "alice");
    }

    #[test]
    fn test_bad_header_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "login,replacement").unwrap();
        writeln!(f, "a,b").unwrap();
        assert!(matches!(
            HideMap::load(f.path()),
            Err(ConfigError::HideConfig(_))
        ));
    }
}
