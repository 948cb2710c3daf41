//! String sanitization and hashing helpers.
//!
//! Archive payloads contain arbitrary user input: oversized titles, embedded
//! NUL bytes, multi-byte emoji at column boundaries. Everything written to a
//! `text`/`varchar` column goes through [`clean_text`] first.

use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest, Sha256};

/// Truncates a string to at most `max` bytes without splitting a UTF-8
/// code point.
///
/// The result is always a valid prefix of the input. A `max` that lands in
/// the middle of a multi-byte character backs off to the previous boundary.
pub fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Strips embedded NUL bytes and truncates to `max` bytes.
///
/// PostgreSQL rejects NUL in `text` values, and the warehouse declares
/// byte-length maxima on denormalized columns.
pub fn clean_text(s: &str, max: usize) -> String {
    if s.contains('\0') {
        let cleaned: String = s.chars().filter(|c| *c != '\0').collect();
        truncate_bytes(&cleaned, max).to_string()
    } else {
        truncate_bytes(s, max).to_string()
    }
}

/// Hex-encoded SHA-1 of the input.
///
/// Only used for GDPR hide-map keys, which are defined as `sha1(login)`
/// by the hide configuration format.
pub fn sha1_hex(s: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 of the input.
pub fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derives a stable synthetic ID from a key (a login, repo name or label
/// name the archive supplied no ID for).
///
/// Pre-2015 archives omit most IDs; the warehouse stores a negative ID
/// hashed from the lowercased key so synthetic rows never collide with
/// real GitHub IDs (which are positive).
pub fn synthetic_id(key: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(key.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let n = i64::from_be_bytes(bytes);
    // Fold into the strictly negative range; i64::MIN has no absolute value.
    match n {
        i64::MIN => i64::MIN + 1,
        v if v > 0 => -v,
        0 => -1,
        v => v,
    }
}

/// Derives a synthetic event ID for pre-2015 records that carry none.
///
/// Hashed from `(type, actor login, repo name, created_at)` so re-ingesting
/// the same hour regenerates the same ID and conflicts resolve to no-ops.
pub fn synthetic_event_id(
    event_type: &str,
    actor_login: &str,
    repo_name: &str,
    created_at: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(actor_login.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(repo_name.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(created_at.as_bytes());
    format!("h:{}", hex::encode(&hasher.finalize()[..12]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_bytes("hello", 10), "hello");
        assert_eq!(truncate_bytes("hello", 5), "hello");
        assert_eq!(truncate_bytes("hello", 3), "hel");
        assert_eq!(truncate_bytes("hello", 0), "");
    }

    #[test]
    fn test_truncate_never_splits_code_point() {
        // "héllo" - 'é' is two bytes starting at index 1
        let s = "h\u{e9}llo";
        assert_eq!(truncate_bytes(s, 2), "h");
        assert_eq!(truncate_bytes(s, 3), "h\u{e9}");

        // 4-byte emoji
        let s = "a\u{1f600}b";
        assert_eq!(truncate_bytes(s, 4), "a");
        assert_eq!(truncate_bytes(s, 5), "a\u{1f600}");
        for max in 0..=s.len() {
            let t = truncate_bytes(s, max);
            assert!(t.len() <= max);
            assert!(s.starts_with(t));
        }
    }

    #[test]
    fn test_clean_text_strips_nul() {
        assert_eq!(clean_text("a\0b\0c", 100), "abc");
        assert_eq!(clean_text("plain", 100), "plain");
        assert_eq!(clean_text("a\0bcdef", 3), "abc");
    }

    #[test]
    fn test_sha1_hex_known_value() {
        // sha1("alice")
        assert_eq!(sha1_hex("alice"), "522b276a356bdf39013dfabea2cd43e141ecc9e8");
    }

    #[test]
    fn test_synthetic_id_is_negative_and_stable() {
        let a = synthetic_id("alice");
        let b = synthetic_id("Alice");
        assert!(a < 0);
        // Login lookup is case-insensitive, so the hash is too.
        assert_eq!(a, b);
        assert_ne!(a, synthetic_id("bob"));
    }

    #[test]
    fn test_synthetic_event_id_stable() {
        let a = synthetic_event_id("PushEvent", "alice", "k8s/k8s", "2014-01-01T10:00:00Z");
        let b = synthetic_event_id("PushEvent", "alice", "k8s/k8s", "2014-01-01T10:00:00Z");
        assert_eq!(a, b);
        assert!(a.starts_with("h:"));
        assert_ne!(
            a,
            synthetic_event_id("PushEvent", "alice", "k8s/k8s", "2014-01-01T11:00:00Z")
        );
    }
}
