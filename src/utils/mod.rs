//! Shared utility functions for devstats.
//!
//! This module provides common utilities used across multiple modules:
//! string sanitization for database writes and hashing helpers for
//! synthetic identifiers and content fingerprints.

pub mod strings;

pub use strings::{
    clean_text, sha1_hex, sha256_hex, synthetic_id, synthetic_event_id, truncate_bytes,
};
