//! PostgreSQL warehouse access.
//!
//! This module provides the database client shared by every pipeline stage:
//! - **Database**: connection pools (read-write plus optional read-only),
//!   retry classification for transient Postgres failures, operational
//!   state (`gha_computed` markers, locks) and the DB-backed log sink
//! - **schema**: the fixed warehouse DDL and idempotent structure pass
//! - **series**: the time-series writer (per-series, merged and tag tables,
//!   quick ranges, annotations)

pub mod database;
pub mod schema;
pub mod series;

pub use database::{Database, DatabaseError, Logger};
pub use series::{SeriesMode, SeriesWriter, TsPoint, TsValue};
