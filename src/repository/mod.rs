//! Repository layer for database persistence.
//!
//! All database access uses Diesel with diesel-async. Supports SQLite and,
//! behind the `postgres` feature, PostgreSQL.

pub mod contexts;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod util;

pub use contexts::{DieselContextRepository, Outcome};
pub use pool::{DbPool, DieselError};
pub use util::{parse_datetime, parse_datetime_opt};
