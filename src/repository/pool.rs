//! Unified database connection pool supporting SQLite and PostgreSQL.
//!
//! The backend is determined at runtime from the database URL.

use std::path::Path;

use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, SimpleAsyncConnection};

#[cfg(feature = "postgres")]
use diesel_async::pooled_connection::deadpool::{Object, Pool as DeadPool};
#[cfg(feature = "postgres")]
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
#[cfg(feature = "postgres")]
use diesel_async::AsyncPgConnection;

use super::util::to_diesel_error;

/// Diesel error type alias.
pub type DieselError = diesel::result::Error;

/// Async SQLite connection type.
pub type SqliteConn = SyncConnectionWrapper<SqliteConnection>;

/// Async PostgreSQL connection type.
#[cfg(feature = "postgres")]
pub type PgConn = Object<AsyncPgConnection>;

/// Milliseconds a SQLite connection waits on a locked database before failing.
const SQLITE_BUSY_TIMEOUT_MS: u32 = 5000;

/// SQLite connection pool (lightweight - creates connections on demand).
#[derive(Clone)]
pub struct SqlitePool {
    database_url: String,
}

impl SqlitePool {
    /// Create a new SQLite pool.
    pub fn new(database_url: &str) -> Self {
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        let url = url.strip_prefix("//").unwrap_or(url);
        Self {
            database_url: url.to_string(),
        }
    }

    /// Create pool from a file path.
    pub fn from_path(path: &Path) -> Self {
        Self::new(&path.display().to_string())
    }

    /// Get a connection.
    ///
    /// Several workers may share one database file, so every connection waits
    /// on a busy database instead of failing immediately.
    pub async fn get(&self) -> Result<SqliteConn, DieselError> {
        let mut conn = SqliteConn::establish(&self.database_url)
            .await
            .map_err(to_diesel_error)?;
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            SQLITE_BUSY_TIMEOUT_MS
        ))
        .await?;
        Ok(conn)
    }

    /// Get the database URL.
    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

/// PostgreSQL connection pool.
#[cfg(feature = "postgres")]
#[derive(Clone)]
pub struct PgPool {
    pool: DeadPool<AsyncPgConnection>,
}

#[cfg(feature = "postgres")]
impl PgPool {
    /// Create a new PostgreSQL pool.
    pub fn new(database_url: &str, max_size: usize) -> Result<Self, DieselError> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = DeadPool::builder(config)
            .max_size(max_size)
            .build()
            .map_err(to_diesel_error)?;
        Ok(Self { pool })
    }

    /// Get a connection.
    pub async fn get(&self) -> Result<PgConn, DieselError> {
        self.pool.get().await.map_err(to_diesel_error)
    }
}

/// Unified database pool that supports both SQLite and PostgreSQL.
#[derive(Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

impl DbPool {
    /// Create a pool from a database URL.
    ///
    /// - `postgres://` or `postgresql://` → PostgreSQL
    /// - Everything else → SQLite
    pub fn from_url(url: &str) -> Result<Self, DieselError> {
        if super::util::is_postgres_url(url) {
            #[cfg(feature = "postgres")]
            return Ok(DbPool::Postgres(PgPool::new(url, 10)?));
            #[cfg(not(feature = "postgres"))]
            return Err(to_diesel_error(
                "PostgreSQL support not compiled. Use --features postgres",
            ));
        }

        Ok(DbPool::Sqlite(SqlitePool::new(url)))
    }

    /// Create a SQLite pool from a file path.
    pub fn sqlite_from_path(path: &Path) -> Self {
        DbPool::Sqlite(SqlitePool::from_path(path))
    }

    /// Check if this is a SQLite backend.
    pub fn is_sqlite(&self) -> bool {
        matches!(self, DbPool::Sqlite(_))
    }

    /// Check if this is a PostgreSQL backend.
    #[cfg(feature = "postgres")]
    pub fn is_postgres(&self) -> bool {
        matches!(self, DbPool::Postgres(_))
    }
}

/// Macro for running database operations on either backend.
///
/// The body is expanded once per backend so the same Diesel DSL code
/// type-checks against both connection types.
///
/// # Example
/// ```ignore
/// with_conn!(self.pool, conn => {
///     contexts::table.load::<ContextRecord>(&mut conn).await
/// })
/// ```
#[macro_export]
macro_rules! with_conn {
    ($pool:expr, $conn:ident => $body:expr) => {{
        match &$pool {
            $crate::repository::pool::DbPool::Sqlite(pool) => {
                let mut $conn = pool.get().await?;
                $body
            }
            #[cfg(feature = "postgres")]
            $crate::repository::pool::DbPool::Postgres(pool) => {
                let mut $conn = pool.get().await?;
                $body
            }
        }
    }};
}
