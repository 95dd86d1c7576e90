//! Schema setup.
//!
//! Statements are idempotent so every worker can run them at startup.

use diesel_async::SimpleAsyncConnection;
use tracing::{debug, info};

use super::pool::{DbPool, DieselError};
use crate::with_conn;

const CREATE_CONTEXTS: &str = "CREATE TABLE IF NOT EXISTS contexts (
    id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    template_id TEXT,
    organization_id TEXT,
    service_type TEXT,
    priority INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt TEXT,
    next_retry_at TEXT,
    batch_id TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    results TEXT,
    errors TEXT NOT NULL DEFAULT '[]',
    worker_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    processing_start TEXT,
    processing_end TEXT
)";

const CREATE_CLAIM_LOCKS: &str = "CREATE TABLE IF NOT EXISTS claim_locks (
    lock_key TEXT PRIMARY KEY NOT NULL,
    owner TEXT NOT NULL,
    expires_at TEXT NOT NULL
)";

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_contexts_poll ON contexts (status, priority DESC, created_at ASC)",
    "CREATE INDEX IF NOT EXISTS idx_contexts_template ON contexts (template_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_contexts_batch ON contexts (batch_id)",
];

/// Create tables and indexes if they do not exist.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DieselError> {
    if pool.is_sqlite() {
        // WAL lets readers poll while another worker holds the write lock.
        with_conn!(pool, conn => conn.batch_execute("PRAGMA journal_mode = WAL;").await)?;
    }

    with_conn!(pool, conn => {
        conn.batch_execute(CREATE_CONTEXTS).await?;
        conn.batch_execute(CREATE_CLAIM_LOCKS).await?;
        for statement in INDEXES {
            debug!("Running: {}", statement);
            conn.batch_execute(statement).await?;
        }
        Ok::<(), DieselError>(())
    })?;

    info!("Database schema is up to date");
    Ok(())
}

/// Run migrations for a database URL.
pub async fn run_migrations_for_url(database_url: &str) -> Result<DbPool, DieselError> {
    let pool = DbPool::from_url(database_url)?;
    run_migrations(&pool).await?;
    Ok(pool)
}
