use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};

pub type DbPool = sqlx::SqlitePool;

/// Sized past the default retry backoff cap (1s): a worker stuck behind
/// another writer waits out the contention instead of feeding a spurious
/// store error into the retry loop.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 4, 10).await
}

pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    acquire_timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    pool_for(max_connections, acquire_timeout_secs)
        .connect_with(connect_options(database_url)?)
        .await
}

/// Shared-cache memory databases vanish when their last connection closes;
/// pinning one connection keeps the store alive between bursts of work.
pub(crate) async fn connect_pinned(
    database_url: &str,
    max_connections: u32,
    acquire_timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    pool_for(max_connections, acquire_timeout_secs)
        .min_connections(1)
        .connect_with(connect_options(database_url)?)
        .await
}

/// Connections are tuned for the executor's write pattern: every state's
/// worker pool appends transition rows to the same database while resume
/// sweeps and attempt counts read it. WAL keeps those readers off the
/// writers' lock, and with the log flushed at WAL checkpoints rather than
/// per commit (`synchronous = NORMAL`) an append costs one fsync-free
/// write. Foreign keys back the task -> machine and transition -> task
/// references.
fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT))
}

fn pool_for(max_connections: u32, acquire_timeout_secs: u64) -> SqlitePoolOptions {
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs.max(1)))
}
