//! SQLite connection pools for the orchestration store.
//!
//! Pools are built from the [`DatabaseConfig`] section of the claw
//! configuration: a filesystem path plus a connection cap. WAL journaling
//! keeps readers off the writers' lock, and a generous busy timeout
//! absorbs contention between worker claims and intake writes.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::infrastructure::config::DatabaseConfig;

/// How long a caller waits for a pooled connection before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a statement waits on a locked database before failing. Claim
/// and heartbeat updates contend on the tasks table, so this is sized
/// well above the worker poll interval.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open database pool: {0}")]
    OpenPool(#[source] sqlx::Error),
    #[error("database connectivity check failed: {0}")]
    HealthCheck(#[source] sqlx::Error),
}

/// Open the database named by the config, creating the file and its
/// parent directory on first use.
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool, ConnectionError> {
    let path = Path::new(&config.path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|source| ConnectionError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(ConnectionError::OpenPool)
}

/// Private in-memory database for tests. A single connection that never
/// expires keeps the database alive for the pool's whole lifetime.
pub async fn create_test_pool() -> Result<SqlitePool, ConnectionError> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(ConnectionError::OpenPool)
}

/// Round-trip a trivial query to prove the pool is usable.
pub async fn health_check(pool: &SqlitePool) -> Result<(), ConnectionError> {
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
        .map(|_| ())
        .map_err(ConnectionError::HealthCheck)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool_is_usable() {
        let pool = create_test_pool().await.unwrap();
        health_check(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_pool_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("claw.db");
        let config = DatabaseConfig {
            path: db_path.display().to_string(),
            max_connections: 2,
        };

        let pool = create_pool(&config).await.unwrap();
        health_check(&pool).await.unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_test_pool_survives_idle_gaps() {
        let pool = create_test_pool().await.unwrap();
        sqlx::query("CREATE TABLE t (v INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO t (v) VALUES (7)")
            .execute(&pool)
            .await
            .unwrap();

        // The single pinned connection must still hold the table.
        let v: i64 = sqlx::query_scalar("SELECT v FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(v, 7);
    }
}
