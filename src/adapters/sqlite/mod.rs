//! SQLite adapters for the store ports.

pub mod connection;
pub mod loop_store;
pub mod migrations;
pub mod plan_store;
pub mod schedule_store;
pub mod task_store;

pub use connection::{create_pool, create_test_pool, health_check, ConnectionError};
pub use loop_store::SqliteLoopStore;
pub use migrations::{all_embedded_migrations, Migrator};
pub use plan_store::SqlitePlanStore;
pub use schedule_store::SqliteScheduleStore;
pub use task_store::SqliteTaskStore;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::CoreError;

/// In-memory pool with the full schema applied; test fixture shared by
/// adapter and service tests.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, CoreError> {
    let pool = create_test_pool()
        .await
        .map_err(|e| CoreError::Database(e.to_string()))?;
    Migrator::new(pool.clone())
        .run_embedded_migrations(all_embedded_migrations())
        .await
        .map_err(|e| CoreError::Database(e.to_string()))?;
    Ok(pool)
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(raw).map_err(|e| CoreError::Serialization(format!("invalid uuid '{raw}': {e}")))
}

pub(crate) fn parse_optional_uuid(raw: Option<String>) -> Result<Option<Uuid>, CoreError> {
    raw.as_deref().map(parse_uuid).transpose()
}

pub(crate) fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Serialization(format!("invalid timestamp '{raw}': {e}")))
}

pub(crate) fn parse_optional_datetime(
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, CoreError> {
    raw.as_deref().map(parse_datetime).transpose()
}
