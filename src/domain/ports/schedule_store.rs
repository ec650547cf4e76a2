//! Schedule store port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::CoreResult;
use crate::domain::models::Schedule;

/// Repository interface for periodic schedules.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert_schedule(&self, schedule: &Schedule) -> CoreResult<()>;

    /// Enabled schedules whose `next_run_at` is at or before `now`.
    async fn due_schedules(&self, now: DateTime<Utc>) -> CoreResult<Vec<Schedule>>;

    /// Atomically record a firing: set `last_run_at` and the next firing
    /// time together.
    async fn update_schedule_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> CoreResult<()>;

    async fn list_schedules(&self) -> CoreResult<Vec<Schedule>>;
}
