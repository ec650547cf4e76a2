//! Cron scheduler: converts due schedules into queued tasks.
//!
//! An immediate pass runs at startup, then a fixed-interval tick. Per-
//! schedule errors are logged and skipped; a failed next-run computation
//! leaves the schedule untouched so the next tick retries it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::errors::CoreResult;
use crate::domain::models::Schedule;
use crate::domain::ports::{ScheduleStore, TaskStore};
use crate::services::event_bus::{EventBus, EventPayload};

/// Default tick interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

pub struct CronScheduler {
    schedules: Arc<dyn ScheduleStore>,
    tasks: Arc<dyn TaskStore>,
    bus: Arc<EventBus>,
    tick_interval: Duration,
}

impl CronScheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        tasks: Arc<dyn TaskStore>,
        bus: Arc<EventBus>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            schedules,
            tasks,
            bus,
            tick_interval,
        }
    }

    /// Run until the shutdown token fires. The first pass happens
    /// immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.tick_interval.as_secs(),
            "cron scheduler started"
        );
        loop {
            match self.tick().await {
                Ok(fired) if fired > 0 => debug!(fired, "cron tick fired schedules"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "cron tick failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = sleep(self.tick_interval) => {}
            }
        }
        info!("cron scheduler stopped");
    }

    /// One pass over the due schedules; returns how many fired.
    pub async fn tick(&self) -> CoreResult<u64> {
        let now = Utc::now();
        let due = self.schedules.due_schedules(now).await?;

        let mut fired = 0;
        for schedule in due {
            match self.fire(&schedule).await {
                Ok(()) => fired += 1,
                Err(e) => {
                    // Logged and skipped; the schedule stays due and the
                    // next tick retries it.
                    warn!(
                        schedule = %schedule.name,
                        error = %e,
                        "failed to fire schedule"
                    );
                }
            }
        }
        Ok(fired)
    }

    async fn fire(&self, schedule: &Schedule) -> CoreResult<()> {
        let now = Utc::now();
        // Compute the next firing before mutating anything; an invalid
        // expression leaves the schedule unmodified.
        let next_run = schedule.next_run(now)?;

        self.tasks.ensure_session(&schedule.session_id).await?;
        let task_id = self
            .tasks
            .create_task(&schedule.session_id, &schedule.payload)
            .await?;

        self.schedules
            .update_schedule_run(schedule.id, now, next_run)
            .await?;

        self.bus
            .publish(EventPayload::ScheduleFired {
                schedule_id: schedule.id,
                name: schedule.name.clone(),
                task_id,
            })
            .await;

        debug!(
            schedule = %schedule.name,
            %task_id,
            next_run = %next_run,
            "schedule fired"
        );
        Ok(())
    }
}
