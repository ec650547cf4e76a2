//! Periodic schedule model.
//!
//! A schedule converts each cron firing into a new queued task carrying the
//! schedule's payload. Expressions use the standard 5-field form
//! (minute hour day-of-month month day-of-week).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};

/// A periodic task template fired by the cron scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub session_id: String,
    pub name: String,
    pub cron_expr: String,
    pub payload: String,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Create a new enabled schedule. The first firing time is computed
    /// immediately so a freshly inserted schedule is claimable by the
    /// next tick.
    pub fn new(
        session_id: impl Into<String>,
        name: impl Into<String>,
        cron_expr: impl Into<String>,
        payload: impl Into<String>,
    ) -> CoreResult<Self> {
        let cron_expr = cron_expr.into();
        let now = Utc::now();
        let next = next_run_after(&cron_expr, now)?;
        Ok(Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            name: name.into(),
            cron_expr,
            payload: payload.into(),
            enabled: true,
            next_run_at: Some(next),
            last_run_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether this schedule is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= now)
    }

    /// Compute the firing time following `now`.
    pub fn next_run(&self, now: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
        next_run_after(&self.cron_expr, now)
    }
}

/// Parse a 5-field cron expression, validating the field count.
///
/// The cron crate expects a seconds field, so a `0` seconds column is
/// prepended before parsing.
pub fn parse_cron(expr: &str) -> CoreResult<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(CoreError::Validation(format!(
            "cron expression '{expr}' must have 5 fields (minute hour day month weekday), got {fields}"
        )));
    }
    cron::Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| CoreError::Validation(format!("invalid cron expression '{expr}': {e}")))
}

/// Next firing time strictly after `now` for a 5-field expression.
pub fn next_run_after(expr: &str, now: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
    let schedule = parse_cron(expr)?;
    schedule
        .after(&now)
        .next()
        .ok_or_else(|| CoreError::Validation(format!("cron expression '{expr}' has no future firing")))
}
