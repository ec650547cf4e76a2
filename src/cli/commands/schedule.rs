//! Schedule subcommand handlers.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};

use crate::domain::models::{ChatPayload, Schedule};
use crate::domain::ports::ScheduleStore;

pub async fn handle_add(
    store: &dyn ScheduleStore,
    name: &str,
    cron: &str,
    session: &str,
    content: &str,
    json: bool,
) -> Result<()> {
    let payload = ChatPayload::new(content).encode()?;
    let schedule = Schedule::new(session, name, cron, payload)
        .context("Invalid schedule definition")?;
    store
        .insert_schedule(&schedule)
        .await
        .context("Failed to insert schedule")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&schedule)?);
    } else {
        println!(
            "Added schedule '{}' ({}), next run {}",
            schedule.name,
            schedule.cron_expr,
            schedule
                .next_run_at
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
        );
    }
    Ok(())
}

pub async fn handle_list(store: &dyn ScheduleStore, json: bool) -> Result<()> {
    let schedules = store
        .list_schedules()
        .await
        .context("Failed to list schedules")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&schedules)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Name", "Cron", "Session", "Enabled", "Next run", "Last run"]);
    for schedule in &schedules {
        table.add_row(vec![
            schedule.name.clone(),
            schedule.cron_expr.clone(),
            schedule.session_id.clone(),
            schedule.enabled.to_string(),
            schedule
                .next_run_at
                .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string()),
            schedule
                .last_run_at
                .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!("{table}");
    Ok(())
}
