//! Status subcommand: point-in-time snapshot of the engine and queues.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};

use crate::domain::ports::{ScheduleStore, TaskStore};
use crate::services::TaskEngine;

pub async fn handle_status(
    engine: &TaskEngine,
    tasks: &dyn TaskStore,
    schedules: &dyn ScheduleStore,
    json: bool,
) -> Result<()> {
    let status = engine.status();
    let queued = tasks
        .queue_depth()
        .await
        .context("Failed to read queue depth")?;
    let all_schedules = schedules
        .list_schedules()
        .await
        .context("Failed to list schedules")?;
    let enabled = all_schedules.iter().filter(|s| s.enabled).count();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "agent_id": status.agent_id,
                "worker_count": status.worker_count,
                "active_tasks": status.active_tasks,
                "last_error": status.last_error,
                "queued_tasks": queued,
                "schedules": all_schedules.len(),
                "enabled_schedules": enabled,
            })
        );
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec![
        "Scope".to_string(),
        status.agent_id.unwrap_or_else(|| "global".to_string()),
    ]);
    table.add_row(vec!["Workers".to_string(), status.worker_count.to_string()]);
    table.add_row(vec!["Active tasks".to_string(), status.active_tasks.to_string()]);
    table.add_row(vec!["Queued tasks".to_string(), queued.to_string()]);
    table.add_row(vec![
        "Schedules".to_string(),
        format!("{} ({} enabled)", all_schedules.len(), enabled),
    ]);
    table.add_row(vec![
        "Last error".to_string(),
        status.last_error.unwrap_or_else(|| "-".to_string()),
    ]);
    println!("{table}");
    Ok(())
}
