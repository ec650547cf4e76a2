//! Plan subcommand handlers.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};

use crate::domain::models::Plan;
use crate::services::PlanExecutor;

pub async fn handle_run(
    executor: &PlanExecutor,
    file: &str,
    session: &str,
    json: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read plan file {file}"))?;
    let plan: Plan = serde_yaml::from_str(&raw).context("Failed to parse plan YAML")?;

    let result = executor
        .execute(&plan, session)
        .await
        .context("Plan execution failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Step", "Wave", "Agent", "Status", "Attempts", "Output / Error"]);
    for record in result.steps.values() {
        let detail = record
            .result
            .clone()
            .or_else(|| record.error.clone())
            .unwrap_or_default();
        table.add_row(vec![
            record.step_id.clone(),
            record.wave_number.to_string(),
            record.agent_id.clone(),
            record.status.as_str().to_string(),
            record.attempt.to_string(),
            truncate(&detail, 60),
        ]);
    }
    println!("{table}");

    match result.status {
        Some(status) => println!("Execution {}: {}", result.execution_id, status.as_str()),
        None => println!("Execution {}: unknown", result.execution_id),
    }
    if let Some(error) = &result.error {
        println!("Error: {error}");
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}
