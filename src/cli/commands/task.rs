//! Task subcommand handlers.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use uuid::Uuid;

use crate::domain::ports::TaskStore;
use crate::services::TaskEngine;

pub async fn handle_submit(
    engine: &TaskEngine,
    session: &str,
    content: &str,
    agent: Option<&str>,
    json: bool,
) -> Result<()> {
    let task_id = match agent {
        Some(agent) => engine
            .create_chat_task_for_agent(agent, session, content)
            .await
            .context("Failed to create agent-scoped task")?,
        None => engine
            .create_chat_task(session, content)
            .await
            .context("Failed to create task")?,
    };

    if json {
        println!("{}", serde_json::json!({ "task_id": task_id }));
    } else {
        println!("Submitted task {task_id}");
    }
    Ok(())
}

pub async fn handle_list(store: &dyn TaskStore, session: &str, json: bool) -> Result<()> {
    let tasks = store
        .list_tasks_by_session(session)
        .await
        .context("Failed to list tasks")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Agent", "Status", "Attempt", "Priority", "Created"]);
    for task in &tasks {
        table.add_row(vec![
            task.id.to_string(),
            task.agent_id.clone().unwrap_or_else(|| "-".to_string()),
            task.status.as_str().to_string(),
            task.attempt.to_string(),
            task.priority.to_string(),
            task.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn handle_show(store: &dyn TaskStore, task_id: Uuid, json: bool) -> Result<()> {
    let task = store
        .get_task(task_id)
        .await
        .context("Failed to load task")?
        .with_context(|| format!("Task {task_id} not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    println!("Task      {}", task.id);
    println!("Session   {}", task.session_id);
    println!("Agent     {}", task.agent_id.as_deref().unwrap_or("-"));
    println!("Status    {}", task.status);
    println!("Attempt   {}", task.attempt);
    println!("Priority  {}", task.priority);
    if let Some(owner) = &task.lease_owner {
        println!("Lease     {owner}");
    }
    if let Some(result) = &task.result {
        println!("Result    {result}");
    }
    if let Some(error) = &task.error {
        let code = task
            .last_error_code
            .map_or_else(String::new, |c| format!(" [{c}]"));
        println!("Error{code}     {error}");
    }
    Ok(())
}

pub async fn handle_abort(engine: &TaskEngine, task_id: Uuid, json: bool) -> Result<()> {
    let aborted = engine
        .abort_task(task_id)
        .await
        .context("Failed to abort task")?;

    if json {
        println!("{}", serde_json::json!({ "task_id": task_id, "aborted": aborted }));
    } else if aborted {
        println!("Abort requested for task {task_id}");
    } else {
        println!("Task {task_id} was not abortable (already terminal?)");
    }
    Ok(())
}
