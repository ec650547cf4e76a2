//! Loop subcommand handlers.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::services::LoopRunner;

pub async fn handle_run(runner: &LoopRunner, task_id: Uuid, json: bool) -> Result<()> {
    let result = runner
        .run(task_id)
        .await
        .context("Loop execution failed")?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "status": result.status.as_str(),
                "steps": result.steps,
                "tokens_used": result.tokens_used,
                "response": result.response,
                "error": result.error,
            })
        );
        return Ok(());
    }

    println!(
        "Loop finished: {} after {} step(s), ~{} tokens",
        result.status.as_str(),
        result.steps,
        result.tokens_used
    );
    if !result.response.is_empty() {
        println!("Last response: {}", result.response);
    }
    if let Some(error) = &result.error {
        println!("Error: {error}");
    }
    Ok(())
}
