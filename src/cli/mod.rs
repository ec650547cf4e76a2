//! Command-line interface definitions.

pub mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "claw", version, about = "Agent orchestration runtime", long_about = None)]
pub struct Cli {
    /// Output raw JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to a config file (defaults to .claw/config.yaml hierarchy)
    #[arg(long, global = true, env = "CLAW_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestration daemon (engine workers + cron scheduler)
    Serve {
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
        /// Claim only tasks scoped to this agent pool
        #[arg(long)]
        agent: Option<String>,
    },
    /// Task queue operations
    #[command(subcommand)]
    Task(TaskCommands),
    /// Periodic schedule operations
    #[command(subcommand)]
    Schedule(ScheduleCommands),
    /// Plan execution
    #[command(subcommand)]
    Plan(PlanCommands),
    /// Iterative agent loops
    #[command(subcommand)]
    Loop(LoopCommands),
    /// Engine and queue snapshot
    Status,
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Submit a chat task
    Submit {
        /// Session id (opaque, UUID textual form)
        #[arg(long)]
        session: String,
        /// Message content
        content: String,
        /// Scope the task to an agent pool
        #[arg(long)]
        agent: Option<String>,
    },
    /// List tasks of a session
    List {
        #[arg(long)]
        session: String,
    },
    /// Show one task
    Show { task_id: uuid::Uuid },
    /// Request cancellation of a task
    Abort { task_id: uuid::Uuid },
}

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// Add a cron schedule (5-field expression)
    Add {
        /// Schedule name (unique)
        name: String,
        /// Cron expression: minute hour day month weekday
        #[arg(long)]
        cron: String,
        /// Session the fired tasks belong to
        #[arg(long)]
        session: String,
        /// Task payload content
        #[arg(long)]
        content: String,
    },
    /// List schedules
    List,
}

#[derive(Subcommand)]
pub enum LoopCommands {
    /// Run (or resume) the iterative loop for a task
    Run { task_id: uuid::Uuid },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Execute a plan from a YAML file
    Run {
        /// Plan file
        #[arg(short, long)]
        file: String,
        /// Session id
        #[arg(long)]
        session: String,
    },
}
