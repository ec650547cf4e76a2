//! Claw CLI entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use claw::adapters::brains::MockBrain;
use claw::adapters::sqlite::{
    all_embedded_migrations, create_pool, health_check, Migrator, SqliteLoopStore,
    SqlitePlanStore, SqliteScheduleStore, SqliteTaskStore,
};
use claw::cli::commands::{loops, plan, schedule, serve, status, task};
use claw::cli::{Cli, Commands, LoopCommands, PlanCommands, ScheduleCommands, TaskCommands};
use claw::infrastructure::config::{Config, ConfigLoader};
use claw::infrastructure::logging::Logger;
use claw::services::{
    ChatProcessor, CompletionWaiter, CronScheduler, EventBus, PlanExecutor, TaskEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    let _logger = Logger::init(&config.logging).context("Failed to initialize logging")?;

    let runtime = Runtime::build(&config).await?;

    match cli.command {
        Commands::Serve { workers, agent } => {
            let mut engine_config = config.engine.to_engine_config(agent);
            if let Some(workers) = workers {
                engine_config.workers = workers;
            }
            let engine = Arc::new(TaskEngine::new(
                runtime.tasks.clone(),
                runtime.processor.clone(),
                runtime.bus.clone(),
                engine_config,
            ));
            let scheduler = Arc::new(CronScheduler::new(
                runtime.schedules.clone(),
                runtime.tasks.clone(),
                runtime.bus.clone(),
                Duration::from_secs(config.scheduler.tick_interval_secs),
            ));
            serve::handle_serve(engine, scheduler).await?;
        }
        Commands::Task(task_cmd) => match task_cmd {
            TaskCommands::Submit {
                session,
                content,
                agent,
            } => {
                let engine = runtime.idle_engine(&config);
                task::handle_submit(&engine, &session, &content, agent.as_deref(), cli.json)
                    .await?;
            }
            TaskCommands::List { session } => {
                task::handle_list(runtime.tasks.as_ref(), &session, cli.json).await?;
            }
            TaskCommands::Show { task_id } => {
                task::handle_show(runtime.tasks.as_ref(), task_id, cli.json).await?;
            }
            TaskCommands::Abort { task_id } => {
                let engine = runtime.idle_engine(&config);
                task::handle_abort(&engine, task_id, cli.json).await?;
            }
        },
        Commands::Schedule(schedule_cmd) => match schedule_cmd {
            ScheduleCommands::Add {
                name,
                cron,
                session,
                content,
            } => {
                schedule::handle_add(
                    runtime.schedules.as_ref(),
                    &name,
                    &cron,
                    &session,
                    &content,
                    cli.json,
                )
                .await?;
            }
            ScheduleCommands::List => {
                schedule::handle_list(runtime.schedules.as_ref(), cli.json).await?;
            }
        },
        Commands::Status => {
            let engine = runtime.idle_engine(&config);
            status::handle_status(
                &engine,
                runtime.tasks.as_ref(),
                runtime.schedules.as_ref(),
                cli.json,
            )
            .await?;
        }
        Commands::Loop(loop_cmd) => match loop_cmd {
            LoopCommands::Run { task_id } => {
                let runner = claw::services::LoopRunner::new(
                    runtime.tasks.clone(),
                    runtime.loops.clone(),
                    runtime.brain.clone(),
                    runtime.bus.clone(),
                    config.loops.to_runner_config(),
                );
                loops::handle_run(&runner, task_id, cli.json).await?;
            }
        },
        Commands::Plan(plan_cmd) => match plan_cmd {
            PlanCommands::Run { file, session } => {
                // Plan steps are agent-scoped; spin up one worker pool
                // per agent named in the plan.
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read plan file {file}"))?;
                let parsed: claw::domain::models::Plan =
                    serde_yaml::from_str(&raw).context("Failed to parse plan YAML")?;

                let mut engines = Vec::new();
                let mut agents: Vec<String> =
                    parsed.steps.iter().map(|s| s.agent_id.clone()).collect();
                agents.sort();
                agents.dedup();
                for agent in agents {
                    let engine = Arc::new(TaskEngine::new(
                        runtime.tasks.clone(),
                        runtime.processor.clone(),
                        runtime.bus.clone(),
                        config.engine.to_engine_config(Some(agent)),
                    ));
                    engine.start().await?;
                    engines.push(engine);
                }

                let launcher = runtime.idle_engine(&config);
                let waiter = Arc::new(CompletionWaiter::new(
                    runtime.tasks.clone(),
                    Some(runtime.bus.clone()),
                ));
                let executor = PlanExecutor::new(
                    runtime.plans.clone(),
                    Arc::new(launcher),
                    waiter,
                    runtime.bus.clone(),
                    config.plan.to_executor_config(),
                );
                plan::handle_run(&executor, &file, &session, cli.json).await?;

                for engine in engines {
                    engine.drain(Duration::from_secs(5)).await;
                    engine.shutdown();
                }
            }
        },
    }

    Ok(())
}

/// Shared stores and collaborators built once per invocation.
struct Runtime {
    tasks: Arc<SqliteTaskStore>,
    plans: Arc<SqlitePlanStore>,
    schedules: Arc<SqliteScheduleStore>,
    loops: Arc<SqliteLoopStore>,
    bus: Arc<EventBus>,
    brain: Arc<MockBrain>,
    processor: Arc<ChatProcessor>,
}

impl Runtime {
    async fn build(config: &Config) -> Result<Self> {
        let pool = create_pool(&config.database)
            .await
            .context("Failed to connect to database")?;
        Migrator::new(pool.clone())
            .run_embedded_migrations(all_embedded_migrations())
            .await
            .context("Failed to run database migrations")?;
        health_check(&pool)
            .await
            .context("Database health check failed")?;

        let tasks = Arc::new(SqliteTaskStore::new(pool.clone()));
        let plans = Arc::new(SqlitePlanStore::new(pool.clone()));
        let schedules = Arc::new(SqliteScheduleStore::new(pool.clone()));
        let loops = Arc::new(SqliteLoopStore::new(pool));
        let bus = Arc::new(EventBus::new());
        let brain = Arc::new(MockBrain::new());
        let processor = Arc::new(ChatProcessor::new(tasks.clone(), brain.clone()));

        Ok(Self {
            tasks,
            plans,
            schedules,
            loops,
            bus,
            brain,
            processor,
        })
    }

    /// Engine with no workers, used for intake-only commands.
    fn idle_engine(&self, config: &Config) -> TaskEngine {
        let mut engine_config = config.engine.to_engine_config(None);
        engine_config.workers = 0;
        TaskEngine::new(
            self.tasks.clone(),
            self.processor.clone(),
            self.bus.clone(),
            engine_config,
        )
    }
}
