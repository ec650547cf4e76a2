//! Claw - agent orchestration runtime.
//!
//! The orchestration core of a multi-agent LLM runtime:
//! - Durable lease-based task queue with bounded worker pools
//! - DAG plan executor turning declarative plans into resumable task chains
//! - In-process publish/subscribe bus for lifecycle events
//! - Cron scheduler and budgeted agent loops
//! - SQLite persistence with WAL mode

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{CoreError, CoreResult, ErrorCode};
