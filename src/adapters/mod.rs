//! Adapters implementing the domain ports.

pub mod brains;
pub mod sqlite;
