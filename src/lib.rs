//! Mission Control Library
//!
//! Task and agent coordination: a JSON-file store, entity state machines,
//! an orchestrator that dispatches work through an agent-runner gateway,
//! and a REST API over all of it.

pub mod cli;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod orchestrator;
pub mod transitions;
pub mod types;
