//! # Federation Node
//!
//! Process-level pieces around [`federation_cluster`]: the HTTP surface, configuration
//! loading, the command executor seam and tracing setup.

/// HTTP routes and the leader gate middleware
pub mod api;

/// Executors for commands that passed the gate
pub mod executor;

/// Configuration loading from file and environment
pub mod loader;

/// Tracing subscriber setup
pub mod telemetry;

pub use crate::{
    api::{router, AppState, OrchestrationRequest},
    executor::{CommandExecutor, ExecutionError, ExecutionReceipt, LeaderContext, LoggingExecutor},
    loader::ConfigLoader,
    telemetry::init_tracing,
};
