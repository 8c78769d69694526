//! # Command Execution
//!
//! Commands that passed the leader gate are handed to a [`CommandExecutor`]. The node ships
//! only [`LoggingExecutor`], which records what it was asked to do; real deployments plug in
//! their own runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use federation_cluster::{Epoch, NodeId, PrivilegedCommand};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Execution failures reported back to the caller
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The runtime refused the command
    #[error("command rejected by runtime: {0}")]
    Rejected(String),

    /// The runtime could not be reached
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

/// Leadership context a command runs under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderContext {
    /// The executing leader
    pub leader_id: NodeId,
    /// Epoch of the leadership tenure
    pub epoch: Epoch,
    /// Lease token of the tenure
    pub lease_token: String,
}

/// A command that ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    /// What ran
    pub command: PrivilegedCommand,
    /// Leader that ran it
    pub leader_id: NodeId,
    /// Tenure it ran under
    pub epoch: Epoch,
    /// When it ran
    pub executed_at: DateTime<Utc>,
}

/// Runs privileged commands on behalf of the leader
#[async_trait]
pub trait CommandExecutor: Send + Sync + fmt::Debug {
    /// Execute an already authorized command
    async fn execute(
        &self,
        command: &PrivilegedCommand,
        leader: &LeaderContext,
    ) -> Result<ExecutionReceipt, ExecutionError>;
}

/// Executor that logs and records commands without touching a runtime
#[derive(Debug, Default)]
pub struct LoggingExecutor {
    executed: RwLock<Vec<ExecutionReceipt>>,
}

impl LoggingExecutor {
    /// Create an executor with an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command executed so far, oldest first
    pub fn executed(&self) -> Vec<ExecutionReceipt> {
        self.executed.read().clone()
    }
}

#[async_trait]
impl CommandExecutor for LoggingExecutor {
    async fn execute(
        &self,
        command: &PrivilegedCommand,
        leader: &LeaderContext,
    ) -> Result<ExecutionReceipt, ExecutionError> {
        info!(
            action = %command.action,
            target = %command.target,
            epoch = %leader.epoch,
            "Executing privileged command"
        );

        let receipt = ExecutionReceipt {
            command: command.clone(),
            leader_id: leader.leader_id.clone(),
            epoch: leader.epoch,
            executed_at: Utc::now(),
        };
        self.executed.write().push(receipt.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use federation_cluster::CommandAction;

    #[tokio::test]
    async fn test_logging_executor_records_commands() {
        let executor = LoggingExecutor::new();
        let leader = LeaderContext {
            leader_id: NodeId::from("node-a"),
            epoch: Epoch::new(7),
            lease_token: "ab".repeat(32),
        };

        let receipt = executor
            .execute(&PrivilegedCommand::new(CommandAction::Deploy, "web"), &leader)
            .await
            .unwrap();

        assert_eq!(receipt.epoch, Epoch::new(7));
        assert_eq!(executor.executed().len(), 1);
        assert_eq!(executor.executed()[0].command.target, "web");
    }
}
