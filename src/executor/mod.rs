//! Node command execution.
//!
//! The controller never touches a device directly: every address, shaping
//! and route change is a shell command handed to a [`NodeExecutor`], which
//! runs it inside the named node and reports stdout, stderr and exit code.
//! Every call carries a timeout.

pub mod dry_run;
pub mod shell;

use std::time::Duration;

use log::debug;

use crate::error::ControllerError;

pub use dry_run::DryRunExecutor;
pub use shell::ShellExecutor;

/// A command addressed to one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeCommand {
    pub node: String,
    pub command: String,
}

impl NodeCommand {
    pub fn new(node: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            command: command.into(),
        }
    }
}

/// What a command printed and how it exited
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Reasons a command could not be run to completion
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs shell commands inside nodes
pub trait NodeExecutor: Send + Sync {
    fn execute(&self, node: &str, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError>;
}

/// Run a command and turn a non-zero exit or an executor error into
/// `CommandExecutionFailed`.
pub fn run_checked(
    executor: &dyn NodeExecutor,
    node: &str,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, ControllerError> {
    debug!("[{}] {}", node, command);
    let failed = |reason: String| ControllerError::CommandExecutionFailed {
        node_id: node.to_string(),
        command: command.to_string(),
        reason,
    };
    match executor.execute(node, command, timeout) {
        Ok(output) if output.success() => Ok(output),
        Ok(output) => Err(failed(format!(
            "exit code {}: {}",
            output.exit_code,
            output.stderr.trim()
        ))),
        Err(e) => Err(failed(e.to_string())),
    }
}
