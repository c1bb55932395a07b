use std::sync::Mutex;
use std::time::Duration;

use log::info;

use super::{CommandOutput, ExecError, NodeCommand, NodeExecutor};

/// Executor that logs and records commands instead of running them
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    issued: Mutex<Vec<NodeCommand>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands seen so far, in the order they were issued
    pub fn issued(&self) -> Vec<NodeCommand> {
        self.issued.lock().map(|guard| guard.clone()).unwrap_or_default()
    }
}

impl NodeExecutor for DryRunExecutor {
    fn execute(&self, node: &str, command: &str, _timeout: Duration) -> Result<CommandOutput, ExecError> {
        info!("(dry run) [{}] {}", node, command);
        if let Ok(mut guard) = self.issued.lock() {
            guard.push(NodeCommand::new(node, command));
        }
        Ok(CommandOutput::default())
    }
}
