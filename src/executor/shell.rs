//! Executor that shells out to a per-node command wrapper.
//!
//! The wrapper is a program plus an argument template in which `{node}` and
//! `{command}` are substituted, e.g. `ip netns exec {node} sh -c {command}`
//! or `kathara exec {node} -- {command}`.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::{CommandOutput, ExecError, NodeExecutor};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs node commands through an external wrapper program
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    program: String,
    args: Vec<String>,
}

impl ShellExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Wrapper running commands in a network namespace named after the node
    pub fn netns() -> Self {
        Self::new(
            "ip",
            ["netns", "exec", "{node}", "sh", "-c", "{command}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub(crate) fn render_args(&self, node: &str, command: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{node}", node).replace("{command}", command))
            .collect()
    }
}

/// Read a pipe to the end on its own thread.
///
/// A grandchild that inherited the pipe keeps it open after the wrapper
/// exits, so the reader may never finish. Callers wait on the receiver with
/// a deadline instead of joining.
fn drain<R: Read + Send + 'static>(source: Option<R>) -> Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut source) = source {
            let _ = source.read_to_string(&mut buffer);
        }
        let _ = sender.send(buffer);
    });
    receiver
}

fn collect(receiver: &Receiver<String>, deadline: Instant) -> Option<String> {
    match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(buffer) => Some(buffer),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(String::new()),
    }
}

fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Result<Option<i32>, ExecError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

impl NodeExecutor for ShellExecutor {
    fn execute(&self, node: &str, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError> {
        let args = self.render_args(node, command);
        debug!("Running {} {:?}", self.program, args);

        let deadline = Instant::now() + timeout;
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let exit_code = match wait_with_deadline(&mut child, deadline)? {
            Some(code) => code,
            None => {
                warn!("Command on {} exceeded {:?}, killing it: {}", node, timeout, command);
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecError::Timeout(timeout));
            }
        };

        // The output deadline is the command deadline
        let (Some(stdout), Some(stderr)) = (collect(&stdout, deadline), collect(&stderr, deadline)) else {
            warn!(
                "Output of command on {} still open after {:?}, a background process holds it: {}",
                node, timeout, command
            );
            return Err(ExecError::Timeout(timeout));
        };

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}
