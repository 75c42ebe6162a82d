//! External command executor.
//!
//! [`CommandExecutor`] interprets a job payload as a JSON command line:
//!
//! ```json
//! {"command": "backup.sh", "args": ["--full"], "timeout_secs": 600}
//! ```
//!
//! The process is spawned inside `launch`, the invocation is moved to
//! RUNNING, and `launch` then waits for the process and records SUCCEEDED or
//! FAILED together with the exit code and the tail of stdout and stderr.
//!
//! **Process Termination**: When a timeout occurs the child is killed as
//! the wait future is dropped. Commands that need graceful cleanup should
//! handle their own deadline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::{Executor, LaunchError};
use crate::engine::InvocationController;
use crate::storage::InvocationStatus;

/// Bytes of stdout/stderr kept in the debug log.
const OUTPUT_TAIL_BYTES: usize = 2048;

/// Command line carried in a job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    /// Program to execute.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Execution timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandPayload {
    /// Create a payload running `command` with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout_secs: None,
        }
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Serialize into job payload bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Executor running payloads as external processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    /// Create a new command executor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn launch(
        &self,
        payload: &[u8],
        ctl: &mut InvocationController,
    ) -> Result<(), LaunchError> {
        let spec: CommandPayload = serde_json::from_slice(payload)?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| LaunchError::Fatal(format!("failed to spawn {}: {}", spec.command, e)))?;

        ctl.debug_log(format!("Running: {}", spec.command_line()));
        ctl.save(InvocationStatus::Running).await?;

        let waited = match spec.timeout_secs.map(Duration::from_secs) {
            Some(duration) => match timeout(duration, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    ctl.debug_log(format!("Command timed out after {:?}", duration));
                    ctl.save(InvocationStatus::Failed).await?;
                    return Ok(());
                }
            },
            None => child.wait_with_output().await,
        };

        let output = match waited {
            Ok(output) => output,
            Err(e) => {
                ctl.debug_log(format!("Failed to wait for the command: {}", e));
                ctl.save(InvocationStatus::Failed).await?;
                return Ok(());
            }
        };

        let code = output.status.code().unwrap_or(-1);
        ctl.debug_log(format!("Exit code: {}", code));
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            ctl.debug_log(format!("stdout:\n{}", tail(&stdout, OUTPUT_TAIL_BYTES)));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            ctl.debug_log(format!("stderr:\n{}", tail(&stderr, OUTPUT_TAIL_BYTES)));
        }

        let status = if output.status.success() {
            InvocationStatus::Succeeded
        } else {
            InvocationStatus::Failed
        };
        ctl.save(status).await?;
        Ok(())
    }
}

/// Last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
