//! The command-execution boundary: `(command, timeout) -> outcome`.
//!
//! The shipped implementation wraps `tokio::process::Command`; swapping it
//! for a different executor (containerized, remote, ...) only requires a new
//! `CommandExecutor` impl.

use async_trait::async_trait;
use chrono::Duration;
use std::time::Duration as StdDuration;

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output_ref: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, timeout: Duration) -> ExecutionOutcome;
}

/// Runs `command` through `sh -c`, truncating stdout/stderr inline rather
/// than shipping them to a blob store (out of scope for this crate).
pub struct ShellExecutor {
    /// Maximum number of bytes of combined stdout/stderr retained in
    /// `output_ref`.
    pub output_limit: usize,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self { output_limit: 8192 }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str, timeout: Duration) -> ExecutionOutcome {
        let std_timeout = timeout
            .to_std()
            .unwrap_or(StdDuration::from_secs(0));

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(std_timeout, child).await {
            Err(_) => ExecutionOutcome {
                success: false,
                exit_code: None,
                output_ref: None,
                error: Some("timed out".to_string()),
            },
            Ok(Err(e)) => ExecutionOutcome {
                success: false,
                exit_code: None,
                output_ref: None,
                error: Some(format!("spawn failed: {e}")),
            },
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                combined.truncate(self.output_limit);

                ExecutionOutcome {
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    output_ref: Some(combined),
                    error: if output.status.success() {
                        None
                    } else {
                        Some(format!("exit status {:?}", output.status.code()))
                    },
                }
            }
        }
    }
}
