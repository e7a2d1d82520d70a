//! External command execution.
//!
//! Every shelled-out tool (service control, consensus CLI, openssl,
//! kubectl) is invoked through [`CommandRunner`], so orchestration logic
//! can be exercised against a recording fake.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use muster_common::ClusterError;

/// Runs a program and returns its stdout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv[0]` with the remaining arguments, optionally feeding `stdin`.
    /// A non-zero exit is an `ExternalCommand` error carrying stderr.
    async fn run(&self, argv: Vec<String>, stdin: Option<Vec<u8>>) -> Result<String, ClusterError>;

    /// Convenience wrapper for borrowed arguments
    async fn output(&self, argv: &[&str]) -> Result<String, ClusterError> {
        self.run(argv.iter().map(|a| a.to_string()).collect(), None).await
    }
}

/// Runs commands with `tokio::process`
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: Vec<String>, stdin: Option<Vec<u8>>) -> Result<String, ClusterError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ClusterError::Internal("empty command line".into()))?;
        let command_line = argv.join(" ");
        tracing::debug!(command = %command_line, "Running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterError::ExternalCommand(format!("failed to run {program}: {e}")))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input)
                .await
                .map_err(|e| ClusterError::ExternalCommand(format!("{program}: stdin: {e}")))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ClusterError::ExternalCommand(format!("{command_line} timed out")))?
            .map_err(|e| ClusterError::ExternalCommand(format!("{program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClusterError::ExternalCommand(format!(
                "{command_line} failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
