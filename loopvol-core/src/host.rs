//! Host utility invocation.
//!
//! Everything privileged (allocation, formatting, mounting, ownership) goes
//! through a [`CommandRunner`] so the volume manager never spawns processes
//! directly.

use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Outcome of running a host utility.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the utility exited with status 0
    pub success: bool,

    /// Trimmed standard output
    pub stdout: String,

    /// Trimmed standard error
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self { success: true, ..Default::default() }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self { success: false, stdout: String::new(), stderr: stderr.into() }
    }
}

/// Runs host utilities on behalf of the volume manager.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion.
    ///
    /// # Returns
    /// * `Ok(output)` once the process exited, successfully or not
    /// * `Err` if the process could not be spawned at all
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs utilities found on `PATH` via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

#[async_trait::async_trait]
impl CommandRunner for SystemCommandRunner {
    #[instrument(skip(self, args), fields(args = ?args))]
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        debug!("Running {}", program);

        let output = Command::new(program).args(args).output().await?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Create the runner used outside of tests.
pub fn system_runner() -> Arc<dyn CommandRunner> {
    Arc::new(SystemCommandRunner)
}

/// Run a utility and fold spawn errors and non-zero exits into one message.
///
/// Returns the utility's stderr (or stdout when stderr is empty) on failure.
pub(crate) async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> std::result::Result<(), String> {
    match runner.run(program, args).await {
        Ok(output) if output.success => Ok(()),
        Ok(output) => {
            let message = if output.stderr.is_empty() { output.stdout } else { output.stderr };
            Err(if message.is_empty() {
                format!("{} exited with a non-zero status", program)
            } else {
                message
            })
        }
        Err(e) => Err(format!("failed to run {}: {}", program, e)),
    }
}
