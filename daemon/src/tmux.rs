//! Thin tmux implementation of the session adapter.
//!
//! Shells out to the `tmux` binary; each call is one short-lived subprocess.
//! This is the only place the daemon touches the terminal multiplexer; the
//! orchestration crates see nothing but the `SessionAdapter` trait.

use async_trait::async_trait;
use orchestrator_core::{
    error::{OrchestratorError, Result},
    session::SessionAdapter,
};
use tokio::process::Command;

/// Session adapter backed by the `tmux` command-line client.
#[derive(Debug, Clone, Default)]
pub struct TmuxClient;

impl TmuxClient {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| OrchestratorError::Session(format!("tmux invocation failed: {e}")))
    }

    fn ensure_success(output: &std::process::Output, what: &str) -> Result<()> {
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(OrchestratorError::Session(format!(
                "{what} failed: {}",
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl SessionAdapter for TmuxClient {
    async fn session_exists(&self, name: &str) -> Result<bool> {
        let output = self.run(&["has-session", "-t", name]).await?;
        Ok(output.status.success())
    }

    async fn create_session(&self, name: &str) -> Result<()> {
        let output = self.run(&["new-session", "-d", "-s", name]).await?;
        Self::ensure_success(&output, "create-session")
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        let output = self.run(&["kill-session", "-t", name]).await?;
        Self::ensure_success(&output, "kill-session")
    }

    async fn send_command(&self, name: &str, line: &str) -> Result<()> {
        let output = self.run(&["send-keys", "-t", name, line, "Enter"]).await?;
        Self::ensure_success(&output, "send-keys")
    }

    async fn capture_pane(&self, name: &str) -> Result<String> {
        let output = self.run(&["capture-pane", "-t", name, "-p"]).await?;
        Self::ensure_success(&output, "capture-pane")?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
