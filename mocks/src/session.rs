//! Scripted terminal session for bridge testing.
//!
//! Simulates the pane-level behavior the agent bridge depends on: typed
//! lines echo into the pane immediately, `echo '...'` produces its quoted
//! text as an output line, scripted commands produce configured output
//! (optionally only after a number of pane captures, or never, to model
//! long-running commands), and input typed while a command runs is buffered
//! until the command finishes.

use async_trait::async_trait;
use orchestrator_core::{
    error::{OrchestratorError, Result},
    session::SessionAdapter,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Scripted behavior for one exact command line.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCommand {
    /// Output lines the command prints when it finishes
    pub output: Vec<String>,
    /// Number of pane captures the command stays busy before finishing
    pub busy_captures: u32,
    /// Command never finishes (models `sleep 30` against a short timeout)
    pub blocks: bool,
}

#[derive(Debug, Default)]
struct Pane {
    lines: Vec<String>,
    /// Currently executing command: remaining captures and its eventual output
    busy: Option<(u32, Vec<String>)>,
    /// Lines typed while the pane was busy, awaiting the shell
    queued: Vec<String>,
}

#[derive(Default)]
struct SessionsState {
    panes: HashMap<String, Pane>,
    scripts: HashMap<String, ScriptedCommand>,
    send_failures: u32,
    capture_failures: u32,
    sent_log: Vec<(String, String)>,
    created: Vec<String>,
    killed: Vec<String>,
}

/// Thread-safe scripted [`SessionAdapter`] for tests.
#[derive(Clone, Default)]
pub struct ScriptedSession {
    state: Arc<Mutex<SessionsState>>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a session pane.
    pub fn with_session(self, name: &str) -> Self {
        self.state
            .lock()
            .panes
            .insert(name.to_string(), Pane::default());
        self
    }

    /// Script a command's behavior; the command line must match exactly.
    pub fn script(&self, command: &str, behavior: ScriptedCommand) {
        self.state
            .lock()
            .scripts
            .insert(command.to_string(), behavior);
    }

    /// Script a command that prints `output` immediately.
    pub fn on_command(&self, command: &str, output: &[&str]) {
        self.script(
            command,
            ScriptedCommand {
                output: output.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        );
    }

    /// Script a command that finishes (and prints) only after `captures`
    /// pane captures.
    pub fn on_command_slow(&self, command: &str, output: &[&str], captures: u32) {
        self.script(
            command,
            ScriptedCommand {
                output: output.iter().map(|s| s.to_string()).collect(),
                busy_captures: captures,
                ..Default::default()
            },
        );
    }

    /// Script a command that never finishes.
    pub fn on_command_blocking(&self, command: &str) {
        self.script(
            command,
            ScriptedCommand {
                blocks: true,
                ..Default::default()
            },
        );
    }

    /// Fail the next `count` send_command calls with a session error.
    pub fn fail_sends(&self, count: u32) {
        self.state.lock().send_failures = count;
    }

    /// Fail the next `count` capture_pane calls with a session error.
    pub fn fail_captures(&self, count: u32) {
        self.state.lock().capture_failures = count;
    }

    /// Every line sent to `session`, in order.
    pub fn sent_lines(&self, session: &str) -> Vec<String> {
        self.state
            .lock()
            .sent_log
            .iter()
            .filter(|(s, _)| s == session)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Sessions created through the adapter.
    pub fn created_sessions(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// Sessions killed through the adapter.
    pub fn killed_sessions(&self) -> Vec<String> {
        self.state.lock().killed.clone()
    }

    /// Append raw lines to a pane, as if written by the agent itself.
    pub fn inject_pane_output(&self, session: &str, lines: &[&str]) {
        let mut state = self.state.lock();
        if let Some(pane) = state.panes.get_mut(session) {
            pane.lines.extend(lines.iter().map(|s| s.to_string()));
        }
    }

    fn execute(scripts: &HashMap<String, ScriptedCommand>, pane: &mut Pane, line: &str) {
        if line == "clear" {
            pane.lines.clear();
            return;
        }

        // Shell `echo '<text>'` prints the quoted text
        if let Some(quoted) = line
            .strip_prefix("echo '")
            .and_then(|rest| rest.strip_suffix('\''))
        {
            pane.lines.push(quoted.to_string());
            return;
        }

        if let Some(script) = scripts.get(line) {
            if script.blocks {
                pane.busy = Some((u32::MAX, Vec::new()));
            } else if script.busy_captures > 0 {
                pane.busy = Some((script.busy_captures, script.output.clone()));
            } else {
                pane.lines.extend(script.output.iter().cloned());
            }
        }
        // Unscripted commands produce no output
    }
}

#[async_trait]
impl SessionAdapter for ScriptedSession {
    async fn session_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().panes.contains_key(name))
    }

    async fn create_session(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.created.push(name.to_string());
        state.panes.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.killed.push(name.to_string());
        state.panes.remove(name);
        Ok(())
    }

    async fn send_command(&self, name: &str, line: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.send_failures > 0 {
            state.send_failures -= 1;
            return Err(OrchestratorError::Session(format!(
                "send to '{name}' failed"
            )));
        }

        state.sent_log.push((name.to_string(), line.to_string()));
        let scripts = state.scripts.clone();
        let pane = state
            .panes
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::Session(format!("no session named '{name}'")))?;

        // Typed input always echoes into the pane
        pane.lines.push(line.to_string());

        if pane.busy.is_some() {
            // Shell is busy; the line waits in the input buffer
            pane.queued.push(line.to_string());
        } else {
            Self::execute(&scripts, pane, line);
        }
        Ok(())
    }

    async fn capture_pane(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock();
        if state.capture_failures > 0 {
            state.capture_failures -= 1;
            return Err(OrchestratorError::Session(format!(
                "capture of '{name}' failed"
            )));
        }

        let scripts = state.scripts.clone();
        let pane = state
            .panes
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::Session(format!("no session named '{name}'")))?;

        // Advance the running command, if any
        if let Some((remaining, output)) = pane.busy.take() {
            if remaining == u32::MAX {
                pane.busy = Some((remaining, output));
            } else if remaining > 1 {
                pane.busy = Some((remaining - 1, output));
            } else {
                pane.lines.extend(output);
                // Catch up on input buffered while the command ran
                let queued = std::mem::take(&mut pane.queued);
                for line in queued {
                    if pane.busy.is_some() {
                        pane.queued.push(line);
                    } else {
                        Self::execute(&scripts, pane, &line);
                    }
                }
            }
        }

        Ok(pane.lines.join("\n"))
    }
}
