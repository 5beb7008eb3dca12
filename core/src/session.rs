use crate::error::Result;
use async_trait::async_trait;

/// Adapter over a named terminal-multiplexer session.
///
/// This is the orchestrator's only channel to an agent: write lines into the
/// session, read back the visible pane. One session is owned by exactly one
/// agent bridge; only that bridge writes (`capture_pane` is side-effect-free
/// and may be called by readers).
#[async_trait]
pub trait SessionAdapter: Send + Sync {
    /// Whether a session with this name currently exists.
    async fn session_exists(&self, name: &str) -> Result<bool>;

    /// Create a new detached session with this name.
    async fn create_session(&self, name: &str) -> Result<()>;

    /// Kill the named session.
    async fn kill_session(&self, name: &str) -> Result<()>;

    /// Write one line plus a newline into the session.
    async fn send_command(&self, name: &str, line: &str) -> Result<()>;

    /// Return the currently visible pane content.
    async fn capture_pane(&self, name: &str) -> Result<String>;
}
