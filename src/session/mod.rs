//! Session abstraction.
//!
//! A session is a named execution context — the local machine or a
//! persistent remote SSH host — with its own working directory,
//! environment overlay, and connection state. The manager owns every
//! session and routes commands to whichever one is active.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub mod local;
pub mod ssh;

pub use local::LocalSession;
pub use ssh::SshSession;

/// Which variant a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionKind {
    Local,
    Ssh,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Local => "local",
            SessionKind::Ssh => "ssh",
        }
    }
}

/// Captured result of one buffered command execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// The fixed output of a cancelled command: `^C` on stderr, exit 130.
    pub(crate) fn interrupted() -> Self {
        Self {
            stdout: String::new(),
            stderr: "^C\n".to_string(),
            exit_code: 130,
        }
    }
}

/// A named execution context.
///
/// Implementations are individually thread-safe: concurrent calls on one
/// session are allowed (an SSH session opens a distinct channel per
/// command on the same client). Sessions track their own cwd and env;
/// they never reach back into the manager.
#[async_trait]
pub trait Session: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SessionKind;

    /// Establish the underlying connection. A no-op for already-connected
    /// sessions. Must never prompt: missing credentials and host-key
    /// problems surface as structured errors immediately.
    async fn connect(&self) -> Result<()>;

    /// Tear down the underlying connection.
    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Run a command to completion, capturing stdout/stderr.
    ///
    /// Cancellation and the per-session command timeout are raced against
    /// completion; see the implementations for the exact teardown each
    /// performs.
    async fn execute(&self, cmd: &str, cancel: &CancellationToken) -> Result<CommandOutput>;

    /// Run a command (or a login shell when `cmd` is `None`) attached to
    /// the controlling TTY, returning its exit code.
    async fn execute_interactive(&self, cmd: Option<&str>) -> Result<i32>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()>;

    /// Last-observed working directory.
    async fn cwd(&self) -> Option<String>;

    /// Seed the cached working directory (used when restoring persisted
    /// state). Implementations may validate and silently ignore paths
    /// that no longer exist.
    async fn restore_cwd(&self, cwd: &str);

    async fn env(&self) -> BTreeMap<String, String>;

    async fn set_env(&self, key: &str, value: &str);
}
