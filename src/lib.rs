//! thop — a shell multiplexer for AI coding agents.
//!
//! The runtime maintains a pool of named execution contexts — the local
//! machine plus any number of persistent remote SSH hosts — exposes
//! exactly one as *active*, and routes every command there while each
//! context keeps its own working directory, environment, and connection.
//!
//! The defining constraint is **non-blocking authentication**: nothing in
//! this crate ever waits on a human. A missing credential, an unknown
//! host key, or an unreachable host returns an immediate structured
//! [`Error`] carrying a wire code, the session and host involved, a
//! retryability flag, and an actionable suggestion.
//!
//! # Entry points
//!
//! [`SessionManager`] is the API consumed by the interactive shell, the
//! proxy reader, and the MCP façade (all external to this crate):
//!
//! ```no_run
//! use thop::{ManagerConfig, SessionManager, StateStore};
//! use std::sync::Arc;
//!
//! # async fn demo() -> thop::Result<()> {
//! let state = Arc::new(StateStore::open_default().map_err(thop::Error::state_store)?);
//! let manager = SessionManager::new(ManagerConfig::default(), state).await;
//!
//! let out = manager.execute("echo hello").await?;
//! assert_eq!(out.stdout, "hello\n");
//! # Ok(())
//! # }
//! ```
//!
//! Dropped SSH connections are re-established transparently: a dispatch
//! that fails with a retryable connection loss runs the exponential-
//! backoff reconnect engine (with persisted environment replay) and
//! retries once.

pub mod config;
pub mod error;
pub mod jobs;
pub mod manager;
pub mod prompt;
pub(crate) mod reconnect;
pub mod restrict;
pub mod session;
pub mod state;

pub use config::{LocalConfig, ManagerConfig, SshConfig};
pub use error::{Error, ErrorKind, Result};
pub use jobs::{JobRecord, JobStatus};
pub use manager::{LOCAL_SESSION, SessionManager, SessionSummary};
pub use session::{CommandOutput, LocalSession, Session, SessionKind, SshSession};
pub use state::{SessionState, StatePatch, StateStore};
