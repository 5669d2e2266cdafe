//! Session manager: registry, active pointer, and the dispatch path.
//!
//! The manager owns every session, keeps exactly one of them active, and
//! routes commands there. Its dispatch path is where the runtime's
//! recovery policy lives:
//!
//! 1. restricted-mode check — a vetoed command fails before any side
//!    effect;
//! 2. the session executes;
//! 3. a retryable connection-loss failure (SSH only, token not fired)
//!    triggers the reconnect engine and exactly one retry;
//! 4. on success, the session's cwd and connection flag are persisted.
//!
//! To callers the reconnect-and-retry is invisible: one logical execute
//! that either succeeds, is vetoed, or returns the second attempt's
//! verdict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ManagerConfig, SshConfig};
use crate::error::{Error, Result};
use crate::jobs::{JobRecord, JobRegistry};
use crate::prompt;
use crate::reconnect;
use crate::restrict::RestrictionChecker;
use crate::session::{CommandOutput, LocalSession, Session, SessionKind, SshSession};
use crate::state::{StatePatch, StateStore};

/// Name of the always-present local session.
pub const LOCAL_SESSION: &str = "local";

/// One row of `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub name: String,
    pub kind: SessionKind,
    pub connected: bool,
    pub cwd: Option<String>,
    pub active: bool,
}

/// Owner of all sessions and the single dispatch entry point.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
    active: RwLock<String>,
    state: Arc<StateStore>,
    checker: RestrictionChecker,
    jobs: Arc<JobRegistry>,
    command_timeout: Duration,
    connect_timeout: Duration,
    reconnect_max_attempts: u32,
    reconnect_backoff_base: Duration,
}

impl SessionManager {
    /// Build the registry from config and restore persisted state.
    ///
    /// The `local` session always exists. The persisted active session is
    /// adopted iff it names a known session; persisted cwds are restored
    /// best-effort.
    pub async fn new(config: ManagerConfig, state: Arc<StateStore>) -> Self {
        let mut sessions: HashMap<String, Arc<dyn Session>> = HashMap::new();
        sessions.insert(
            LOCAL_SESSION.to_string(),
            Arc::new(LocalSession::new(
                LOCAL_SESSION,
                &config.local,
                config.command_timeout,
            )),
        );

        for (name, ssh_config) in &config.sessions {
            if name == LOCAL_SESSION {
                warn!("ignoring configured ssh session shadowing '{}'", LOCAL_SESSION);
                continue;
            }
            sessions.insert(
                name.clone(),
                Arc::new(SshSession::new(
                    name.as_str(),
                    ssh_config.clone(),
                    config.command_timeout,
                    config.connect_timeout,
                )),
            );
        }

        let active = state
            .get_active()
            .filter(|name| sessions.contains_key(name))
            .unwrap_or_else(|| LOCAL_SESSION.to_string());

        for (name, session) in &sessions {
            if let Some(persisted) = state.get_session_state(name)
                && !persisted.cwd.is_empty()
            {
                session.restore_cwd(&persisted.cwd).await;
            }
        }

        info!(active = %active, sessions = sessions.len(), "session manager ready");
        Self {
            sessions: RwLock::new(sessions),
            active: RwLock::new(active),
            state,
            checker: RestrictionChecker::new(config.restricted_mode),
            jobs: Arc::new(JobRegistry::new()),
            command_timeout: config.command_timeout,
            connect_timeout: config.connect_timeout,
            reconnect_max_attempts: config.reconnect_max_attempts,
            reconnect_backoff_base: config.reconnect_backoff_base,
        }
    }

    /// Convenience constructor using the default state location.
    pub async fn with_default_state(config: ManagerConfig) -> Result<Self> {
        let state = Arc::new(StateStore::open_default().map_err(Error::state_store)?);
        Ok(Self::new(config, state).await)
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn Session>> {
        self.sessions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::session_not_found(name))
    }

    pub async fn has(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    pub async fn active_name(&self) -> String {
        self.active.read().await.clone()
    }

    pub async fn active(&self) -> Result<Arc<dyn Session>> {
        let name = self.active_name().await;
        self.get(&name).await
    }

    /// Switch the active pointer. Persists immediately; never connects —
    /// a disconnected target surfaces on the next execute, which then
    /// drives the reconnect engine.
    pub async fn set_active(&self, name: &str) -> Result<()> {
        if !self.has(name).await {
            return Err(Error::session_not_found(name));
        }
        *self.active.write().await = name.to_string();
        self.state.set_active(name).map_err(Error::state_store)?;
        debug!(active = name, "active session switched");
        Ok(())
    }

    pub async fn connect(&self, name: &str) -> Result<()> {
        let session = self.get(name).await?;
        session.connect().await?;
        self.persist_session(name, &session).await;
        Ok(())
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        if name == LOCAL_SESSION {
            return Err(Error::cannot_close_local());
        }
        let session = self.get(name).await?;
        session.disconnect().await?;
        if let Err(err) = self.state.update_session_state(
            name,
            StatePatch {
                connected: Some(false),
                ..Default::default()
            },
        ) {
            warn!(session = name, %err, "failed to persist disconnect");
        }
        Ok(())
    }

    /// Register a new SSH session.
    pub async fn add(&self, name: &str, config: SshConfig) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(name) {
            return Err(Error::session_already_exists(name));
        }
        let host = config.host.clone();
        sessions.insert(
            name.to_string(),
            Arc::new(SshSession::new(
                name,
                config,
                self.command_timeout,
                self.connect_timeout,
            )),
        );
        drop(sessions);

        if let Err(err) = self.state.update_session_state(
            name,
            StatePatch {
                connected: Some(false),
                kind: Some(SessionKind::Ssh.as_str().to_string()),
                ..Default::default()
            },
        ) {
            warn!(session = name, %err, "failed to persist new session");
        }
        info!(session = name, host = %host, "session added");
        Ok(())
    }

    /// Remove an SSH session. The local session cannot be removed; an
    /// active session falls back to `local` first.
    pub async fn remove(&self, name: &str) -> Result<()> {
        if name == LOCAL_SESSION {
            return Err(Error::cannot_close_local());
        }
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(name)
                .ok_or_else(|| Error::session_not_found(name))?
        };

        if self.active_name().await == name {
            self.set_active(LOCAL_SESSION).await?;
        }
        let _ = session.disconnect().await;
        if let Err(err) = self.state.remove_session(name) {
            warn!(session = name, %err, "failed to drop persisted session state");
        }
        info!(session = name, "session removed");
        Ok(())
    }

    /// Execute on the active session without external cancellation.
    pub async fn execute(&self, cmd: &str) -> Result<CommandOutput> {
        self.execute_with_cancel(&CancellationToken::new(), cmd).await
    }

    /// Execute on the active session, raced against `cancel`.
    pub async fn execute_with_cancel(
        &self,
        cancel: &CancellationToken,
        cmd: &str,
    ) -> Result<CommandOutput> {
        let name = self.active_name().await;
        let session = self.get(&name).await?;
        self.dispatch(&name, session, cmd, cancel).await
    }

    /// Execute on a named session, bypassing the active pointer.
    pub async fn execute_on(&self, name: &str, cmd: &str) -> Result<CommandOutput> {
        let session = self.get(name).await?;
        self.dispatch(name, session, cmd, &CancellationToken::new())
            .await
    }

    async fn dispatch(
        &self,
        name: &str,
        session: Arc<dyn Session>,
        cmd: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        if let Some(rule) = self.checker.check(cmd) {
            return Err(Error::command_restricted(format!(
                "command blocked by restricted mode ({})",
                rule.category.as_str()
            ))
            .with_session(name.to_string())
            .with_suggestion("disable restricted mode or rephrase the command"));
        }

        let result = session.execute(cmd, cancel).await;
        let result = match result {
            Err(err)
                if err.should_reconnect()
                    && session.kind() == SessionKind::Ssh
                    && !cancel.is_cancelled() =>
            {
                debug!(session = name, %err, "dispatch hit connection loss, reconnecting");
                reconnect::reconnect_session(
                    name,
                    &session,
                    &self.state,
                    self.reconnect_max_attempts,
                    self.reconnect_backoff_base,
                    cancel,
                )
                .await?;
                session.execute(cmd, cancel).await
            }
            other => other,
        };

        let output = result?;
        self.persist_session(name, &session).await;
        Ok(output)
    }

    /// Run an interactive (PTY) command on the active session.
    pub async fn execute_interactive(&self, cmd: Option<&str>) -> Result<i32> {
        if let Some(cmd) = cmd
            && let Some(rule) = self.checker.check(cmd)
        {
            return Err(Error::command_restricted(format!(
                "command blocked by restricted mode ({})",
                rule.category.as_str()
            )));
        }
        let session = self.active().await?;
        session.execute_interactive(cmd).await
    }

    async fn persist_session(&self, name: &str, session: &Arc<dyn Session>) {
        let patch = StatePatch {
            connected: Some(session.is_connected().await),
            cwd: session.cwd().await,
            kind: Some(session.kind().as_str().to_string()),
        };
        if let Err(err) = self.state.update_session_state(name, patch) {
            warn!(session = name, %err, "failed to persist session state");
        }
    }

    /// Set an environment variable on the active session, persisting it
    /// so a later reconnect replays it.
    pub async fn set_session_env(&self, key: &str, value: &str) -> Result<()> {
        let name = self.active_name().await;
        let session = self.get(&name).await?;
        session.set_env(key, value).await;
        self.state
            .set_session_env(&name, key, value)
            .map_err(Error::state_store)?;
        Ok(())
    }

    /// Summaries of every session, sorted by name.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let active = self.active_name().await;
        let sessions = self.sessions.read().await;
        let mut rows = Vec::with_capacity(sessions.len());
        for (name, session) in sessions.iter() {
            rows.push(SessionSummary {
                name: name.clone(),
                kind: session.kind(),
                connected: session.is_connected().await,
                cwd: session.cwd().await,
                active: *name == active,
            });
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Prompt string for the active session.
    pub async fn prompt(&self) -> String {
        let name = self.active_name().await;
        let cwd = match self.get(&name).await {
            Ok(session) => session.cwd().await.unwrap_or_default(),
            Err(_) => String::new(),
        };
        prompt::format_prompt(&name, &cwd)
    }

    /// Host aliases from `~/.ssh/config`, for completion and `add`
    /// suggestions. Wildcard patterns are skipped; the full ssh-config
    /// parser lives with the config collaborator.
    pub fn ssh_config_hosts(&self) -> Vec<String> {
        let Some(home) = dirs::home_dir() else {
            return Vec::new();
        };
        match std::fs::read_to_string(home.join(".ssh").join("config")) {
            Ok(contents) => parse_ssh_config_hosts(&contents),
            Err(_) => Vec::new(),
        }
    }

    // --- background jobs -------------------------------------------------

    /// Install the sink receiving one line per finished background job.
    pub fn set_notification_sink(&self, sink: mpsc::UnboundedSender<String>) {
        self.jobs.set_notification_sink(sink);
    }

    /// Launch `cmd` in the background on the current active session.
    pub async fn bg_start(&self, cmd: &str) -> Result<u64> {
        if let Some(rule) = self.checker.check(cmd) {
            return Err(Error::command_restricted(format!(
                "command blocked by restricted mode ({})",
                rule.category.as_str()
            )));
        }
        let name = self.active_name().await;
        let session = self.get(&name).await?;
        Ok(self.jobs.start(session, &name, cmd).await)
    }

    /// Snapshot of all background jobs.
    pub async fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.jobs().await
    }

    /// Block until a job finishes, collect its output, drop the record.
    pub async fn fg(&self, id: u64) -> Option<JobRecord> {
        self.jobs.wait(id).await
    }

    /// Kill a job: record removed immediately, exit 137 reported.
    pub async fn kill(&self, id: u64) -> Option<JobRecord> {
        self.jobs.kill(id).await
    }
}

/// Extract non-pattern `Host` aliases from ssh_config text.
fn parse_ssh_config_hosts(contents: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(keyword) = tokens.next() else {
            continue;
        };
        if !keyword.eq_ignore_ascii_case("host") {
            continue;
        }
        for alias in tokens {
            if alias.contains(['*', '?', '!']) {
                continue;
            }
            if !hosts.iter().any(|h| h == alias) {
                hosts.push(alias.to_string());
            }
        }
    }
    hosts.sort();
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn manager_in(dir: &tempfile::TempDir) -> SessionManager {
        manager_with(dir, ManagerConfig::default()).await
    }

    async fn manager_with(dir: &tempfile::TempDir, config: ManagerConfig) -> SessionManager {
        let state = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
        SessionManager::new(config, state).await
    }

    mod construction {
        use super::*;

        #[tokio::test]
        async fn test_local_always_exists_and_is_active() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            assert!(manager.has(LOCAL_SESSION).await);
            assert_eq!(manager.active_name().await, LOCAL_SESSION);
        }

        #[tokio::test]
        async fn test_configured_ssh_sessions_are_created_disconnected() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = ManagerConfig::default();
            config
                .sessions
                .insert("web".into(), SshConfig::new("web.example.com", "deploy"));
            let manager = manager_with(&dir, config).await;

            assert!(manager.has("web").await);
            let session = manager.get("web").await.unwrap();
            assert_eq!(session.kind(), SessionKind::Ssh);
            assert!(!session.is_connected().await);
        }

        #[tokio::test]
        async fn test_persisted_active_is_adopted_iff_known() {
            let dir = tempfile::tempdir().unwrap();
            {
                let manager = manager_in(&dir).await;
                manager.state().set_active("ghost").unwrap();
                drop(manager);
            }
            // "ghost" is unknown, so construction falls back to local.
            let manager = manager_in(&dir).await;
            assert_eq!(manager.active_name().await, LOCAL_SESSION);
        }

        #[tokio::test]
        async fn test_cwd_restored_on_construction() {
            let dir = tempfile::tempdir().unwrap();
            let workdir = tempfile::tempdir().unwrap();
            let canonical = workdir.path().canonicalize().unwrap();
            {
                let manager = manager_in(&dir).await;
                manager
                    .execute(&format!("cd {}", workdir.path().display()))
                    .await
                    .unwrap();
            }
            let manager = manager_in(&dir).await;
            let out = manager.execute("pwd").await.unwrap();
            assert_eq!(out.stdout.trim(), canonical.display().to_string());
        }
    }

    mod dispatch {
        use super::*;

        #[tokio::test]
        async fn test_local_echo() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            let out = manager.execute("echo hello").await.unwrap();
            assert_eq!(out.stdout, "hello\n");
            assert_eq!(out.exit_code, 0);
        }

        #[tokio::test]
        async fn test_cd_persists_to_state_file() {
            let dir = tempfile::tempdir().unwrap();
            let workdir = tempfile::tempdir().unwrap();
            let canonical = workdir.path().canonicalize().unwrap();
            let manager = manager_in(&dir).await;

            let out = manager
                .execute(&format!("cd {}", workdir.path().display()))
                .await
                .unwrap();
            assert_eq!(out.exit_code, 0);

            let pwd = manager.execute("pwd").await.unwrap();
            assert_eq!(pwd.stdout.trim(), canonical.display().to_string());

            let persisted = manager.state().get_session_state(LOCAL_SESSION).unwrap();
            assert_eq!(persisted.cwd, canonical.display().to_string());
            assert!(persisted.connected);
        }

        #[tokio::test]
        async fn test_execute_on_named_session() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            let out = manager.execute_on(LOCAL_SESSION, "echo direct").await.unwrap();
            assert_eq!(out.stdout, "direct\n");
        }

        #[tokio::test]
        async fn test_execute_on_unknown_session() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            let err = manager.execute_on("ghost", "true").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::SessionNotFound);
        }

        #[tokio::test]
        async fn test_disconnected_ssh_fails_terminally_after_reconnect() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = ManagerConfig::default();
            config.reconnect_max_attempts = 1;
            config.reconnect_backoff_base = Duration::from_millis(10);
            config.connect_timeout = Duration::from_millis(500);
            let mut ssh = SshConfig::new("127.0.0.1", "nobody");
            ssh.port = 1;
            ssh.password = Some("irrelevant".into());
            config.sessions.insert("dead".into(), ssh);
            let manager = manager_with(&dir, config).await;

            let err = manager.execute_on("dead", "true").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::ConnectionFailed);
            assert!(!err.retryable);
        }
    }

    mod active_pointer {
        use super::*;

        #[tokio::test]
        async fn test_set_active_unknown_session() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            let err = manager.set_active("ghost").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::SessionNotFound);
            assert_eq!(err.session.as_deref(), Some("ghost"));
            assert_eq!(manager.active_name().await, LOCAL_SESSION);
        }

        #[tokio::test]
        async fn test_set_active_persists_immediately() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            manager
                .add("web", SshConfig::new("web.example.com", "deploy"))
                .await
                .unwrap();

            manager.set_active("web").await.unwrap();
            assert_eq!(manager.active_name().await, "web");
            assert_eq!(manager.state().get_active().as_deref(), Some("web"));
        }

        #[tokio::test]
        async fn test_set_active_does_not_connect() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            manager
                .add("web", SshConfig::new("web.example.com", "deploy"))
                .await
                .unwrap();
            manager.set_active("web").await.unwrap();

            let session = manager.get("web").await.unwrap();
            assert!(!session.is_connected().await);
        }
    }

    mod registry_management {
        use super::*;

        #[tokio::test]
        async fn test_add_duplicate_session() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            manager
                .add("web", SshConfig::new("web.example.com", "deploy"))
                .await
                .unwrap();
            let err = manager
                .add("web", SshConfig::new("other.example.com", "deploy"))
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::SessionAlreadyExists);
        }

        #[tokio::test]
        async fn test_cannot_close_local() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            let err = manager.disconnect(LOCAL_SESSION).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::CannotCloseLocal);
            let err = manager.remove(LOCAL_SESSION).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::CannotCloseLocal);
        }

        #[tokio::test]
        async fn test_remove_active_falls_back_to_local() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            manager
                .add("web", SshConfig::new("web.example.com", "deploy"))
                .await
                .unwrap();
            manager.set_active("web").await.unwrap();

            manager.remove("web").await.unwrap();
            assert_eq!(manager.active_name().await, LOCAL_SESSION);
            assert!(!manager.has("web").await);
            assert!(manager.state().get_session_state("web").is_none());
        }

        #[tokio::test]
        async fn test_list_marks_active() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            manager
                .add("web", SshConfig::new("web.example.com", "deploy"))
                .await
                .unwrap();

            let rows = manager.list().await;
            assert_eq!(rows.len(), 2);
            let local = rows.iter().find(|r| r.name == LOCAL_SESSION).unwrap();
            assert!(local.active);
            assert!(local.connected);
            let web = rows.iter().find(|r| r.name == "web").unwrap();
            assert!(!web.active);
            assert!(!web.connected);
        }
    }

    mod environment {
        use super::*;

        #[tokio::test]
        async fn test_set_session_env_applies_and_persists() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            manager.set_session_env("THOP_MANAGER_VAR", "42").await.unwrap();

            let out = manager.execute("echo $THOP_MANAGER_VAR").await.unwrap();
            assert_eq!(out.stdout, "42\n");

            let env = manager.state().get_session_env(LOCAL_SESSION);
            assert_eq!(env.get("THOP_MANAGER_VAR").map(String::as_str), Some("42"));
        }
    }

    mod restricted_mode {
        use super::*;

        fn restricted() -> ManagerConfig {
            ManagerConfig {
                restricted_mode: true,
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn test_veto_happens_before_any_side_effect() {
            let dir = tempfile::tempdir().unwrap();
            let workdir = tempfile::tempdir().unwrap();
            let manager = manager_with(&dir, restricted()).await;

            let target = workdir.path().join("victim");
            std::fs::write(&target, "data").unwrap();
            let err = manager
                .execute(&format!("rm {}", target.display()))
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::CommandRestricted);
            assert!(target.exists());
        }

        #[tokio::test]
        async fn test_sudo_is_vetoed() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_with(&dir, restricted()).await;
            let err = manager.execute("sudo ls").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::CommandRestricted);
            assert!(err.suggestion.is_some());
        }

        #[tokio::test]
        async fn test_background_jobs_are_vetoed_too() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_with(&dir, restricted()).await;
            let err = manager.bg_start("sudo true").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::CommandRestricted);
        }

        #[tokio::test]
        async fn test_default_mode_allows_everything() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            // Checker disabled by default: the command reaches the shell.
            let out = manager.execute("rm /nonexistent/thop-x 2>/dev/null; true").await.unwrap();
            assert_eq!(out.exit_code, 0);
        }
    }

    mod background_jobs {
        use super::*;

        #[tokio::test]
        async fn test_bg_start_and_collect() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            let id = manager.bg_start("echo from-job").await.unwrap();

            let record = manager.fg(id).await.unwrap();
            assert_eq!(record.stdout, "from-job\n");
            assert!(manager.jobs().await.is_empty());
        }

        #[tokio::test]
        async fn test_kill_reports_137() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            let id = manager.bg_start("sleep 10").await.unwrap();
            let record = manager.kill(id).await.unwrap();
            assert_eq!(record.exit_code, Some(137));
        }

        #[tokio::test]
        async fn test_notification_sink_receives_line() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            let (tx, mut rx) = mpsc::unbounded_channel();
            manager.set_notification_sink(tx);

            manager.bg_start("echo ping").await.unwrap();
            let line = rx.recv().await.unwrap();
            assert!(line.contains("completed"));
        }
    }

    mod prompts {
        use super::*;

        #[tokio::test]
        async fn test_prompt_names_active_session() {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_in(&dir).await;
            let prompt = manager.prompt().await;
            assert!(prompt.contains(LOCAL_SESSION));
            assert!(prompt.ends_with("$ "));
        }
    }

    mod ssh_config_parsing {
        use super::*;

        #[test]
        fn test_hosts_are_extracted_sorted() {
            let config = "\
Host web db
    HostName web.internal

# comment
Host bastion
    User ops
";
            assert_eq!(parse_ssh_config_hosts(config), vec!["bastion", "db", "web"]);
        }

        #[test]
        fn test_wildcard_patterns_are_skipped() {
            let config = "Host * staging-? !prod web\n";
            assert_eq!(parse_ssh_config_hosts(config), vec!["web"]);
        }

        #[test]
        fn test_keyword_match_is_case_insensitive() {
            assert_eq!(parse_ssh_config_hosts("host lower\nHOST upper\n"), vec![
                "lower", "upper"
            ]);
        }

        #[test]
        fn test_empty_input() {
            assert!(parse_ssh_config_hosts("").is_empty());
        }
    }
}
