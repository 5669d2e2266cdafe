//! Persistent SSH session.
//!
//! One long-lived russh client per session, kept alive by protocol
//! keepalives, with a fresh channel per command. The connect path never
//! prompts: the auth chain is assembled from whatever material exists
//! (agent, identity files, password) and an empty chain fails
//! immediately; host keys are checked against `known_hosts` and never
//! auto-accepted.
//!
//! # Command dispatch
//!
//! Every buffered command is sent as a single exec with a composed
//! prefix: exported terminal variables, the session environment
//! (shell-escaped), and a `cd` into the cached working directory. `cd`
//! itself is intercepted and resolved remotely via `cd <target> && pwd`
//! so the cached cwd always holds what the remote shell actually
//! canonicalized.
//!
//! Completion is raced against the caller's cancellation token (SIGINT on
//! the channel, a short grace, then close) and the command timeout
//! (channel closed, `CommandTimeout` raised).

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, Sig, client};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SshConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::session::{CommandOutput, Session, SessionKind};

pub(crate) mod auth;
pub(crate) mod hostkeys;
pub(crate) mod interactive;
pub(crate) mod jump;
pub(crate) mod sftp;

use hostkeys::{ClientHandler, HostKeyIssue, HostKeyWitness};

/// Keepalive cadence for persistent clients.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Grace between SIGINT and channel close on cancellation.
const INTERRUPT_GRACE: Duration = Duration::from_millis(100);

struct Clients {
    handle: Option<Arc<client::Handle<ClientHandler>>>,
    /// Jump client, owned by this session and closed with it.
    jump: Option<Arc<client::Handle<ClientHandler>>>,
}

/// A named session on one remote host. Born disconnected.
pub struct SshSession {
    name: String,
    config: SshConfig,
    /// Resolved once at construction; in-memory only.
    password: Option<String>,
    command_timeout: Duration,
    connect_timeout: Duration,
    clients: Mutex<Clients>,
    connected: AtomicBool,
    cwd: Mutex<Option<String>>,
    env: Mutex<BTreeMap<String, String>>,
}

impl SshSession {
    pub fn new(
        name: impl Into<String>,
        config: SshConfig,
        default_command_timeout: Duration,
        default_connect_timeout: Duration,
    ) -> Self {
        let password = config.resolve_password();
        Self {
            name: name.into(),
            command_timeout: config.command_timeout.unwrap_or(default_command_timeout),
            connect_timeout: config.connect_timeout.unwrap_or(default_connect_timeout),
            config,
            password,
            clients: Mutex::new(Clients {
                handle: None,
                jump: None,
            }),
            connected: AtomicBool::new(false),
            cwd: Mutex::new(None),
            env: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    fn client_config() -> Arc<client::Config> {
        Arc::new(client::Config {
            // Persistent sessions: no inactivity timeout, keepalives
            // carry the liveness check instead.
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..Default::default()
        })
    }

    fn disconnected_error(&self) -> Error {
        Error::session_disconnected(format!("session '{}' is not connected", self.name))
            .with_session(self.name.clone())
            .with_host(self.config.host.clone())
    }

    async fn current_handle(&self) -> Result<Arc<client::Handle<ClientHandler>>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(self.disconnected_error());
        }
        let clients = self.clients.lock().await;
        match &clients.handle {
            Some(handle) if !handle.is_closed() => Ok(handle.clone()),
            _ => Err(self.disconnected_error()),
        }
    }

    /// Dial and authenticate one host, directly or over a provided
    /// stream. Returns the authenticated handle.
    async fn dial_direct(
        &self,
        host: &str,
        port: u16,
        user: &str,
    ) -> Result<client::Handle<ClientHandler>> {
        let chain = auth::build_chain(&self.config, self.password.as_deref());
        if chain.is_empty() {
            return Err(Error::auth_password_required(format!(
                "no credentials available for {}@{}",
                user, host
            ))
            .with_session(self.name.clone())
            .with_host(host.to_string()));
        }

        let witness = HostKeyWitness::new();
        let handler = ClientHandler::new(
            host,
            port,
            self.config.insecure_skip_hostkey,
            witness.clone(),
        );

        let dial = client::connect(Self::client_config(), (host, port), handler);
        let mut handle = tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| {
                Error::connection_timeout(format!(
                    "connection to {}:{} timed out after {:?}",
                    host, port, self.connect_timeout
                ))
                .with_session(self.name.clone())
                .with_host(host.to_string())
            })?
            .map_err(|e| self.classify_dial_error(e, &witness, host))?;

        debug!(host, methods = ?chain.method_names(), "authenticating");
        chain
            .authenticate(&mut handle, user)
            .await
            .map_err(|e| e.with_session(self.name.clone()).with_host(host.to_string()))?;
        Ok(handle)
    }

    /// Classify a failed dial into the structured taxonomy. Host-key
    /// rejections recorded by the handler take priority; everything else
    /// is classified from the error text, the way transient errors are
    /// usually told apart from permanent ones.
    fn classify_dial_error(
        &self,
        err: russh::Error,
        witness: &HostKeyWitness,
        host: &str,
    ) -> Error {
        if let Some(issue) = witness.take() {
            let err = match issue {
                HostKeyIssue::Changed => Error::host_key_changed(format!(
                    "host key for {} has CHANGED; possible man-in-the-middle",
                    host
                )),
                HostKeyIssue::Unknown => Error::host_key_verification_failed(format!(
                    "host key for {} is not in known_hosts",
                    host
                )),
            };
            return err
                .with_session(self.name.clone())
                .with_host(host.to_string());
        }

        let message = err.to_string();
        let lower = message.to_lowercase();
        let classified = if lower.contains("connection refused") {
            Error::connection_refused(format!("connection to {} refused", host))
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Error::connection_timeout(format!("connection to {} timed out", host))
        } else {
            Error::connection_failed(format!("failed to connect to {}: {}", host, message))
        };
        classified
            .with_session(self.name.clone())
            .with_host(host.to_string())
    }

    async fn store_clients(
        &self,
        handle: Arc<client::Handle<ClientHandler>>,
        jump: Option<Arc<client::Handle<ClientHandler>>>,
    ) {
        let mut clients = self.clients.lock().await;
        clients.handle = Some(handle);
        clients.jump = jump;
    }

    /// Run the startup commands; failures are logged, never fatal.
    async fn run_startup_commands(&self, handle: &client::Handle<ClientHandler>) {
        let never = CancellationToken::new();
        for cmd in &self.config.startup_commands {
            let full = self.compose(cmd).await;
            match run_channel_command(
                handle,
                &full,
                self.command_timeout,
                &never,
                self.config.agent_forwarding,
            )
            .await
            {
                Ok(out) if out.exit_code != 0 => {
                    warn!(session = %self.name, command = %cmd, exit = out.exit_code,
                        "startup command failed");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(session = %self.name, command = %cmd, %err, "startup command errored");
                }
            }
        }
    }

    /// Compose the full remote command line: exported terminal variables,
    /// session environment, `cd` into the cached cwd, then the command.
    async fn compose(&self, cmd: &str) -> String {
        let env = self.env.lock().await.clone();
        let cwd = self.cwd.lock().await.clone();
        compose_command_line(&passthrough_env(), &env, cwd.as_deref(), cmd)
    }

    async fn execute_cd(&self, target: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        let handle = self.current_handle().await?;
        let target = if target.trim().is_empty() {
            "~"
        } else {
            target.trim()
        };
        let cwd = self.cwd.lock().await.clone();
        let probe = build_cd_probe(target, cwd.as_deref());

        let out = run_channel_command(
            &handle,
            &probe,
            self.command_timeout,
            cancel,
            self.config.agent_forwarding,
        )
        .await?;

        if out.exit_code == 0 {
            if let Some(new_cwd) = out.stdout.lines().last() {
                let new_cwd = new_cwd.trim();
                if !new_cwd.is_empty() {
                    debug!(session = %self.name, cwd = new_cwd, "remote cd");
                    *self.cwd.lock().await = Some(new_cwd.to_string());
                }
            }
            // The trailing `pwd` is an implementation detail; the caller
            // asked for a silent cd.
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: out.stderr,
                exit_code: 0,
            })
        } else {
            Ok(out)
        }
    }

    fn mark_disconnected_on_channel_failure(&self, err: &Error) {
        if err.kind == ErrorKind::SessionDisconnected {
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}

/// Terminal-related process variables forwarded to every remote command.
fn passthrough_env() -> Vec<(String, String)> {
    ["TERM", "CLICOLOR", "CLICOLOR_FORCE"]
        .iter()
        .filter_map(|var| {
            std::env::var(var)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (var.to_string(), v))
        })
        .collect()
}

fn escape(value: &str) -> String {
    shell_escape::escape(Cow::Borrowed(value)).into_owned()
}

/// Build the composed command line sent over the exec channel.
fn compose_command_line(
    passthrough: &[(String, String)],
    session_env: &BTreeMap<String, String>,
    cwd: Option<&str>,
    cmd: &str,
) -> String {
    let mut line = String::new();
    for (key, value) in passthrough {
        line.push_str(&format!("export {}={}; ", key, escape(value)));
    }
    for (key, value) in session_env {
        line.push_str(&format!("export {}={}; ", key, escape(value)));
    }
    if let Some(cwd) = cwd {
        line.push_str(&format!("cd {} && ", escape(cwd)));
    }
    line.push_str(cmd);
    line
}

/// Build the remote probe for a `cd`.
///
/// An absolute target stands on its own; a relative one is anchored by a
/// leading `cd` into the prior cwd first, so the remote shell performs
/// the join and reports the canonical result.
fn build_cd_probe(target: &str, cwd: Option<&str>) -> String {
    if target.starts_with('/') {
        format!("cd {} && pwd", target)
    } else if let Some(cwd) = cwd {
        format!("cd {} && cd {} && pwd", escape(cwd), target)
    } else {
        format!("cd {} && pwd", target)
    }
}

/// Execute one command on a fresh channel of the persistent client.
///
/// Completion is raced against the cancellation token and the timeout.
/// On cancellation: SIGINT on the channel, a 100 ms grace, close, and an
/// exit-130 result. On timeout: close and `CommandTimeout`. The remote
/// exit status is otherwise preserved verbatim.
pub(crate) async fn run_channel_command(
    handle: &client::Handle<ClientHandler>,
    command: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    agent_forward: bool,
) -> Result<CommandOutput> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| Error::session_disconnected(format!("failed to open channel: {}", e)))?;

    if agent_forward
        && let Err(err) = channel.agent_forward(true).await
    {
        debug!(%err, "agent forwarding request failed");
    }

    channel
        .exec(true, command)
        .await
        .map_err(|e| Error::session_disconnected(format!("failed to send exec: {}", e)))?;

    let mut stdout: Vec<u8> = Vec::new();
    let mut stderr: Vec<u8> = Vec::new();
    let mut exit_code: Option<i32> = None;
    let deadline = Instant::now() + timeout;

    enum Outcome {
        Finished,
        Interrupted,
        TimedOut,
    }

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Outcome::Interrupted,
            _ = tokio::time::sleep_until(deadline) => break Outcome::TimedOut,
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    // ext == 1 is stderr in the SSH protocol
                    if ext == 1 {
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(exit_status as i32);
                }
                Some(ChannelMsg::Eof) => {
                    if exit_code.is_some() {
                        break Outcome::Finished;
                    }
                }
                Some(ChannelMsg::Close) | None => break Outcome::Finished,
                Some(_) => {}
            },
        }
    };

    match outcome {
        Outcome::Finished => {
            let _ = channel.close().await;
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code: exit_code.unwrap_or(-1),
            })
        }
        Outcome::Interrupted => {
            let _ = channel.signal(Sig::INT).await;
            tokio::time::sleep(INTERRUPT_GRACE).await;
            let _ = channel.close().await;
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                ..CommandOutput::interrupted()
            })
        }
        Outcome::TimedOut => {
            let _ = channel.close().await;
            Err(Error::command_timeout(format!(
                "command timed out after {:?}",
                timeout
            )))
        }
    }
}

#[async_trait]
impl Session for SshSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Ssh
    }

    async fn connect(&self) -> Result<()> {
        // Close any residual client before dialing anew.
        self.connected.store(false, Ordering::SeqCst);
        {
            let mut clients = self.clients.lock().await;
            clients.handle = None;
            clients.jump = None;
        }

        let (handle, jump_handle) = if let Some(spec) = &self.config.jump_host {
            let spec = jump::parse_jump_spec(spec, &self.config.user);
            info!(session = %self.name, jump = %spec.host, target = %self.config.host,
                "connecting via jump host");
            let jump_handle = self
                .dial_direct(&spec.host, spec.port, &spec.user)
                .await
                .map_err(|e| match e.kind {
                    // The jump itself failing to dial is reported as a
                    // plain connection failure against the jump host.
                    ErrorKind::ConnectionRefused | ErrorKind::ConnectionTimeout => {
                        Error::connection_failed(e.message.clone())
                            .with_session(self.name.clone())
                            .with_host(spec.host.clone())
                    }
                    _ => e,
                })?;

            let stream =
                jump::open_tunnel(&jump_handle, &spec.host, &self.config.host, self.config.port)
                    .await?;

            let witness = HostKeyWitness::new();
            let handler = ClientHandler::new(
                &self.config.host,
                self.config.port,
                self.config.insecure_skip_hostkey,
                witness.clone(),
            );
            let handshake = client::connect_stream(Self::client_config(), stream, handler);
            let mut handle = tokio::time::timeout(self.connect_timeout, handshake)
                .await
                .map_err(|_| {
                    Error::connection_timeout(format!(
                        "handshake with {} through {} timed out",
                        self.config.host, spec.host
                    ))
                    .with_session(self.name.clone())
                    .with_host(self.config.host.clone())
                })?
                .map_err(|e| self.classify_dial_error(e, &witness, &self.config.host))?;

            let chain = auth::build_chain(&self.config, self.password.as_deref());
            chain
                .authenticate(&mut handle, &self.config.user)
                .await
                .map_err(|e| {
                    e.with_session(self.name.clone())
                        .with_host(self.config.host.clone())
                })?;
            // A target-side failure above drops both handles, which tears
            // the tunnel and the jump connection down.
            (handle, Some(Arc::new(jump_handle)))
        } else {
            let handle = self
                .dial_direct(&self.config.host, self.config.port, &self.config.user)
                .await?;
            (handle, None)
        };

        let handle = Arc::new(handle);
        self.store_clients(handle.clone(), jump_handle).await;
        self.connected.store(true, Ordering::SeqCst);
        info!(session = %self.name, host = %self.config.host, "connected");

        // Seed the cwd from the remote on a first connect; a reconnect
        // keeps the previously observed directory.
        let needs_cwd = self.cwd.lock().await.is_none();
        if needs_cwd {
            let initial = match run_channel_command(
                &handle,
                "pwd",
                self.command_timeout,
                &CancellationToken::new(),
                false,
            )
            .await
            {
                Ok(out) if out.exit_code == 0 && !out.stdout.trim().is_empty() => {
                    out.stdout.trim().to_string()
                }
                _ => "~".to_string(),
            };
            *self.cwd.lock().await = Some(initial);
        }

        self.run_startup_commands(&handle).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut clients = self.clients.lock().await;
        if let Some(handle) = clients.handle.take() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }
        if let Some(jump) = clients.jump.take() {
            let _ = jump
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }
        info!(session = %self.name, "disconnected");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let clients = self.clients.lock().await;
        clients.handle.as_ref().is_some_and(|h| !h.is_closed())
    }

    async fn execute(&self, cmd: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        let trimmed = cmd.trim();
        if trimmed == "cd" {
            return self.execute_cd("", cancel).await;
        }
        if let Some(target) = trimmed.strip_prefix("cd ") {
            return self.execute_cd(target, cancel).await;
        }

        let handle = self.current_handle().await?;
        let full = self.compose(cmd).await;
        let result = run_channel_command(
            &handle,
            &full,
            self.command_timeout,
            cancel,
            self.config.agent_forwarding,
        )
        .await;

        match result {
            Ok(out) => Ok(out),
            Err(err) => {
                self.mark_disconnected_on_channel_failure(&err);
                Err(err
                    .with_session(self.name.clone())
                    .with_host(self.config.host.clone()))
            }
        }
    }

    async fn execute_interactive(&self, cmd: Option<&str>) -> Result<i32> {
        let handle = self.current_handle().await?;
        let composed = match cmd {
            Some(cmd) => Some(self.compose(cmd).await),
            None => None,
        };
        interactive::run_interactive(&handle, composed.as_deref())
            .await
            .map_err(|e| {
                self.mark_disconnected_on_channel_failure(&e);
                e.with_session(self.name.clone())
                    .with_host(self.config.host.clone())
            })
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let handle = self.current_handle().await?;
        sftp::read_file(&handle, path)
            .await
            .map_err(|e| e.with_session(self.name.clone()))
    }

    async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        let handle = self.current_handle().await?;
        sftp::write_file(&handle, path, data, mode)
            .await
            .map_err(|e| e.with_session(self.name.clone()))
    }

    async fn cwd(&self) -> Option<String> {
        self.cwd.lock().await.clone()
    }

    async fn restore_cwd(&self, cwd: &str) {
        // The remote cannot be consulted while disconnected; trust the
        // persisted value and let the next cd correct it.
        *self.cwd.lock().await = Some(cwd.to_string());
    }

    async fn env(&self) -> BTreeMap<String, String> {
        self.env.lock().await.clone()
    }

    async fn set_env(&self, key: &str, value: &str) {
        self.env
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
    }
}

impl SshSession {
    /// Upload a local file to the remote session, preserving its mode.
    pub async fn upload_file(&self, local: &std::path::Path, remote: &str) -> Result<()> {
        let handle = self.current_handle().await?;
        sftp::upload_file(&handle, local, remote)
            .await
            .map_err(|e| e.with_session(self.name.clone()))
    }

    /// Download a remote file to the local filesystem.
    pub async fn download_file(&self, remote: &str, local: &std::path::Path) -> Result<()> {
        let handle = self.current_handle().await?;
        sftp::download_file(&handle, remote, local)
            .await
            .map_err(|e| e.with_session(self.name.clone()))
    }
}
