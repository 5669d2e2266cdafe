//! Local shell session.
//!
//! Commands run through the configured shell as `<shell> -c <cmd>` in the
//! session's working directory, with the session environment layered over
//! the inherited process environment. `cd` is intercepted and tracked
//! in-process rather than forwarded, since a child shell's directory
//! change would be lost on exit.
//!
//! Each command runs in its own process group so that timeouts and
//! cancellation can kill the whole pipeline, not just the shell.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LocalConfig;
use crate::error::{Error, Result};
use crate::session::{CommandOutput, Session, SessionKind};

struct LocalState {
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    startup_done: bool,
}

/// The always-present session for the local machine. Born connected.
pub struct LocalSession {
    name: String,
    shell: String,
    command_timeout: Duration,
    startup_commands: Vec<String>,
    state: Mutex<LocalState>,
}

impl LocalSession {
    pub fn new(name: impl Into<String>, config: &LocalConfig, default_timeout: Duration) -> Self {
        let cwd = std::env::current_dir()
            .ok()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self {
            name: name.into(),
            shell: config.resolve_shell(),
            command_timeout: config.command_timeout.unwrap_or(default_timeout),
            startup_commands: config.startup_commands.clone(),
            state: Mutex::new(LocalState {
                cwd,
                env: BTreeMap::new(),
                startup_done: false,
            }),
        }
    }

    /// Run any configured startup commands exactly once. Failures are
    /// logged and do not abort subsequent dispatch.
    async fn ensure_startup(&self) {
        {
            let mut state = self.state.lock().await;
            if state.startup_done || self.startup_commands.is_empty() {
                state.startup_done = true;
                return;
            }
            state.startup_done = true;
        }
        let never = CancellationToken::new();
        for cmd in &self.startup_commands {
            match self.run_shell(cmd, &never).await {
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

    async fn run_shell(&self, cmd: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        let (cwd, env) = {
            let state = self.state.lock().await;
            (state.cwd.clone(), state.env.clone())
        };

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(&cwd)
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::connection_failed(format!("failed to spawn {}: {}", self.shell, e))
                .with_retryable(false)
                .with_session(self.name.clone())
        })?;
        let pgid = child.id().map(|id| id as i32);

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        enum Outcome {
            Exited(std::process::ExitStatus),
            Interrupted,
            TimedOut,
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Interrupted,
            _ = tokio::time::sleep(self.command_timeout) => Outcome::TimedOut,
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(e) => {
                    return Err(Error::connection_failed(format!("wait failed: {}", e))
                        .with_retryable(false)
                        .with_session(self.name.clone()));
                }
            },
        };

        match outcome {
            Outcome::Exited(status) => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                let exit_code = status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
                Ok(CommandOutput {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    exit_code,
                })
            }
            Outcome::Interrupted => {
                kill_process_group(pgid);
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                Ok(CommandOutput::interrupted())
            }
            Outcome::TimedOut => {
                kill_process_group(pgid);
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                Err(Error::command_timeout(format!(
                    "command timed out after {:?}",
                    self.command_timeout
                ))
                .with_session(self.name.clone()))
            }
        }
    }

    /// Track `cd` in-process. Mirrors the shell's own diagnostics so the
    /// caller cannot tell the command was intercepted.
    async fn handle_cd(&self, arg: &str) -> Result<CommandOutput> {
        let arg = arg.trim();
        let current = self.state.lock().await.cwd.clone();
        let target = resolve_cd_target(arg, &current);

        let shown = if arg.is_empty() {
            target.display().to_string()
        } else {
            arg.to_string()
        };

        let failed = |msg: &str| {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("cd: {}: {}\n", shown, msg),
                exit_code: 1,
            })
        };

        match tokio::fs::metadata(&target).await {
            Err(_) => return failed("No such file or directory"),
            Ok(meta) if !meta.is_dir() => return failed("Not a directory"),
            Ok(_) => {}
        }

        let canonical = match tokio::fs::canonicalize(&target).await {
            Ok(path) => path,
            Err(_) => return failed("No such file or directory"),
        };

        debug!(session = %self.name, cwd = %canonical.display(), "cd");
        self.state.lock().await.cwd = canonical;
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    fn resolve_path(&self, cwd: &Path, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            cwd.join(p)
        }
    }
}

fn resolve_cd_target(arg: &str, cwd: &Path) -> PathBuf {
    let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    if arg.is_empty() || arg == "~" {
        home()
    } else if let Some(rest) = arg.strip_prefix("~/") {
        home().join(rest)
    } else if Path::new(arg).is_absolute() {
        PathBuf::from(arg)
    } else {
        cwd.join(arg)
    }
}

fn kill_process_group(pgid: Option<i32>) {
    if let Some(pgid) = pgid
        && let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL)
    {
        debug!(pgid, %err, "killpg failed");
    }
}

#[async_trait]
impl Session for LocalSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Local
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // The manager refuses this earlier; the session itself has
        // nothing to tear down.
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn execute(&self, cmd: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        self.ensure_startup().await;

        let trimmed = cmd.trim();
        if trimmed == "cd" {
            return self.handle_cd("").await;
        }
        if let Some(arg) = trimmed.strip_prefix("cd ") {
            return self.handle_cd(arg).await;
        }

        self.run_shell(cmd, cancel).await
    }

    async fn execute_interactive(&self, cmd: Option<&str>) -> Result<i32> {
        self.ensure_startup().await;
        let (cwd, env) = {
            let state = self.state.lock().await;
            (state.cwd.clone(), state.env.clone())
        };

        let mut command = Command::new(&self.shell);
        if let Some(cmd) = cmd {
            command.arg("-c").arg(cmd);
        }
        command
            .current_dir(&cwd)
            .envs(env.iter())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let status = command.status().await.map_err(|e| {
            Error::connection_failed(format!("failed to spawn {}: {}", self.shell, e))
                .with_retryable(false)
                .with_session(self.name.clone())
        })?;
        Ok(status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let cwd = self.state.lock().await.cwd.clone();
        let resolved = self.resolve_path(&cwd, path);
        tokio::fs::read(&resolved).await.map_err(|e| {
            Error::connection_failed(format!("read {}: {}", resolved.display(), e))
                .with_retryable(false)
                .with_session(self.name.clone())
        })
    }

    async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let cwd = self.state.lock().await.cwd.clone();
        let resolved = self.resolve_path(&cwd, path);
        let context = |e: std::io::Error| {
            Error::connection_failed(format!("write {}: {}", resolved.display(), e))
                .with_retryable(false)
                .with_session(self.name.clone())
        };
        tokio::fs::write(&resolved, data).await.map_err(context)?;
        tokio::fs::set_permissions(&resolved, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(context)?;
        Ok(())
    }

    async fn cwd(&self) -> Option<String> {
        Some(self.state.lock().await.cwd.display().to_string())
    }

    async fn restore_cwd(&self, cwd: &str) {
        let path = PathBuf::from(cwd);
        if path.is_dir() {
            self.state.lock().await.cwd = path;
        } else {
            debug!(session = %self.name, cwd, "persisted cwd no longer exists, keeping current");
        }
    }

    async fn env(&self) -> BTreeMap<String, String> {
        self.state.lock().await.env.clone()
    }

    async fn set_env(&self, key: &str, value: &str) {
        self.state
            .lock()
            .await
            .env
            .insert(key.to_string(), value.to_string());
    }
}
