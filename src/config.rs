//! Configuration inputs for the session runtime.
//!
//! The TOML configuration file and its parser live with the CLI
//! collaborator; this module defines the plain structs it hands to
//! [`SessionManager::new`](crate::manager::SessionManager::new), the
//! built-in defaults, and the password resolution chain for SSH sessions.
//!
//! # Password resolution
//!
//! An SSH session's effective password is resolved once, at construction,
//! with this priority:
//!
//! 1. **Explicit value** — the `password` field itself (highest priority)
//! 2. **Environment variable** — the variable named by `password_env`,
//!    if set and non-empty
//! 3. **Password file** — the contents of `password_file`, only accepted
//!    when the file is readable by the owner alone (mode 0600 or
//!    stricter); looser permissions are refused with a warning
//!
//! Passwords are held in process memory only and never persisted.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

/// Default per-command execution timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 180;

/// Default SSH connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default maximum reconnect attempts
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 3;

/// Default reconnect backoff base in seconds
pub const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 2;

/// Fallback shell when neither the config nor `$SHELL` provides one
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Runtime-wide settings handed to the manager at construction.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-command timeout applied by every session unless overridden.
    pub command_timeout: Duration,
    /// SSH connection establishment timeout.
    pub connect_timeout: Duration,
    /// Maximum attempts the reconnect engine makes.
    pub reconnect_max_attempts: u32,
    /// Base delay of the reconnect engine's exponential backoff.
    pub reconnect_backoff_base: Duration,
    /// Whether the restriction checker vetoes destructive commands.
    pub restricted_mode: bool,
    /// Settings for the always-present `local` session.
    pub local: LocalConfig,
    /// Named SSH sessions created at startup.
    pub sessions: BTreeMap<String, SshConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            reconnect_backoff_base: Duration::from_secs(DEFAULT_RECONNECT_BACKOFF_SECS),
            restricted_mode: false,
            local: LocalConfig::default(),
            sessions: BTreeMap::new(),
        }
    }
}

/// Settings for the local shell session.
#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    /// Shell used for `<shell> -c <cmd>`; `$SHELL` then `/bin/sh` if unset.
    pub shell: Option<String>,
    /// Commands run once, in order, at the first dispatch.
    pub startup_commands: Vec<String>,
    /// Per-command timeout override.
    pub command_timeout: Option<Duration>,
}

impl LocalConfig {
    /// Resolve the shell binary: config, then `$SHELL`, then `/bin/sh`.
    pub fn resolve_shell(&self) -> String {
        if let Some(shell) = &self.shell
            && !shell.is_empty()
        {
            return shell.clone();
        }
        if let Ok(shell) = std::env::var("SHELL")
            && !shell.is_empty()
        {
            return shell;
        }
        FALLBACK_SHELL.to_string()
    }
}

/// Settings for one SSH session.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    /// SSH port, 22 unless configured otherwise.
    pub port: u16,
    pub user: String,
    /// Explicit private key to try before the default identities.
    pub identity_file: Option<PathBuf>,
    /// Explicit password (highest priority; in-memory only).
    pub password: Option<String>,
    /// Environment variable consulted when no explicit password is set.
    pub password_env: Option<String>,
    /// File consulted last; refused unless its mode is 0600 or stricter.
    pub password_file: Option<PathBuf>,
    /// `[user@]host[:port]` of an intermediary to dial through.
    pub jump_host: Option<String>,
    /// Request agent forwarding on exec channels.
    pub agent_forwarding: bool,
    /// Skip host-key verification. Test-only; never set in production.
    pub insecure_skip_hostkey: bool,
    /// Commands run once, in order, after a successful connect.
    pub startup_commands: Vec<String>,
    /// Per-command timeout override.
    pub command_timeout: Option<Duration>,
    /// Connection timeout override.
    pub connect_timeout: Option<Duration>,
}

impl SshConfig {
    /// Minimal config for `user@host:22`.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            identity_file: None,
            password: None,
            password_env: None,
            password_file: None,
            jump_host: None,
            agent_forwarding: false,
            insecure_skip_hostkey: false,
            startup_commands: Vec::new(),
            command_timeout: None,
            connect_timeout: None,
        }
    }

    /// Resolve the effective password: explicit value, then environment
    /// variable, then a 0600-or-stricter password file.
    ///
    /// Returns `None` when no source yields a usable password. Never
    /// prompts.
    pub fn resolve_password(&self) -> Option<String> {
        if let Some(password) = &self.password
            && !password.is_empty()
        {
            return Some(password.clone());
        }

        if let Some(var) = &self.password_env
            && let Ok(value) = std::env::var(var)
            && !value.is_empty()
        {
            debug!("using password from environment variable {}", var);
            return Some(value);
        }

        if let Some(path) = &self.password_file {
            return read_password_file(path);
        }

        None
    }
}

/// Read a password file, enforcing owner-only permissions.
///
/// Any group or other permission bits cause the file to be refused — a
/// world-readable password file is worse than no password at all.
fn read_password_file(path: &std::path::Path) -> Option<String> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(err) => {
            warn!("password file {} unreadable: {}", path.display(), err);
            return None;
        }
    };

    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        warn!(
            "password file {} has mode {:o}; refusing (must be 0600 or stricter)",
            path.display(),
            mode
        );
        return None;
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(err) => {
            warn!("failed to read password file {}: {}", path.display(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_password_file(dir: &tempfile::TempDir, mode: u32, contents: &str) -> PathBuf {
        let path = dir.path().join("passwd");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    mod password_resolution {
        use super::*;

        #[test]
        fn test_explicit_password_wins() {
            let mut config = SshConfig::new("h", "u");
            config.password = Some("explicit".into());
            config.password_env = Some("THOP_TEST_UNSET_VAR".into());
            assert_eq!(config.resolve_password().as_deref(), Some("explicit"));
        }

        #[test]
        fn test_no_sources_yields_none() {
            let config = SshConfig::new("h", "u");
            assert_eq!(config.resolve_password(), None);
        }

        #[test]
        fn test_password_file_0600_is_accepted() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_password_file(&dir, 0o600, "hunter2\n");
            let mut config = SshConfig::new("h", "u");
            config.password_file = Some(path);
            assert_eq!(config.resolve_password().as_deref(), Some("hunter2"));
        }

        #[test]
        fn test_password_file_0400_is_accepted() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_password_file(&dir, 0o400, "s3cret");
            let mut config = SshConfig::new("h", "u");
            config.password_file = Some(path);
            assert_eq!(config.resolve_password().as_deref(), Some("s3cret"));
        }

        #[test]
        fn test_password_file_group_readable_is_refused() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_password_file(&dir, 0o640, "leaky");
            let mut config = SshConfig::new("h", "u");
            config.password_file = Some(path);
            assert_eq!(config.resolve_password(), None);
        }

        #[test]
        fn test_password_file_world_readable_is_refused() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_password_file(&dir, 0o644, "leaky");
            let mut config = SshConfig::new("h", "u");
            config.password_file = Some(path);
            assert_eq!(config.resolve_password(), None);
        }

        #[test]
        fn test_password_file_whitespace_is_trimmed() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_password_file(&dir, 0o600, "  padded  \n");
            let mut config = SshConfig::new("h", "u");
            config.password_file = Some(path);
            assert_eq!(config.resolve_password().as_deref(), Some("padded"));
        }

        #[test]
        fn test_missing_password_file_yields_none() {
            let mut config = SshConfig::new("h", "u");
            config.password_file = Some(PathBuf::from("/nonexistent/thop-passwd"));
            assert_eq!(config.resolve_password(), None);
        }

        #[test]
        fn test_empty_password_file_yields_none() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_password_file(&dir, 0o600, "   \n");
            let mut config = SshConfig::new("h", "u");
            config.password_file = Some(path);
            assert_eq!(config.resolve_password(), None);
        }
    }

    mod defaults {
        use super::*;

        #[test]
        fn test_manager_defaults() {
            let config = ManagerConfig::default();
            assert_eq!(config.command_timeout, Duration::from_secs(180));
            assert_eq!(config.connect_timeout, Duration::from_secs(30));
            assert_eq!(config.reconnect_max_attempts, 3);
            assert_eq!(config.reconnect_backoff_base, Duration::from_secs(2));
            assert!(!config.restricted_mode);
            assert!(config.sessions.is_empty());
        }

        #[test]
        fn test_ssh_config_default_port() {
            let config = SshConfig::new("example.com", "deploy");
            assert_eq!(config.port, 22);
            assert!(!config.agent_forwarding);
            assert!(!config.insecure_skip_hostkey);
        }

        #[test]
        fn test_local_shell_falls_back() {
            let config = LocalConfig {
                shell: Some(String::new()),
                ..Default::default()
            };
            // Empty configured shell falls through to $SHELL or /bin/sh.
            let shell = config.resolve_shell();
            assert!(!shell.is_empty());
        }

        #[test]
        fn test_local_shell_explicit() {
            let config = LocalConfig {
                shell: Some("/bin/bash".into()),
                ..Default::default()
            };
            assert_eq!(config.resolve_shell(), "/bin/bash");
        }
    }
}
