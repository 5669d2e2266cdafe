//! Host-key verification against `~/.ssh/known_hosts`.
//!
//! The russh client handler consults the known-hosts file during the
//! handshake. Unknown and changed keys are both rejected — thop never
//! auto-accepts and never prompts — but the two cases surface as
//! different error kinds, because a changed key is a possible
//! man-in-the-middle and must never be retried past.
//!
//! The handler runs inside the handshake, where only a boolean verdict
//! can be returned; the [`HostKeyWitness`] records *why* a key was
//! rejected so the connect path can raise the right error afterwards.

use std::fs::{DirBuilder, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use russh::client;
use russh::keys;
use tracing::{debug, warn};

/// Why the handler rejected a server key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostKeyIssue {
    /// The host has no entry in known_hosts.
    Unknown,
    /// The host has an entry and the presented key does not match it.
    Changed,
}

/// Shared cell the handler writes its rejection reason into.
#[derive(Clone, Default)]
pub(crate) struct HostKeyWitness(Arc<Mutex<Option<HostKeyIssue>>>);

impl HostKeyWitness {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn record(&self, issue: HostKeyIssue) {
        *self.0.lock().expect("host-key witness poisoned") = Some(issue);
    }

    /// Consume the recorded issue, if any.
    pub(crate) fn take(&self) -> Option<HostKeyIssue> {
        self.0.lock().expect("host-key witness poisoned").take()
    }
}

/// Default known-hosts location.
pub(crate) fn default_known_hosts_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .join(".ssh")
        .join("known_hosts")
}

/// Make sure the known-hosts file exists with owner-only permissions.
fn ensure_known_hosts_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
    }
    if !path.exists() {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
    }
    Ok(())
}

/// russh client handler enforcing the known-hosts policy.
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: PathBuf,
    /// Bypass verification entirely. Test-only.
    accept_all: bool,
    witness: HostKeyWitness,
}

impl ClientHandler {
    pub(crate) fn new(
        host: impl Into<String>,
        port: u16,
        accept_all: bool,
        witness: HostKeyWitness,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            known_hosts: default_known_hosts_path(),
            accept_all,
            witness,
        }
    }

    fn verify(&self, key: &keys::PublicKey) -> bool {
        if self.accept_all {
            warn!(host = %self.host, "host-key verification skipped (insecure)");
            return true;
        }

        if let Err(err) = ensure_known_hosts_file(&self.known_hosts) {
            warn!(path = %self.known_hosts.display(), %err, "cannot prepare known_hosts");
            self.witness.record(HostKeyIssue::Unknown);
            return false;
        }

        match keys::check_known_hosts_path(&self.host, self.port, key, &self.known_hosts) {
            Ok(true) => {
                debug!(host = %self.host, "host key verified against known_hosts");
                true
            }
            Ok(false) => {
                self.witness.record(HostKeyIssue::Unknown);
                false
            }
            Err(keys::Error::KeyChanged { line }) => {
                warn!(host = %self.host, line, "host key CHANGED from the known_hosts entry");
                self.witness.record(HostKeyIssue::Changed);
                false
            }
            Err(err) => {
                warn!(host = %self.host, %err, "known_hosts check failed");
                self.witness.record(HostKeyIssue::Unknown);
                false
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.verify(server_public_key))
    }
}
