//! Authentication chain: ordered strategies, first success wins.

use std::path::PathBuf;

use russh::client;
use tracing::debug;

use crate::config::SshConfig;
use crate::error::{Error, Result};
use crate::session::ssh::hostkeys::ClientHandler;

use super::traits::AuthStrategy;
use super::{AgentAuth, KeyAuth, PasswordAuth};

/// Ordered collection of authentication strategies.
///
/// Strategies are tried in insertion order; the first success stops the
/// chain. An empty chain means no credentials are available at all, which
/// callers must surface *before* dialing — the defining rule is that
/// nothing in the connect path ever waits on a human.
pub(crate) struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub(crate) fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub(crate) fn with_agent(mut self) -> Self {
        self.strategies.push(Box::new(AgentAuth::new()));
        self
    }

    pub(crate) fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.strategies.push(Box::new(KeyAuth::new(key_path)));
        self
    }

    pub(crate) fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Names of the strategies in order, for logging and error messages.
    pub(crate) fn method_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run the chain to completion.
    ///
    /// Classification on failure: if every strategy was key-based the
    /// result is `AuthKeyRejected`; otherwise `AuthFailed` naming the
    /// methods tried. Authentication failures are never retryable.
    pub(crate) async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<()> {
        if self.strategies.is_empty() {
            return Err(Error::auth_password_required(
                "no authentication methods available",
            ));
        }

        let mut last_error: Option<Error> = None;
        for strategy in &self.strategies {
            debug!(strategy = strategy.name(), "trying authentication strategy");
            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!(strategy = strategy.name(), "authentication succeeded");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(strategy = strategy.name(), "authentication rejected");
                }
                Err(err) => {
                    debug!(strategy = strategy.name(), %err, "authentication errored");
                    last_error = Some(err);
                }
            }
        }

        let methods = self.method_names().join(", ");
        if self.strategies.iter().all(|s| s.name() == "key") {
            return Err(Error::auth_key_rejected(format!(
                "all offered keys were rejected for user '{}'",
                username
            ))
            .with_suggestion("check that the key is authorized on the remote host"));
        }

        Err(last_error.unwrap_or_else(|| {
            Error::auth_failed(format!(
                "all authentication methods failed (tried: {})",
                methods
            ))
            .with_suggestion("verify the credentials for this host")
        }))
    }
}

/// Assemble the chain for one session, skipping unavailable methods:
/// agent (when `SSH_AUTH_SOCK` is set), the configured identity file,
/// each default identity that exists and parses, then password.
pub(crate) fn build_chain(config: &SshConfig, password: Option<&str>) -> AuthChain {
    let mut chain = AuthChain::new();

    if AgentAuth::available() {
        chain = chain.with_agent();
    }

    if let Some(identity) = &config.identity_file {
        chain = chain.with_key(identity.clone());
    }

    if let Some(home) = dirs::home_dir() {
        for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
            let candidate = home.join(".ssh").join(name);
            if Some(&candidate) == config.identity_file.as_ref() {
                continue;
            }
            if KeyAuth::usable(&candidate) {
                chain = chain.with_key(candidate);
            }
        }
    }

    if let Some(password) = password {
        chain = chain.with_password(password);
    }

    chain
}
