//! SSH agent authentication.

use async_trait::async_trait;
use russh::{client, keys};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::ssh::hostkeys::ClientHandler;

use super::traits::AuthStrategy;

/// SSH agent authentication strategy.
///
/// Connects to the agent named by `SSH_AUTH_SOCK` and tries each offered
/// identity until one succeeds.
pub(crate) struct AgentAuth;

impl AgentAuth {
    pub(crate) fn new() -> Self {
        Self
    }

    /// Whether an agent socket is advertised in the environment.
    pub(crate) fn available() -> bool {
        std::env::var("SSH_AUTH_SOCK").is_ok_and(|v| !v.is_empty())
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| Error::auth_failed(format!("failed to connect to SSH agent: {}", e)))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| Error::auth_failed(format!("failed to list agent identities: {}", e)))?;

        if identities.is_empty() {
            return Ok(false);
        }

        for identity in identities {
            debug!(comment = ?identity.comment(), "trying SSH agent identity");

            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    info!("authenticated via SSH agent");
                    return Ok(true);
                }
                Ok(_) => {
                    debug!("agent identity not accepted, trying next");
                }
                Err(e) => {
                    debug!(%e, "agent identity errored, trying next");
                }
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}
