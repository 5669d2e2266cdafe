//! Password-based SSH authentication.

use async_trait::async_trait;
use russh::client;

use crate::error::{Error, Result};
use crate::session::ssh::hostkeys::ClientHandler;

use super::traits::AuthStrategy;

/// Password authentication strategy.
///
/// The password lives only in process memory and is dropped with the
/// session.
pub(crate) struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub(crate) fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| Error::auth_failed(format!("password authentication failed: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
