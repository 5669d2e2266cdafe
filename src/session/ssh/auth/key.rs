//! Private key file SSH authentication.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::error::{Error, Result};
use crate::session::ssh::hostkeys::ClientHandler;

use super::traits::AuthStrategy;

/// Private key file authentication strategy.
///
/// Loads the key at authentication time; passphrase-protected keys are
/// not decrypted (that would require a prompt) and surface as errors.
pub(crate) struct KeyAuth {
    key_path: PathBuf,
}

impl KeyAuth {
    pub(crate) fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }

    /// Whether the file at `path` exists and parses as a private key.
    /// Used to filter the default identity candidates.
    pub(crate) fn usable(path: &Path) -> bool {
        path.exists() && keys::load_secret_key(path, None).is_ok()
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let key_pair = keys::load_secret_key(&self.key_path, None).map_err(|e| {
            Error::auth_key_rejected(format!(
                "failed to load private key {}: {}",
                self.key_path.display(),
                e
            ))
        })?;

        // RSA keys need the best hash the server supports, or it may
        // reject a legacy ssh-rsa (SHA1) signature.
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!(key = %self.key_path.display(), ?hash_alg, "trying key authentication");

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| Error::auth_key_rejected(format!("key authentication failed: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_auth_name() {
        let auth = KeyAuth::new("/path/to/key");
        assert_eq!(auth.name(), "key");
    }

    #[test]
    fn test_key_auth_keeps_path() {
        let auth = KeyAuth::new("/home/user/.ssh/id_ed25519");
        assert_eq!(auth.key_path, PathBuf::from("/home/user/.ssh/id_ed25519"));
    }

    #[test]
    fn test_missing_file_is_not_usable() {
        assert!(!KeyAuth::usable(Path::new("/nonexistent/thop-key")));
    }

    #[test]
    fn test_garbage_file_is_not_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-key");
        std::fs::write(&path, "definitely not PEM").unwrap();
        assert!(!KeyAuth::usable(&path));
    }
}
