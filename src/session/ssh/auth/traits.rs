//! Authentication strategy trait.

use async_trait::async_trait;
use russh::client;

use crate::error::Result;
use crate::session::ssh::hostkeys::ClientHandler;

/// One SSH authentication method.
///
/// Implementations must be thread-safe (`Send + Sync`). A strategy never
/// blocks on user input: whatever material it has at call time either
/// works or it does not.
#[async_trait]
pub(crate) trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate.
    ///
    /// * `Ok(true)` — authentication succeeded
    /// * `Ok(false)` — the server rejected this method's credentials
    /// * `Err(_)` — the attempt itself failed (agent unreachable, key
    ///   unreadable, transport error)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool>;

    /// Short name for logging.
    fn name(&self) -> &'static str;
}
