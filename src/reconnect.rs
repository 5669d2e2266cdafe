//! Reconnection with exponential backoff and environment replay.
//!
//! The manager hands a session here when a dispatch fails with a
//! retryable connection-loss error. Attempts follow an exponential
//! schedule — the k-th retry sleeps `base * 2^(k-1)` — up to the
//! configured attempt limit, with no jitter so the schedule is exactly
//! reproducible.
//!
//! After a successful reconnect, every environment variable persisted for
//! the session is replayed through `set_env`, so `export`-style state set
//! before the drop is visible to the next command.
//!
//! Reconnection never starts once the caller's cancellation token has
//! fired: a user who interrupted a command does not want the runtime
//! spending further seconds dialing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::session::Session;
use crate::state::StateStore;

/// Re-establish a dropped session, replaying persisted env on success.
pub(crate) async fn reconnect_session(
    name: &str,
    session: &Arc<dyn Session>,
    state: &StateStore,
    max_attempts: u32,
    backoff_base: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::command_interrupted("reconnect aborted by caller")
            .with_session(name.to_string()));
    }

    let attempts = max_attempts.max(1);
    let attempt_counter = AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(backoff_base)
        .with_factor(2.0)
        .with_max_times(attempts as usize - 1);

    let result = (|| async {
        if cancel.is_cancelled() {
            return Err(Error::command_interrupted("reconnect aborted by caller"));
        }
        let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > 1 {
            warn!(session = name, attempt, "reconnect attempt");
        }
        // Drop any residual client before dialing anew.
        let _ = session.disconnect().await;
        session.connect().await
    })
    .retry(backoff)
    .when(|err: &Error| err.retryable && err.kind != ErrorKind::CommandInterrupted)
    .notify(|err, dur| {
        warn!(session = name, %err, "reconnect failed, retrying in {:?}", dur);
    })
    .await;

    match result {
        Ok(()) => {
            let env = state.get_session_env(name);
            for (key, value) in &env {
                session.set_env(key, value).await;
            }
            info!(
                session = name,
                attempts = attempt_counter.load(Ordering::SeqCst),
                replayed_env = env.len(),
                "reconnected"
            );
            Ok(())
        }
        Err(err) if err.kind == ErrorKind::CommandInterrupted => Err(err),
        Err(err) => {
            let total = attempt_counter.load(Ordering::SeqCst);
            Err(Error::connection_failed(format!(
                "reconnect failed after {} attempt(s): {}",
                total, err
            ))
            .with_retryable(false)
            .with_session(name.to_string()))
        }
    }
}
