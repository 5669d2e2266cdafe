//! Jump-host (bastion) dialing.
//!
//! A session configured with a jump host first establishes a full SSH
//! client to the intermediary — same auth chain, same host-key policy —
//! then opens a `direct-tcpip` channel through it to the target and runs
//! the target handshake over that stream. The jump client is owned by the
//! target session and closed with it.

use russh::client;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::ssh::hostkeys::ClientHandler;

/// Parsed `[user@]host[:port]` jump specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JumpSpec {
    pub user: String,
    pub host: String,
    pub port: u16,
}

/// Parse a jump spec. A missing user inherits the target's user; a
/// missing or unparseable port falls back to 22.
pub(crate) fn parse_jump_spec(spec: &str, inherited_user: &str) -> JumpSpec {
    let (user, rest) = match spec.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
        Some((_, rest)) => (inherited_user.to_string(), rest),
        None => (inherited_user.to_string(), spec),
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str.parse::<u16>().unwrap_or_else(|_| {
                warn!(spec, port = port_str, "invalid jump port, falling back to 22");
                22
            });
            (host.to_string(), port)
        }
        None => (rest.to_string(), 22),
    };

    JumpSpec { user, host, port }
}

/// Open a tunneled TCP stream from an authenticated jump client to the
/// target. The returned stream carries the target's SSH handshake.
pub(crate) async fn open_tunnel(
    jump: &client::Handle<ClientHandler>,
    jump_host: &str,
    target_host: &str,
    target_port: u16,
) -> Result<russh::ChannelStream<client::Msg>> {
    debug!(jump_host, target_host, target_port, "opening direct-tcpip tunnel");
    let channel = jump
        .channel_open_direct_tcpip(target_host, u32::from(target_port), "127.0.0.1", 0)
        .await
        .map_err(|e| {
            Error::connection_failed(format!(
                "failed to tunnel to {}:{} through {}: {}",
                target_host, target_port, jump_host, e
            ))
            .with_host(jump_host.to_string())
        })?;
    Ok(channel.into_stream())
}
