//! Interactive PTY execution.
//!
//! Full-screen and interactive remote programs (`vim`, `top`, login
//! shells) need a PTY on the remote side and a raw local terminal. The
//! controlling TTY is put into raw mode for the duration — restored on
//! every exit path by a drop guard, including panics — and window
//! resizes are forwarded to the remote PTY.
//!
//! Only `SIGWINCH` is intercepted. `^C` is *not* handled locally: raw
//! mode delivers it as a byte on stdin, which the copy loop forwards to
//! the remote like any other keystroke.

use crossterm::terminal;
use russh::{ChannelMsg, Pty, client};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::ssh::hostkeys::ClientHandler;

/// Fallback size when the controlling TTY cannot report one.
const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Baud rate advertised in the PTY request.
const PTY_BAUD: u32 = 14400;

/// Puts the controlling TTY into raw mode and guarantees restoration.
///
/// Restoration has the highest priority of all scoped teardown: the
/// guard's `Drop` runs even when the copy loop errors or unwinds.
struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode().map_err(|e| {
            Error::connection_failed(format!("failed to enter raw mode: {}", e))
                .with_retryable(false)
        })?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = terminal::disable_raw_mode() {
            warn!(%err, "failed to restore terminal mode");
        }
    }
}

fn terminal_size() -> (u16, u16) {
    terminal::size().unwrap_or(FALLBACK_SIZE)
}

fn term_name() -> String {
    std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string())
}

/// Run `command` (or a login shell when `None`) on a remote PTY wired to
/// the controlling TTY. Returns the remote exit code.
pub(crate) async fn run_interactive(
    handle: &client::Handle<ClientHandler>,
    command: Option<&str>,
) -> Result<i32> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| Error::session_disconnected(format!("failed to open channel: {}", e)))?;

    let (cols, rows) = terminal_size();
    let term = term_name();
    let modes = [
        (Pty::ECHO, 1),
        (Pty::TTY_OP_ISPEED, PTY_BAUD),
        (Pty::TTY_OP_OSPEED, PTY_BAUD),
    ];
    channel
        .request_pty(
            true,
            &term,
            u32::from(cols),
            u32::from(rows),
            0,
            0,
            &modes,
        )
        .await
        .map_err(|e| Error::session_disconnected(format!("PTY request failed: {}", e)))?;

    match command {
        Some(cmd) => channel
            .exec(true, cmd)
            .await
            .map_err(|e| Error::session_disconnected(format!("exec failed: {}", e)))?,
        None => channel
            .request_shell(true)
            .await
            .map_err(|e| Error::session_disconnected(format!("shell request failed: {}", e)))?,
    }

    let mut winch = signal(SignalKind::window_change()).map_err(|e| {
        Error::connection_failed(format!("failed to install resize handler: {}", e))
            .with_retryable(false)
    })?;

    // Raw mode only once the channel is fully set up, so early failures
    // leave the terminal untouched.
    let _raw = RawModeGuard::new()?;

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut inbuf = [0u8; 4096];
    let mut exit_code: Option<i32> = None;
    let mut stdin_open = true;

    enum Event {
        Channel(Option<ChannelMsg>),
        Stdin(std::io::Result<usize>),
        Resize,
    }

    loop {
        let event = if stdin_open {
            tokio::select! {
                msg = channel.wait() => Event::Channel(msg),
                read = stdin.read(&mut inbuf) => Event::Stdin(read),
                _ = winch.recv() => Event::Resize,
            }
        } else {
            tokio::select! {
                msg = channel.wait() => Event::Channel(msg),
                _ = winch.recv() => Event::Resize,
            }
        };

        match event {
            Event::Channel(Some(ChannelMsg::Data { data })) => {
                let _ = stdout.write_all(&data).await;
                let _ = stdout.flush().await;
            }
            Event::Channel(Some(ChannelMsg::ExtendedData { data, ext })) => {
                if ext == 1 {
                    let _ = stderr.write_all(&data).await;
                    let _ = stderr.flush().await;
                }
            }
            Event::Channel(Some(ChannelMsg::ExitStatus { exit_status })) => {
                exit_code = Some(exit_status as i32);
            }
            Event::Channel(Some(ChannelMsg::Close)) | Event::Channel(None) => break,
            Event::Channel(Some(ChannelMsg::Eof)) => {
                if exit_code.is_some() {
                    break;
                }
            }
            Event::Channel(Some(_)) => {}
            Event::Stdin(Ok(0)) | Event::Stdin(Err(_)) => {
                // Closing stdin closes the channel's input half.
                stdin_open = false;
                let _ = channel.eof().await;
            }
            Event::Stdin(Ok(n)) => {
                if channel.data(&inbuf[..n]).await.is_err() {
                    break;
                }
            }
            Event::Resize => {
                let (cols, rows) = terminal_size();
                debug!(cols, rows, "forwarding window change");
                let _ = channel
                    .window_change(u32::from(cols), u32::from(rows), 0, 0)
                    .await;
            }
        }
    }

    let _ = channel.close().await;
    Ok(exit_code.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_size() {
        assert_eq!(FALLBACK_SIZE, (80, 24));
    }

    #[test]
    fn test_term_name_defaults() {
        // TERM is normally set; the default only applies without one.
        let term = term_name();
        assert!(!term.is_empty());
    }
}
