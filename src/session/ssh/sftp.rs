//! SFTP file operations.
//!
//! Each operation opens a short-lived `sftp` subsystem channel on the
//! session's persistent client and closes it on completion, so file
//! transfer never interferes with command channels and a wedged transfer
//! cannot poison the session.

use std::path::Path;

use russh::client;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::session::ssh::hostkeys::ClientHandler;

fn sftp_error(op: &str, path: &str, err: impl std::fmt::Display) -> Error {
    Error::connection_failed(format!("sftp {} {}: {}", op, path, err)).with_retryable(false)
}

/// Open a fresh SFTP subsystem over the persistent client.
async fn open_sftp(handle: &client::Handle<ClientHandler>) -> Result<SftpSession> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| Error::session_disconnected(format!("failed to open sftp channel: {}", e)))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| Error::session_disconnected(format!("sftp subsystem rejected: {}", e)))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| Error::session_disconnected(format!("sftp handshake failed: {}", e)))
}

/// Read a remote file into memory.
pub(crate) async fn read_file(
    handle: &client::Handle<ClientHandler>,
    path: &str,
) -> Result<Vec<u8>> {
    let sftp = open_sftp(handle).await?;
    let result = async {
        let mut file = sftp
            .open(path)
            .await
            .map_err(|e| sftp_error("open", path, e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| sftp_error("read", path, e))?;
        Ok(data)
    }
    .await;
    let _ = sftp.close().await;
    result
}

/// Write a remote file and set its mode.
pub(crate) async fn write_file(
    handle: &client::Handle<ClientHandler>,
    path: &str,
    data: &[u8],
    mode: u32,
) -> Result<()> {
    let sftp = open_sftp(handle).await?;
    let result = async {
        let mut file = sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| sftp_error("create", path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| sftp_error("write", path, e))?;
        file.shutdown()
            .await
            .map_err(|e| sftp_error("flush", path, e))?;

        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        sftp.set_metadata(path, attrs)
            .await
            .map_err(|e| sftp_error("chmod", path, e))?;
        debug!(path, "remote file written (mode {:o})", mode);
        Ok(())
    }
    .await;
    let _ = sftp.close().await;
    result
}

/// Copy a local file to the remote, preserving the local mode.
pub(crate) async fn upload_file(
    handle: &client::Handle<ClientHandler>,
    local: &Path,
    remote: &str,
) -> Result<()> {
    let data = tokio::fs::read(local)
        .await
        .map_err(|e| sftp_error("upload", &local.display().to_string(), e))?;
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::metadata(local)
            .await
            .map(|m| m.permissions().mode() & 0o777)
            .unwrap_or(0o644)
    };
    write_file(handle, remote, &data, mode).await
}

/// Copy a remote file to the local filesystem.
pub(crate) async fn download_file(
    handle: &client::Handle<ClientHandler>,
    remote: &str,
    local: &Path,
) -> Result<()> {
    let data = read_file(handle, remote).await?;
    tokio::fs::write(local, data)
        .await
        .map_err(|e| sftp_error("download", &local.display().to_string(), e))?;
    Ok(())
}
