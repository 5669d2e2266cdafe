//! Structured errors for the session runtime.
//!
//! Every failure surfaced by the runtime is a value with a discriminated
//! [`ErrorKind`] plus context: an optional session name, an optional host,
//! a retryability flag, and an optional actionable suggestion. Nothing in
//! this crate ever blocks on a human prompt; a missing credential or an
//! unverifiable host key becomes an immediate error carrying enough
//! context for the caller to act.
//!
//! # Retryability
//!
//! Connection-level failures are transient and marked retryable;
//! authentication failures require user action and are not; a changed
//! host key is never retryable. `CommandTimeout` carries `retryable: true`
//! for the caller's discretion, but the dispatch path never auto-retries
//! it — only `SessionDisconnected` and `ConnectionFailed` feed the
//! reconnect engine.

use serde::Serialize;
use serde_json::{Value, json};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant for every error the runtime can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionRefused,
    AuthPasswordRequired,
    AuthKeyRejected,
    AuthFailed,
    HostKeyVerificationFailed,
    HostKeyChanged,
    CommandTimeout,
    CommandInterrupted,
    CommandRestricted,
    SessionNotFound,
    SessionDisconnected,
    SessionAlreadyExists,
    CannotCloseLocal,
    NoActiveSession,
    StateStoreFailed,
}

impl ErrorKind {
    /// Wire code used in serialized errors (`{"code": "..."}`).
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "CONNECTION_FAILED",
            ErrorKind::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorKind::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorKind::AuthPasswordRequired => "AUTH_PASSWORD_REQUIRED",
            ErrorKind::AuthKeyRejected => "AUTH_KEY_REJECTED",
            ErrorKind::AuthFailed => "AUTH_FAILED",
            ErrorKind::HostKeyVerificationFailed => "HOST_KEY_VERIFICATION_FAILED",
            ErrorKind::HostKeyChanged => "HOST_KEY_CHANGED",
            ErrorKind::CommandTimeout => "COMMAND_TIMEOUT",
            ErrorKind::CommandInterrupted => "COMMAND_INTERRUPTED",
            ErrorKind::CommandRestricted => "COMMAND_RESTRICTED",
            ErrorKind::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorKind::SessionDisconnected => "SESSION_DISCONNECTED",
            ErrorKind::SessionAlreadyExists => "SESSION_ALREADY_EXISTS",
            ErrorKind::CannotCloseLocal => "CANNOT_CLOSE_LOCAL",
            ErrorKind::NoActiveSession => "NO_ACTIVE_SESSION",
            ErrorKind::StateStoreFailed => "STATE_STORE_FAILED",
        }
    }

    /// Default retryability for this kind.
    ///
    /// Connection-level failures may resolve on retry. Authentication
    /// failures will not resolve without user action, and a changed host
    /// key must never be retried past.
    pub fn default_retryable(&self) -> bool {
        match self {
            ErrorKind::ConnectionFailed
            | ErrorKind::ConnectionTimeout
            | ErrorKind::ConnectionRefused
            | ErrorKind::SessionDisconnected
            | ErrorKind::CommandTimeout => true,
            ErrorKind::AuthPasswordRequired
            | ErrorKind::AuthKeyRejected
            | ErrorKind::AuthFailed
            | ErrorKind::HostKeyVerificationFailed
            | ErrorKind::HostKeyChanged
            | ErrorKind::CommandInterrupted
            | ErrorKind::CommandRestricted
            | ErrorKind::SessionNotFound
            | ErrorKind::SessionAlreadyExists
            | ErrorKind::CannotCloseLocal
            | ErrorKind::NoActiveSession
            | ErrorKind::StateStoreFailed => false,
        }
    }
}

/// An error produced by the session runtime.
///
/// Construct through the per-kind constructors and attach context with
/// the builder methods:
///
/// ```
/// use thop::{Error, ErrorKind};
///
/// let err = Error::session_disconnected("connection lost")
///     .with_session("build-box")
///     .with_suggestion("run /connect build-box");
/// assert_eq!(err.kind, ErrorKind::SessionDisconnected);
/// assert!(err.retryable);
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub session: Option<String>,
    pub host: Option<String>,
    pub retryable: bool,
    pub suggestion: Option<String>,
}

impl Error {
    /// Create an error of the given kind with its default retryability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            session: None,
            host: None,
            retryable: kind.default_retryable(),
            suggestion: None,
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed, message)
    }

    pub fn connection_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionTimeout, message)
    }

    pub fn connection_refused(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionRefused, message)
    }

    pub fn auth_password_required(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthPasswordRequired, message)
            .with_suggestion("provide credentials (identity file, agent, or password)")
    }

    pub fn auth_key_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthKeyRejected, message)
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, message)
    }

    pub fn host_key_verification_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostKeyVerificationFailed, message)
            .with_suggestion("add the host key to ~/.ssh/known_hosts, e.g. via ssh-keyscan")
    }

    pub fn host_key_changed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostKeyChanged, message)
            .with_suggestion("verify the host and update ~/.ssh/known_hosts if the change is expected")
    }

    pub fn command_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandTimeout, message)
    }

    pub fn command_interrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandInterrupted, message)
    }

    pub fn command_restricted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandRestricted, message)
    }

    pub fn session_not_found(session: impl Into<String>) -> Self {
        let session = session.into();
        Self::new(
            ErrorKind::SessionNotFound,
            format!("no session named '{}'", session),
        )
        .with_session(session)
    }

    pub fn session_disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionDisconnected, message)
    }

    pub fn session_already_exists(session: impl Into<String>) -> Self {
        let session = session.into();
        Self::new(
            ErrorKind::SessionAlreadyExists,
            format!("session '{}' already exists", session),
        )
        .with_session(session)
    }

    pub fn cannot_close_local() -> Self {
        Self::new(
            ErrorKind::CannotCloseLocal,
            "the local session cannot be closed",
        )
    }

    pub fn no_active_session() -> Self {
        Self::new(ErrorKind::NoActiveSession, "no active session")
    }

    pub fn state_store(err: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::StateStoreFailed,
            format!("state store operation failed: {}", err),
        )
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Whether the dispatch path should hand this error to the reconnect
    /// engine. Only disconnects and connection failures qualify, and only
    /// while still flagged retryable.
    pub fn should_reconnect(&self) -> bool {
        self.retryable
            && matches!(
                self.kind,
                ErrorKind::SessionDisconnected | ErrorKind::ConnectionFailed
            )
    }

    /// Process exit code a CLI façade should surface for this error.
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::AuthPasswordRequired
            | ErrorKind::AuthKeyRejected
            | ErrorKind::AuthFailed => 2,
            ErrorKind::HostKeyVerificationFailed | ErrorKind::HostKeyChanged => 3,
            ErrorKind::CommandInterrupted => 130,
            _ => 1,
        }
    }

    /// Serialize for JSON-emitting callers.
    ///
    /// Optional fields are omitted rather than emitted as null, so the
    /// document stays compact for machine consumers.
    pub fn to_json(&self) -> Value {
        let mut doc = json!({
            "error": true,
            "code": self.kind.code(),
            "message": self.message,
            "retryable": self.retryable,
        });
        let map = doc.as_object_mut().expect("object literal");
        if let Some(session) = &self.session {
            map.insert("session".into(), Value::String(session.clone()));
        }
        if let Some(host) = &self.host {
            map.insert("host".into(), Value::String(host.clone()));
        }
        if let Some(suggestion) = &self.suggestion {
            map.insert("suggestion".into(), Value::String(suggestion.clone()));
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod retryability {
        use super::*;

        #[test]
        fn test_connection_kinds_are_retryable() {
            assert!(Error::connection_failed("x").retryable);
            assert!(Error::connection_timeout("x").retryable);
            assert!(Error::connection_refused("x").retryable);
            assert!(Error::session_disconnected("x").retryable);
        }

        #[test]
        fn test_auth_kinds_are_not_retryable() {
            assert!(!Error::auth_password_required("x").retryable);
            assert!(!Error::auth_key_rejected("x").retryable);
            assert!(!Error::auth_failed("x").retryable);
        }

        #[test]
        fn test_host_key_changed_never_retryable() {
            assert!(!Error::host_key_changed("x").retryable);
        }

        #[test]
        fn test_command_timeout_flagged_but_not_reconnectable() {
            let err = Error::command_timeout("slow");
            assert!(err.retryable);
            assert!(!err.should_reconnect());
        }

        #[test]
        fn test_should_reconnect_only_for_connection_loss() {
            assert!(Error::session_disconnected("gone").should_reconnect());
            assert!(Error::connection_failed("gone").should_reconnect());
            assert!(!Error::connection_refused("gone").should_reconnect());
            assert!(!Error::auth_failed("gone").should_reconnect());
        }

        #[test]
        fn test_retryable_override() {
            let err = Error::connection_failed("gave up").with_retryable(false);
            assert!(!err.retryable);
            assert!(!err.should_reconnect());
        }
    }

    mod serialization {
        use super::*;

        #[test]
        fn test_json_shape() {
            let err = Error::session_not_found("ghost");
            let doc = err.to_json();
            assert_eq!(doc["error"], true);
            assert_eq!(doc["code"], "SESSION_NOT_FOUND");
            assert_eq!(doc["session"], "ghost");
            assert_eq!(doc["retryable"], false);
            assert!(doc.get("host").is_none());
        }

        #[test]
        fn test_json_includes_suggestion() {
            let doc = Error::auth_password_required("no credentials").to_json();
            assert_eq!(doc["code"], "AUTH_PASSWORD_REQUIRED");
            assert!(
                doc["suggestion"]
                    .as_str()
                    .is_some_and(|s| s.contains("credentials"))
            );
        }

        #[test]
        fn test_json_includes_host() {
            let doc = Error::connection_refused("refused")
                .with_host("bastion.example.com")
                .to_json();
            assert_eq!(doc["host"], "bastion.example.com");
        }

        #[test]
        fn test_codes_are_screaming_snake() {
            for kind in [
                ErrorKind::ConnectionFailed,
                ErrorKind::HostKeyChanged,
                ErrorKind::CannotCloseLocal,
                ErrorKind::NoActiveSession,
            ] {
                let code = kind.code();
                assert!(code.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
            }
        }
    }

    mod exit_codes {
        use super::*;

        #[test]
        fn test_auth_failures_exit_2() {
            assert_eq!(Error::auth_failed("x").exit_code(), 2);
            assert_eq!(Error::auth_password_required("x").exit_code(), 2);
        }

        #[test]
        fn test_host_key_failures_exit_3() {
            assert_eq!(Error::host_key_changed("x").exit_code(), 3);
            assert_eq!(Error::host_key_verification_failed("x").exit_code(), 3);
        }

        #[test]
        fn test_interrupt_exits_130() {
            assert_eq!(Error::command_interrupted("^C").exit_code(), 130);
        }

        #[test]
        fn test_everything_else_exits_1() {
            assert_eq!(Error::connection_failed("x").exit_code(), 1);
            assert_eq!(Error::session_not_found("x").exit_code(), 1);
        }
    }

    mod display {
        use super::*;

        #[test]
        fn test_display_is_message() {
            let err = Error::connection_timeout("timed out after 30s");
            assert_eq!(err.to_string(), "timed out after 30s");
        }
    }
}
