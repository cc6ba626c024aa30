//! Error types, one enum per failure category.
//!
//! Every per-session error stays inside the session task; only
//! [`BindError`] is fatal to the process.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ReplyCode;

/// Malformed or unsupported SOCKS5 messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// VER field was not 0x05
    #[error("unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    /// ATYP field outside {1, 3, 4}
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    /// CMD field other than CONNECT
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Authentication negotiation failures.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Client did not offer a method the server accepts
    #[error("no acceptable authentication method offered")]
    NoAcceptableMethod,

    /// Username/password did not match
    #[error("bad username or password")]
    BadCredentials,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Outbound connection failures.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused")]
    Refused,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("connection not allowed")]
    NotAllowed,

    /// Domain name could not be resolved
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("connect failed: {0}")]
    Io(io::Error),
}

impl ConnectError {
    /// Classify an I/O error returned by a connect attempt
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused,
            io::ErrorKind::NetworkUnreachable => ConnectError::NetworkUnreachable,
            io::ErrorKind::HostUnreachable => ConnectError::HostUnreachable,
            io::ErrorKind::PermissionDenied => ConnectError::NotAllowed,
            io::ErrorKind::TimedOut => ConnectError::Timeout(Duration::ZERO),
            _ => ConnectError::Io(err),
        }
    }

    /// reply_code maps the failure to the closest SOCKS5 reply status
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ConnectError::Refused => ReplyCode::ConnectionRefused,
            ConnectError::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            ConnectError::HostUnreachable => ReplyCode::HostUnreachable,
            ConnectError::NotAllowed => ReplyCode::RuleNotAllowed,
            ConnectError::Timeout(_) | ConnectError::Resolve { .. } | ConnectError::Io(_) => {
                ReplyCode::GeneralFailure
            }
        }
    }
}

/// Everything that can end a session before or instead of a relay.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A handshake stage did not complete in time
    #[error("{stage} timed out after {after:?}")]
    StageTimeout { stage: &'static str, after: Duration },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Whether this is a deliberate refusal by the server rather than a failure
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SessionError::Protocol(ProtocolError::UnsupportedVersion(_))
                | SessionError::Protocol(ProtocolError::UnsupportedAddressType(_))
                | SessionError::Protocol(ProtocolError::UnsupportedCommand(_))
                | SessionError::Auth(AuthError::NoAcceptableMethod)
                | SessionError::Auth(AuthError::BadCredentials)
        )
    }
}

/// Failures acquiring the listening socket.
#[derive(Error, Debug)]
pub enum BindError {
    #[error("failed to resolve listen address {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    /// Address stayed in use for every attempt
    #[error("failed to bind {addr} after {attempts} attempts: {source}")]
    Exhausted {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Create a new validation error
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_classification() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(ConnectError::from_io(refused), ConnectError::Refused));

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(ConnectError::from_io(denied), ConnectError::NotAllowed));

        let other = io::Error::other("boom");
        assert!(matches!(ConnectError::from_io(other), ConnectError::Io(_)));
    }

    #[test]
    fn connect_error_reply_codes() {
        assert_eq!(ConnectError::Refused.reply_code(), ReplyCode::ConnectionRefused);
        assert_eq!(
            ConnectError::Timeout(Duration::from_secs(1)).reply_code(),
            ReplyCode::GeneralFailure
        );
        assert_eq!(
            ConnectError::HostUnreachable.reply_code(),
            ReplyCode::HostUnreachable
        );
        assert_eq!(
            ConnectError::NetworkUnreachable.reply_code(),
            ReplyCode::NetworkUnreachable
        );
        assert_eq!(ConnectError::NotAllowed.reply_code(), ReplyCode::RuleNotAllowed);
        let resolve = ConnectError::Resolve {
            host: "nowhere.invalid".into(),
            reason: "no records".into(),
        };
        assert_eq!(resolve.reply_code(), ReplyCode::GeneralFailure);
    }

    #[test]
    fn rejections_versus_failures() {
        let err: SessionError = ProtocolError::UnsupportedCommand(2).into();
        assert!(err.is_rejection());

        let err: SessionError = AuthError::NoAcceptableMethod.into();
        assert!(err.is_rejection());

        let err: SessionError = ConnectError::Refused.into();
        assert!(!err.is_rejection());

        let err = SessionError::StageTimeout {
            stage: "greeting",
            after: Duration::from_secs(1),
        };
        assert!(!err.is_rejection());
    }

    #[test]
    fn error_display() {
        assert_eq!(
            ProtocolError::UnsupportedAddressType(5).to_string(),
            "unsupported address type 0x05"
        );
        assert_eq!(
            AuthError::NoAcceptableMethod.to_string(),
            "no acceptable authentication method offered"
        );
    }
}
