//! Error taxonomy for the SSH bridge.
//!
//! Two categories of failure cross the wire:
//!
//! 1. **Recoverable, per-operation**: a connect or reuse attempt that did not
//!    produce a session. These surface as `success = false` plus a reason
//!    string ([`SshFailure::reason`]); the client stays usable.
//!
//! 2. **Terminal**: the client state machine is dead. These surface as a
//!    typed [`ClientError`] whose [`ErrorKind`] tells the caller what broke
//!    (daemon gone, SSH session dropped, protocol violation, ...).
//!
//! # Reason strings
//!
//! Reason strings are part of the library contract and are matched by
//! callers, so their shapes are fixed:
//!
//! | Classification | Reason |
//! |---|---|
//! | handshake, fingerprint mismatch | `host fingerprint has changed (expected <e>, received <r>)` |
//! | handshake, other | `SSH handshake failed (<detail>)` |
//! | socket | `connection error (<detail>)` |
//! | timeout | `connection timed out` |
//! | authentication | `authentication denied` |
//! | dns | `DNS lookup failed (<detail>)` |
//! | other | `unexpected error (<detail>)` |

use std::fmt;

/// Reason reported when a reuse attempt finds no idle session under its key.
pub const REASON_NO_CACHED_CONNECTION: &str = "no cached connection to reuse";

/// Reason reported when a connect attempt has neither direct nor cached
/// credentials to work with.
pub const REASON_NO_CREDENTIALS: &str = "no credentials provided";

/// Reason reported when an established session drops without a clean close.
pub const REASON_CONNECTION_LOST: &str = "remote connection closed unexpectedly";

/// Classification of an SSH-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshErrorKind {
    /// Key exchange or protocol negotiation failed.
    Handshake,
    /// The TCP connection failed or broke.
    Socket,
    /// The connection did not become ready in time.
    Timeout,
    /// All offered authentication methods were rejected.
    Authentication,
    /// Hostname resolution failed.
    Dns,
    /// Anything the other classes do not cover.
    Other,
}

/// A classified SSH failure plus enough detail to build its reason string.
#[derive(Debug, Clone)]
pub struct SshFailure {
    pub kind: SshErrorKind,
    detail: String,
    /// Present only for host-key mismatches: (expected, received) base64
    /// SHA-256 fingerprints.
    mismatch: Option<(String, String)>,
}

impl SshFailure {
    pub fn new(kind: SshErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            mismatch: None,
        }
    }

    /// A handshake failure caused by the host presenting an unexpected key.
    pub fn fingerprint_mismatch(expected: impl Into<String>, received: impl Into<String>) -> Self {
        Self {
            kind: SshErrorKind::Handshake,
            detail: String::new(),
            mismatch: Some((expected.into(), received.into())),
        }
    }

    pub fn authentication() -> Self {
        Self::new(SshErrorKind::Authentication, "")
    }

    pub fn timeout() -> Self {
        Self::new(SshErrorKind::Timeout, "")
    }

    /// The contract reason string for this failure.
    pub fn reason(&self) -> String {
        if let Some((expected, received)) = &self.mismatch {
            return format!(
                "host fingerprint has changed (expected {}, received {})",
                expected, received
            );
        }
        match self.kind {
            SshErrorKind::Handshake => format!("SSH handshake failed ({})", self.detail),
            SshErrorKind::Socket => format!("connection error ({})", self.detail),
            SshErrorKind::Timeout => "connection timed out".to_string(),
            SshErrorKind::Authentication => "authentication denied".to_string(),
            SshErrorKind::Dns => format!("DNS lookup failed ({})", self.detail),
            SshErrorKind::Other => format!("unexpected error ({})", self.detail),
        }
    }
}

impl fmt::Display for SshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

/// Kinds of terminal client failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The local stream to the daemon closed.
    NoDaemon,
    /// The SSH session dropped while Ready or Executing.
    NoSsh,
    /// The daemon reported an EXCEPTION frame.
    DaemonError,
    /// A RESULT frame carried an `error` field.
    SshError,
    /// An unexpected frame or an event arrived in the wrong state.
    ProtocolError,
    /// The caller's challenge handler failed.
    ChallengeError,
    /// The client was closed by the caller.
    Closed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoDaemon => "NO_DAEMON",
            ErrorKind::NoSsh => "NO_SSH",
            ErrorKind::DaemonError => "DAEMON_ERROR",
            ErrorKind::SshError => "SSH_ERROR",
            ErrorKind::ProtocolError => "PROTOCOL_ERROR",
            ErrorKind::ChallengeError => "CHALLENGE_ERROR",
            ErrorKind::Closed => "CLOSED",
        }
    }
}

/// A terminal failure of the client state machine.
///
/// Once one of these is produced the client is Errored; the error either
/// resolves the in-flight operation or is stashed and raised on the next
/// call (see the client state machine).
#[derive(Debug, Clone)]
pub struct ClientError {
    pub kind: ErrorKind,
    pub message: String,
    /// Original terminal error, set on the generic "client is closed" error
    /// raised after the stashed error was already delivered once.
    pub cause: Option<Box<ClientError>>,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn no_daemon() -> Self {
        Self::new(ErrorKind::NoDaemon, "connection to the daemon was lost")
    }

    pub fn closed() -> Self {
        Self::new(ErrorKind::Closed, "client was closed")
    }

    /// The generic error raised after the stashed terminal error has been
    /// delivered once already.
    pub fn already_closed(original: ClientError) -> Self {
        Self {
            kind: ErrorKind::Closed,
            message: "client is closed".to_string(),
            cause: Some(Box::new(original)),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}
