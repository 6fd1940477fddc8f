//! Error types for the LDAP client core.
//!
//! Every failure the core can produce is a variant of [`LdapError`]. Each
//! variant knows its [`ErrorScope`], which is what the connection uses to
//! decide whether a failure kills the connection or only the request that
//! triggered it.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using LdapError.
pub type Result<T> = std::result::Result<T, LdapError>;

/// How far the effects of an error reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// The connection cannot continue; every in-flight request is failed.
    ConnectionFatal,
    /// Only the request that produced the error is affected.
    RequestLocal,
    /// Reported to the caller of a pool / server-set / state-checked call; no
    /// connection state changes.
    CallerVisible,
}

/// Phase of connection establishment in which a dial failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Resolve,
    TcpConnect,
    TlsHandshake,
    StartTls,
    PostConnect,
    Bind,
}

impl fmt::Display for ConnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectPhase::Resolve => "resolve",
            ConnectPhase::TcpConnect => "tcp connect",
            ConnectPhase::TlsHandshake => "tls handshake",
            ConnectPhase::StartTls => "starttls",
            ConnectPhase::PostConnect => "post-connect processing",
            ConnectPhase::Bind => "bind",
        };
        f.write_str(s)
    }
}

/// One failed endpoint attempt recorded by a server set.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub endpoint: String,
    pub error: String,
}

fn format_attempts(attempts: &[ConnectAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.endpoint, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum LdapError {
    // -------------------------------------------------------------------------
    // Codec / framing
    // -------------------------------------------------------------------------
    #[error("malformed BER encoding: {reason}")]
    MalformedEncoding { reason: String },

    #[error("invalid LDAP message{}: {reason}", fmt_message_id(.message_id))]
    Decoding {
        /// Set when the envelope itself was readable and only a per-request
        /// part (e.g. one control) was invalid.
        message_id: Option<i32>,
        reason: String,
    },

    // -------------------------------------------------------------------------
    // Connection establishment
    // -------------------------------------------------------------------------
    #[error("failed to connect to {endpoint} during {phase}: {reason}")]
    Connect {
        endpoint: String,
        phase: ConnectPhase,
        reason: String,
    },

    #[error("all servers failed ({})", format_attempts(.attempts))]
    ServerSetExhausted { attempts: Vec<ConnectAttempt> },

    #[error("TLS failure on {endpoint}: {reason}")]
    Tls { endpoint: String, reason: String },

    // -------------------------------------------------------------------------
    // Request lifecycle
    // -------------------------------------------------------------------------
    #[error("request {message_id} to {endpoint} timed out after {after:?}")]
    Timeout {
        endpoint: String,
        message_id: i32,
        after: Duration,
    },

    #[error("connection to {endpoint} idle for {after:?} with requests outstanding")]
    IdleTimeout { endpoint: String, after: Duration },

    #[error("connection to {endpoint} closed: {reason}")]
    ConnectionClosed { endpoint: String, reason: String },

    #[error("message id {0} is already outstanding")]
    DuplicateMessageId(i32),

    #[error("request {message_id} was cancelled")]
    Cancelled { message_id: i32 },

    #[error("{operation} failed with result code {result_code}: {diagnostic}")]
    OperationFailed {
        operation: &'static str,
        result_code: i32,
        diagnostic: String,
    },

    #[error("{operation} is not valid in connection state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    // -------------------------------------------------------------------------
    // Authentication
    // -------------------------------------------------------------------------
    #[error("{mechanism} bind to {endpoint} rejected with result code {result_code}: {diagnostic}")]
    AuthenticationRejected {
        endpoint: String,
        mechanism: String,
        result_code: i32,
        diagnostic: String,
    },

    #[error("{mechanism} mechanism failed: {reason}")]
    AuthenticationFailed { mechanism: String, reason: String },

    #[error("{mechanism} bind exceeded {max_rounds} rounds")]
    AuthenticationRoundsExceeded { mechanism: String, max_rounds: u32 },

    #[error("cannot rebind with {mechanism} while following a referral")]
    ReferralRebindUnavailable { mechanism: String },

    // -------------------------------------------------------------------------
    // Pool
    // -------------------------------------------------------------------------
    #[error("no connection available from pool (max {max_connections}) after {waited:?}")]
    PoolExhausted {
        max_connections: usize,
        waited: Duration,
    },

    #[error("connection pool is closed")]
    PoolClosed,

    // -------------------------------------------------------------------------
    // Configuration / I/O
    // -------------------------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_message_id(id: &Option<i32>) -> String {
    match id {
        Some(id) => format!(" (message id {})", id),
        None => String::new(),
    }
}

impl LdapError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        LdapError::MalformedEncoding {
            reason: reason.into(),
        }
    }

    pub(crate) fn decoding(reason: impl Into<String>) -> Self {
        LdapError::Decoding {
            message_id: None,
            reason: reason.into(),
        }
    }

    pub fn scope(&self) -> ErrorScope {
        match self {
            LdapError::MalformedEncoding { .. }
            | LdapError::Tls { .. }
            | LdapError::IdleTimeout { .. }
            | LdapError::ConnectionClosed { .. }
            | LdapError::Io(_) => ErrorScope::ConnectionFatal,
            LdapError::Decoding { message_id, .. } => {
                if message_id.is_some() {
                    ErrorScope::RequestLocal
                } else {
                    ErrorScope::ConnectionFatal
                }
            }
            LdapError::Timeout { .. }
            | LdapError::DuplicateMessageId(_)
            | LdapError::Cancelled { .. }
            | LdapError::OperationFailed { .. }
            | LdapError::AuthenticationRejected { .. }
            | LdapError::AuthenticationFailed { .. }
            | LdapError::AuthenticationRoundsExceeded { .. } => ErrorScope::RequestLocal,
            LdapError::Connect { .. }
            | LdapError::ServerSetExhausted { .. }
            | LdapError::InvalidState { .. }
            | LdapError::ReferralRebindUnavailable { .. }
            | LdapError::PoolExhausted { .. }
            | LdapError::PoolClosed
            | LdapError::Config(_) => ErrorScope::CallerVisible,
        }
    }

    pub fn is_connection_fatal(&self) -> bool {
        self.scope() == ErrorScope::ConnectionFatal
    }

    /// A bind failed terminally; the caller must not retry automatically.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            LdapError::AuthenticationRejected { .. }
                | LdapError::AuthenticationFailed { .. }
                | LdapError::AuthenticationRoundsExceeded { .. }
        )
    }
}
