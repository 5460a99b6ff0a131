//! Unified error handling for mxircd.
//!
//! Errors are grouped by the operation that produces them. Recognized
//! protocol rejections carry the IRC error name they arrived with so the
//! admin surface can show something short and human-readable instead of a
//! stack of wrappers, and every variant maps to a static code for metric
//! labelling.

use crate::irc::connection::DisconnectReason;
use thiserror::Error;

// ============================================================================
// Connection establishment
// ============================================================================

/// Failure to establish (or re-establish) an IRC connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The network told us we are banned (K-line/X-line). Retrying cannot
    /// succeed, callers must not reconnect.
    #[error("user is banned from the network")]
    Banned,

    /// The network refused for connection-count reasons (I-line). Retrying
    /// from the same host cannot succeed either.
    #[error("connection was refused by a connection limit; cannot retry")]
    TooManyConnections,

    /// The network told us we are reconnecting too fast. Retryable with
    /// extra backoff.
    #[error("connection was throttled by the network")]
    Throttled,

    /// No registration reply either way within the deadline.
    #[error("timed out waiting for the connection to register")]
    Timeout,

    /// Transport-level failure (refused, reset, TLS failure).
    #[error("network error: {0}")]
    Net(String),

    /// The server rejected registration outright (bad password, closed
    /// link with an unrecognized reason).
    #[error("registration failed: {0}")]
    Registration(String),

    /// The scheduler queue that paces connects was torn down.
    #[error("connect queue shut down")]
    SchedulerClosed,
}

impl ConnectError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Banned | Self::TooManyConnections)
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Banned => "banned",
            Self::TooManyConnections => "toomanyconns",
            Self::Throttled => "throttled",
            Self::Timeout => "timeout",
            Self::Net(_) => "net_error",
            Self::Registration(_) => "registration",
            Self::SchedulerClosed => "scheduler_closed",
        }
    }
}

// ============================================================================
// Client creation (pool level)
// ============================================================================

/// Failure to produce a connected client for a Matrix user.
#[derive(Debug, Error)]
pub enum CreateClientError {
    /// The user matches an exclusion rule; rejected before any I/O.
    #[error("user {0} is excluded from bridging to this network")]
    UserExcluded(String),

    /// No server with this domain is configured.
    #[error("no bridged network with domain {0}")]
    UnknownServer(String),

    #[error("could not assign an ident username: {0}")]
    Ident(#[from] IdentError),

    #[error("could not assign an IPv6 address: {0}")]
    Ipv6(#[from] crate::irc::ipv6::Ipv6Error),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("store error: {0}")]
    Store(#[from] crate::db::StoreError),
}

impl CreateClientError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UserExcluded(_) => "user_excluded",
            Self::UnknownServer(_) => "unknown_server",
            Self::Ident(_) => "ident",
            Self::Ipv6(_) => "ipv6",
            Self::Connect(e) => e.error_code(),
            Self::Store(_) => "store",
        }
    }
}

// ============================================================================
// Identifier assignment
// ============================================================================

/// Failure to generate a unique ident username.
#[derive(Debug, Error)]
pub enum IdentError {
    /// Every suffix up to the configured maximum is taken. Terminal: there
    /// is no valid identifier left and inventing one could collide.
    #[error("ran out of ident entries: {0}")]
    Exhausted(String),

    #[error("store error: {0}")]
    Store(#[from] crate::db::StoreError),

    #[error("ident queue error: {0}")]
    Queue(String),
}

// ============================================================================
// Session operations
// ============================================================================

/// Failure to join an IRC channel.
#[derive(Debug, Clone, Error)]
pub enum JoinError {
    /// The session has no usable connection.
    #[error("no client")]
    NoClient,

    /// The channel is configured as do-not-track.
    #[error("{0} is a do-not-track channel")]
    Excluded(String),

    /// The network rejected the join with a recognized code (banned,
    /// invite-only, full, bad key, registration required). Never retried.
    #[error("cannot join channel: {0}")]
    Rejected(String),

    /// No ack and no recognizable rejection after every attempt.
    #[error("failed to join {0} after multiple tries")]
    MultipleTries(String),
}

impl JoinError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoClient => "no_client",
            Self::Excluded(_) => "excluded",
            Self::Rejected(_) => "rejected",
            Self::MultipleTries(_) => "multiple_tries",
        }
    }
}

/// Failure to change nick.
#[derive(Debug, Error)]
pub enum NickChangeError {
    #[error("you are not connected to the network")]
    NotConnected,

    /// The requested nick survives validation only with coercion; we never
    /// silently "suggest" a different nick.
    #[error("nickname is not valid: {0}")]
    Invalid(String),

    #[error("your nick is already '{0}'")]
    AlreadySet(String),

    #[error("the nickname {nick} is taken on {domain}; please pick a different nick")]
    Taken { nick: String, domain: String },

    /// A recognized rejection code from the network.
    #[error("failed to change nick: {0}")]
    Rejected(String),

    /// No reply either way. The change may still have silently happened.
    #[error("timed out waiting for a response to change nick")]
    Timeout,
}

/// Failure of a generic session operation (whois, names, send, mode).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    Join(#[from] JoinError),

    /// The connection dropped while the operation was pending.
    #[error("connection closed ({0})")]
    Disconnected(DisconnectReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_retryability() {
        assert!(!ConnectError::Banned.is_retryable());
        assert!(!ConnectError::TooManyConnections.is_retryable());
        assert!(ConnectError::Timeout.is_retryable());
        assert!(ConnectError::Net("reset".into()).is_retryable());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ConnectError::Banned.error_code(), "banned");
        assert_eq!(
            CreateClientError::UserExcluded("@a:b".into()).error_code(),
            "user_excluded"
        );
        assert_eq!(JoinError::MultipleTries("#x".into()).error_code(), "multiple_tries");
    }
}
