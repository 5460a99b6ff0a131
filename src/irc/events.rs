//! Typed IRC events and the upward interface to the Matrix side.
//!
//! The connection layer translates decoded wire messages into [`IrcEvent`]s.
//! Claim-gated events travel together with the server line they were
//! decoded from, because the dedup broker hashes the line itself: every
//! session observing the same server line must produce an identical hash,
//! regardless of what its local channel state looks like.

use crate::irc::connection::DisconnectReason;
use crate::irc::server::IrcServer;
use crate::irc::session::BridgedClient;
use async_trait::async_trait;
use std::collections::HashMap;

/// A decoded inbound IRC event.
#[derive(Debug, Clone)]
pub enum IrcEvent {
    Message {
        from: String,
        to: String,
        text: String,
    },
    Notice {
        from: String,
        to: String,
        text: String,
    },
    /// CTCP ACTION (emote).
    Action {
        from: String,
        to: String,
        text: String,
    },
    Join {
        channel: String,
        nick: String,
    },
    Part {
        channel: String,
        nick: String,
        reason: Option<String>,
    },
    Kick {
        channel: String,
        nick: String,
        by: String,
        reason: Option<String>,
    },
    /// QUIT, annotated with the channels this connection saw the user in.
    Quit {
        nick: String,
        reason: Option<String>,
        channels: Vec<String>,
    },
    NickChange {
        old: String,
        new: String,
        channels: Vec<String>,
    },
    Mode {
        target: String,
        by: String,
        mode: char,
        enabled: bool,
        arg: Option<String>,
    },
    /// Reply to a MODE query (RPL_CHANNELMODEIS).
    ModeIs {
        target: String,
        modes: String,
    },
    Topic {
        channel: String,
        topic: String,
        by: String,
    },
    Invite {
        channel: String,
        from: String,
    },
    /// Aggregated NAMES reply: nick -> prefix string ("@", "+", "", ...).
    Names {
        channel: String,
        names: HashMap<String, String>,
    },
    /// A recognized non-fatal error numeric.
    ServerError {
        code: String,
        args: Vec<String>,
    },
    /// Terminal: the underlying transport is gone. Always the last event
    /// a connection emits.
    Disconnected {
        reason: DisconnectReason,
    },
}

/// An event plus the wire line it was decoded from, when claim-gated.
/// Events without a line (PMs, queries, lifecycle) bypass claiming.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub line: Option<String>,
    pub event: IrcEvent,
}

impl SessionEvent {
    pub fn internal(event: IrcEvent) -> Self {
        Self { line: None, event }
    }
}

/// An IRC user as presented to the sink.
#[derive(Debug, Clone)]
pub struct IrcUser {
    pub domain: String,
    pub nick: String,
    /// Whether this nick belongs to one of our own virtual clients.
    pub is_virtual: bool,
}

/// What a relayed message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Message,
    Notice,
    Emote,
    Topic,
}

/// A message travelling in either direction.
#[derive(Debug, Clone)]
pub struct IrcAction {
    pub kind: ActionKind,
    pub text: String,
    /// Origin timestamp (ms); outbound sends are dropped when older than
    /// the server's expiry window by the time the client can send.
    pub ts: Option<i64>,
}

impl IrcAction {
    pub fn new(kind: ActionKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            ts: None,
        }
    }
}

/// Why a join is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Join,
    /// Synthesized from a nick change.
    Nick,
    /// Synthesized from a NAMES directory sync.
    Names,
}

/// Why a part is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Part,
    Quit,
    /// Synthesized from a nick change.
    Nick,
}

/// The Matrix-side handler. Everything behind this trait is out of scope
/// for the connection core; implementations are expected to turn these
/// callbacks into Matrix API calls.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_message(
        &self,
        _server: &IrcServer,
        _from: IrcUser,
        _channel: String,
        _action: IrcAction,
    ) {
    }

    async fn on_private_message(
        &self,
        _server: &IrcServer,
        _from: IrcUser,
        _to: IrcUser,
        _action: IrcAction,
    ) {
    }

    async fn on_join(&self, _server: &IrcServer, _user: IrcUser, _channel: String, _kind: JoinKind) {
    }

    async fn on_part(
        &self,
        _server: &IrcServer,
        _user: IrcUser,
        _channel: String,
        _kind: PartKind,
        _reason: Option<String>,
    ) {
    }

    async fn on_kick(
        &self,
        _server: &IrcServer,
        _by: IrcUser,
        _kicked: IrcUser,
        _channel: String,
        _reason: Option<String>,
    ) {
    }

    async fn on_mode(
        &self,
        _server: &IrcServer,
        _channel: String,
        _by: String,
        _mode: char,
        _enabled: bool,
        _arg: Option<String>,
    ) {
    }

    async fn on_mode_is(&self, _server: &IrcServer, _channel: String, _modes: String) {}

    async fn on_topic(&self, _server: &IrcServer, _user: IrcUser, _channel: String, _topic: String) {
    }

    async fn on_invite(&self, _server: &IrcServer, _from: IrcUser, _to: IrcUser, _channel: String) {
    }

    /// Connection status notices for the owning user ("connected as X",
    /// errors, disconnects). `force` bypasses the per-server notice
    /// setting for errors the user must see.
    async fn on_metadata(&self, _client: &BridgedClient, _text: String, _force: bool) {}

    /// A channel join was rejected with a hard error code.
    async fn on_join_error(&self, _client: &BridgedClient, _channel: String, _code: String) {}
}
