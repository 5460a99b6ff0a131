//! A recording [`EventSink`] for assertions.

use async_trait::async_trait;
use mxircd::irc::events::{EventSink, IrcAction, IrcUser, JoinKind, PartKind};
use mxircd::irc::{BridgedClient, IrcServer};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub enum SinkEvent {
    Message {
        from: String,
        channel: String,
        text: String,
    },
    Private {
        from: String,
        to: String,
        text: String,
    },
    Join {
        nick: String,
        channel: String,
        kind: JoinKind,
    },
    Part {
        nick: String,
        channel: String,
        kind: PartKind,
    },
    Kick {
        nick: String,
        channel: String,
    },
    Mode {
        channel: String,
        mode: char,
        enabled: bool,
        arg: Option<String>,
    },
    Topic {
        channel: String,
        topic: String,
    },
    Invite {
        channel: String,
        to: String,
    },
    Metadata {
        text: String,
        force: bool,
    },
    JoinError {
        channel: String,
        code: String,
    },
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<(String, String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Message {
                    from,
                    channel,
                    text,
                } => Some((from, channel, text)),
                _ => None,
            })
            .collect()
    }

    pub fn parts(&self) -> Vec<(String, String, PartKind)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Part {
                    nick,
                    channel,
                    kind,
                } => Some((nick, channel, kind)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: SinkEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn on_message(
        &self,
        _server: &IrcServer,
        from: IrcUser,
        channel: String,
        action: IrcAction,
    ) {
        self.push(SinkEvent::Message {
            from: from.nick,
            channel,
            text: action.text,
        });
    }

    async fn on_private_message(
        &self,
        _server: &IrcServer,
        from: IrcUser,
        to: IrcUser,
        action: IrcAction,
    ) {
        self.push(SinkEvent::Private {
            from: from.nick,
            to: to.nick,
            text: action.text,
        });
    }

    async fn on_join(&self, _server: &IrcServer, user: IrcUser, channel: String, kind: JoinKind) {
        self.push(SinkEvent::Join {
            nick: user.nick,
            channel,
            kind,
        });
    }

    async fn on_part(
        &self,
        _server: &IrcServer,
        user: IrcUser,
        channel: String,
        kind: PartKind,
        _reason: Option<String>,
    ) {
        self.push(SinkEvent::Part {
            nick: user.nick,
            channel,
            kind,
        });
    }

    async fn on_kick(
        &self,
        _server: &IrcServer,
        _by: IrcUser,
        kicked: IrcUser,
        channel: String,
        _reason: Option<String>,
    ) {
        self.push(SinkEvent::Kick {
            nick: kicked.nick,
            channel,
        });
    }

    async fn on_mode(
        &self,
        _server: &IrcServer,
        channel: String,
        _by: String,
        mode: char,
        enabled: bool,
        arg: Option<String>,
    ) {
        self.push(SinkEvent::Mode {
            channel,
            mode,
            enabled,
            arg,
        });
    }

    async fn on_topic(&self, _server: &IrcServer, _user: IrcUser, channel: String, topic: String) {
        self.push(SinkEvent::Topic { channel, topic });
    }

    async fn on_invite(&self, _server: &IrcServer, _from: IrcUser, to: IrcUser, channel: String) {
        self.push(SinkEvent::Invite {
            channel,
            to: to.nick,
        });
    }

    async fn on_metadata(&self, _client: &BridgedClient, text: String, force: bool) {
        self.push(SinkEvent::Metadata { text, force });
    }

    async fn on_join_error(&self, _client: &BridgedClient, channel: String, code: String) {
        self.push(SinkEvent::JoinError { channel, code });
    }
}
