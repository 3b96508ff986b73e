//! Events emitted by a connection's protocol loop.

use std::collections::HashMap;

use crate::lag::LagReport;

/// Decoded protocol events, in arrival order per connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Transport established, registration not yet complete.
    Connected,

    /// IRC registration complete. `nick` is our confirmed nick.
    Registered {
        nick: String,
    },

    /// PRIVMSG addressed to a channel or to us.
    Message {
        from: String,
        target: String,
        text: String,
        /// IRCv3 message tags (empty if none).
        tags: HashMap<String, String>,
    },

    /// NOTICE from a user or a server. `from` is the raw prefix
    /// (`nick` for users, server name otherwise) and is `None` when the
    /// server omitted it.
    Notice {
        from: Option<String>,
        target: String,
        text: String,
        tags: HashMap<String, String>,
    },

    Joined {
        channel: String,
        nick: String,
    },

    Parted {
        channel: String,
        nick: String,
        reason: Option<String>,
    },

    Kicked {
        channel: String,
        nick: String,
        by: String,
        reason: String,
    },

    NickChanged {
        old_nick: String,
        new_nick: String,
    },

    TopicChanged {
        channel: String,
        topic: String,
        set_by: Option<String>,
    },

    UserQuit {
        nick: String,
        reason: String,
    },

    /// Numerics, MOTD lines and errors: the "connection" category that
    /// normally lands on the server tab.
    ServerNotice {
        text: String,
    },

    /// A lag sample or timeout classification.
    Lag(LagReport),

    /// Connection was closed.
    Disconnected {
        reason: String,
    },

    /// Raw server line (for debugging).
    RawLine(String),
}

impl Event {
    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connected => "connected",
            Event::Registered { .. } => "registered",
            Event::Message { .. } => "message",
            Event::Notice { .. } => "notice",
            Event::Joined { .. } => "joined",
            Event::Parted { .. } => "parted",
            Event::Kicked { .. } => "kicked",
            Event::NickChanged { .. } => "nick",
            Event::TopicChanged { .. } => "topic",
            Event::UserQuit { .. } => "quit",
            Event::ServerNotice { .. } => "server_notice",
            Event::Lag(_) => "lag",
            Event::Disconnected { .. } => "disconnected",
            Event::RawLine(_) => "raw",
        }
    }
}
