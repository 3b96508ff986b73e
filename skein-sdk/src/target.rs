//! Network and conversation identifiers.
//!
//! Both are derived from configuration and protocol names only, never from
//! a transport instance, so they stay stable across reconnects.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of one logical network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub String);

impl NetworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Server,
    Channel,
    Query,
    Notice,
}

/// Name used for the dedicated notice view.
pub const NOTICE_TAB_NAME: &str = "Notices";

/// A conversation destination.
///
/// Equality and hashing use the case-folded name, so `#Rust` and `#rust`
/// address the same conversation while `name` keeps the spelling first seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTarget {
    pub network: NetworkId,
    pub kind: TargetKind,
    pub name: String,
}

impl ConversationTarget {
    pub fn new(network: NetworkId, kind: TargetKind, name: impl Into<String>) -> Self {
        Self {
            network,
            kind,
            name: name.into(),
        }
    }

    /// The server log for a network, named after the network itself.
    pub fn server(network: &NetworkId) -> Self {
        Self::new(network.clone(), TargetKind::Server, network.as_str())
    }

    pub fn channel(network: &NetworkId, name: &str) -> Self {
        Self::new(network.clone(), TargetKind::Channel, name)
    }

    pub fn query(network: &NetworkId, nick: &str) -> Self {
        Self::new(network.clone(), TargetKind::Query, nick)
    }

    pub fn notices(network: &NetworkId) -> Self {
        Self::new(network.clone(), TargetKind::Notice, NOTICE_TAB_NAME)
    }

    /// Stable string key: `network/kind/lowercased-name`.
    pub fn key(&self) -> String {
        let kind = match self.kind {
            TargetKind::Server => "server",
            TargetKind::Channel => "channel",
            TargetKind::Query => "query",
            TargetKind::Notice => "notice",
        };
        format!("{}/{kind}/{}", self.network, fold(&self.name))
    }
}

impl PartialEq for ConversationTarget {
    fn eq(&self, other: &Self) -> bool {
        self.network == other.network
            && self.kind == other.kind
            && fold(&self.name) == fold(&other.name)
    }
}

impl Eq for ConversationTarget {}

impl std::hash::Hash for ConversationTarget {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.network.hash(state);
        self.kind.hash(state);
        fold(&self.name).hash(state);
    }
}

impl fmt::Display for ConversationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.name)
    }
}

/// ASCII case-folding used for nick and channel comparison.
pub fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Case-insensitive nick/channel comparison.
pub fn same_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
