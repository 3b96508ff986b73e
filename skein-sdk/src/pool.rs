//! One live connection per logical network.
//!
//! A reconnect replaces the [`NetworkConnection`] for a network with a new
//! instance (new generation, new event hub) rather than mutating the old one.
//! Listeners therefore watch [`ConnectionPool::on_connection_created`] and
//! re-attach to each new instance.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::client::ClientHandle;
use crate::event::Event;
use crate::hub::{Hub, Subscription};
use crate::target::{NetworkId, fold};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registered,
}

/// A network's transport handle plus its decoded event stream.
pub struct NetworkConnection {
    id: NetworkId,
    generation: u64,
    handle: ClientHandle,
    state: Mutex<ConnectionState>,
    nick: Mutex<String>,
    /// Channels we are in, by folded name; rejoined after a reconnect.
    channels: Mutex<BTreeSet<String>>,
    events: Hub<Event>,
}

impl NetworkConnection {
    pub fn id(&self) -> &NetworkId {
        &self.id
    }

    /// Distinguishes successive connections of the same network.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn nick(&self) -> String {
        self.nick.lock().clone()
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().iter().cloned().collect()
    }

    /// Attach to this instance's event stream.
    pub fn subscribe<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe(cb)
    }

    pub fn listener_count(&self) -> usize {
        self.events.subscriber_count()
    }

    /// Update connection state from `event`, then fan it out. Called by the
    /// supervisor in arrival order.
    pub fn dispatch(&self, event: &Event) {
        match event {
            Event::Connected => *self.state.lock() = ConnectionState::Connecting,
            Event::Registered { nick } => {
                *self.state.lock() = ConnectionState::Registered;
                *self.nick.lock() = nick.clone();
            }
            Event::NickChanged { old_nick, new_nick } => {
                let mut nick = self.nick.lock();
                if nick.eq_ignore_ascii_case(old_nick) {
                    *nick = new_nick.clone();
                }
            }
            Event::Joined { channel, nick } if self.is_self(nick) => {
                self.channels.lock().insert(fold(channel));
            }
            Event::Parted { channel, nick, .. } if self.is_self(nick) => {
                self.channels.lock().remove(&fold(channel));
            }
            Event::Kicked { channel, nick, .. } if self.is_self(nick) => {
                self.channels.lock().remove(&fold(channel));
            }
            Event::Disconnected { .. } => *self.state.lock() = ConnectionState::Disconnected,
            _ => {}
        }
        self.events.publish(event);
    }

    fn is_self(&self, nick: &str) -> bool {
        self.nick.lock().eq_ignore_ascii_case(nick)
    }
}

struct PoolInner {
    connections: DashMap<NetworkId, Arc<NetworkConnection>>,
    active: RwLock<Option<NetworkId>>,
    created: Hub<Arc<NetworkConnection>>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connections: DashMap::new(),
                active: RwLock::new(None),
                created: Hub::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Every managed connection, ordered by network id.
    pub fn get_all_connections(&self) -> Vec<Arc<NetworkConnection>> {
        let mut all: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn get_active_network_id(&self) -> Option<NetworkId> {
        self.inner.active.read().clone()
    }

    /// Written only by the reconnect coordinator.
    pub(crate) fn set_active(&self, network: Option<NetworkId>) {
        *self.inner.active.write() = network;
    }

    pub fn get_connection(&self, id: &NetworkId) -> Option<Arc<NetworkConnection>> {
        self.inner.connections.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Install a new connection instance for `id`, replacing any previous
    /// one, and announce it. `nick` is the nick we will register with.
    pub fn insert(&self, id: NetworkId, handle: ClientHandle, nick: &str) -> Arc<NetworkConnection> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Arc::new(NetworkConnection {
            id: id.clone(),
            generation,
            handle,
            state: Mutex::new(ConnectionState::Connecting),
            nick: Mutex::new(nick.to_string()),
            channels: Mutex::new(BTreeSet::new()),
            events: Hub::new(),
        });
        if let Some(old) = self.inner.connections.insert(id, Arc::clone(&conn)) {
            tracing::debug!(
                network = %conn.id,
                old = old.generation,
                new = generation,
                "Replacing connection"
            );
        }
        self.inner.created.publish(&conn);
        conn
    }

    /// Drop the connection for `id` (permanent disconnect). The active
    /// pointer is left to the coordinator.
    pub fn remove(&self, id: &NetworkId) -> Option<Arc<NetworkConnection>> {
        self.inner.connections.remove(id).map(|(_, c)| c)
    }

    /// Re-reads every connection; nothing is cached across reconnects.
    pub fn any_connected(&self) -> bool {
        self.inner
            .connections
            .iter()
            .any(|e| e.value().state() == ConnectionState::Registered)
    }

    pub fn on_connection_created<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&Arc<NetworkConnection>) + Send + Sync + 'static,
    {
        self.inner.created.subscribe(cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ConnectConfig, connect_with_io};
    use crate::flow::FlowConfig;
    use crate::lag::LagConfig;
    use std::sync::atomic::AtomicUsize;

    fn handle() -> (ClientHandle, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let (handle, _events) = connect_with_io(
            client,
            ConnectConfig::default(),
            FlowConfig::default(),
            LagConfig::default(),
        );
        (handle, server)
    }

    #[tokio::test]
    async fn insert_replaces_and_announces() {
        let pool = ConnectionPool::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = pool.on_connection_created(move |c| s.lock().push(c.generation()));

        let net = NetworkId::from("libera");
        let (h1, _s1) = handle();
        let (h2, _s2) = handle();
        let first = pool.insert(net.clone(), h1, "skein");
        let second = pool.insert(net.clone(), h2, "skein");

        assert!(second.generation() > first.generation());
        assert_eq!(seen.lock().clone(), vec![first.generation(), second.generation()]);
        let current = pool.get_connection(&net).unwrap();
        assert_eq!(current.generation(), second.generation());
        assert_eq!(pool.get_all_connections().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_tracks_state_nick_and_channels() {
        let pool = ConnectionPool::new();
        let (h, _server) = handle();
        let conn = pool.insert(NetworkId::from("libera"), h, "skein");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = conn.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!pool.any_connected());
        conn.dispatch(&Event::Registered { nick: "skein_".into() });
        assert!(pool.any_connected());
        assert_eq!(conn.nick(), "skein_");

        conn.dispatch(&Event::Joined { channel: "#Rust".into(), nick: "skein_".into() });
        conn.dispatch(&Event::Joined { channel: "#tokio".into(), nick: "skein_".into() });
        conn.dispatch(&Event::Joined { channel: "#other".into(), nick: "bob".into() });
        assert_eq!(conn.channels(), vec!["#rust", "#tokio"]);

        conn.dispatch(&Event::NickChanged { old_nick: "skein_".into(), new_nick: "skein".into() });
        conn.dispatch(&Event::Kicked {
            channel: "#tokio".into(),
            nick: "skein".into(),
            by: "op".into(),
            reason: "bye".into(),
        });
        assert_eq!(conn.channels(), vec!["#rust"]);

        conn.dispatch(&Event::Disconnected { reason: "EOF".into() });
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!pool.any_connected());
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn remove_leaves_active_pointer_alone() {
        let pool = ConnectionPool::new();
        let net = NetworkId::from("libera");
        let (h, _server) = handle();
        pool.insert(net.clone(), h, "skein");
        pool.set_active(Some(net.clone()));
        assert!(pool.remove(&net).is_some());
        assert!(pool.get_connection(&net).is_none());
        assert_eq!(pool.get_active_network_id(), Some(net));
    }
}
