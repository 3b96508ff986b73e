//! Multi-network runtime: one supervisor task per network.
//!
//! The supervisor connects, installs a fresh [`NetworkConnection`] in the
//! pool, pumps its events in arrival order, and on disconnect asks the
//! [`ReconnectCoordinator`] how long to wait before the next attempt.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::client::{self, ClientHandle, Command};
use crate::config::SettingsStore;
use crate::dcc::DccNegotiator;
use crate::error::{ConfigError, SendError};
use crate::event::Event;
use crate::hub::{Hub, Subscription};
use crate::lag::LagReport;
use crate::pool::ConnectionPool;
use crate::reconnect::{ConnectionChange, ReconnectCoordinator};
use crate::session::{Alert, NetworkSession, SessionDeps};
use crate::store::{ConversationStore, Encryption, Notifier};
use crate::target::NetworkId;

/// How long [`Runtime::shutdown`] waits for supervisors to see the QUIT.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Keeps JOIN lines well under the 512-byte protocol limit.
const MAX_JOIN_LINE: usize = 400;

struct RuntimeInner {
    settings: SettingsStore,
    pool: ConnectionPool,
    coordinator: Arc<ReconnectCoordinator>,
    deps: SessionDeps,
    sessions: DashMap<NetworkId, Arc<NetworkSession>>,
    supervisors: DashMap<NetworkId, JoinHandle<()>>,
    _settings_watch: Subscription,
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(
        settings: SettingsStore,
        store: Arc<dyn ConversationStore>,
        encryption: Arc<dyn Encryption>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let pool = ConnectionPool::new();
        let coordinator = ReconnectCoordinator::new(settings.get().reconnect.clone(), pool.clone());
        let coord = Arc::clone(&coordinator);
        let settings_watch = settings.on_change(move |cfg| coord.set_config(cfg.reconnect.clone()));
        let deps = SessionDeps {
            settings: settings.clone(),
            store,
            encryption,
            notifier,
            dcc: DccNegotiator::new(settings.clone()),
            alerts: Hub::new(),
            lag: Hub::new(),
        };
        Self {
            inner: Arc::new(RuntimeInner {
                settings,
                pool,
                coordinator,
                deps,
                sessions: DashMap::new(),
                supervisors: DashMap::new(),
                _settings_watch: settings_watch,
            }),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn coordinator(&self) -> &Arc<ReconnectCoordinator> {
        &self.inner.coordinator
    }

    pub fn dcc(&self) -> &DccNegotiator {
        &self.inner.deps.dcc
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    pub fn session(&self, id: &NetworkId) -> Option<Arc<NetworkSession>> {
        self.inner.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn on_alert<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.inner.deps.alerts.subscribe(cb)
    }

    pub fn on_lag<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&(NetworkId, LagReport)) + Send + Sync + 'static,
    {
        self.inner.deps.lag.subscribe(cb)
    }

    pub fn on_connection_change<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&ConnectionChange) + Send + Sync + 'static,
    {
        self.inner.coordinator.subscribe(cb)
    }

    /// Command handle for a network's current connection.
    pub fn handle(&self, id: &NetworkId) -> Result<ClientHandle, SendError> {
        self.inner
            .pool
            .get_connection(id)
            .map(|c| c.handle().clone())
            .ok_or_else(|| SendError::NotConnected(id.to_string()))
    }

    /// Start every network marked `autoconnect`.
    pub async fn start_all(&self) {
        let ids: Vec<NetworkId> = self
            .inner
            .settings
            .get()
            .networks
            .iter()
            .filter(|n| n.autoconnect)
            .map(|n| n.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.start_network(&id).await {
                tracing::warn!(network = %id, error = %e, "Could not start network");
            }
        }
    }

    /// Spawn the supervisor for `id` unless one is already running. A
    /// supervisor still winding down after [`Runtime::disconnect`] is
    /// stopped and replaced.
    pub async fn start_network(&self, id: &NetworkId) -> Result<(), ConfigError> {
        let net = self.inner.settings.network(id)?;
        let running = self
            .inner
            .supervisors
            .get(id)
            .is_some_and(|task| !task.is_finished());
        if running {
            if !self.inner.coordinator.is_intentional(id) {
                return Ok(());
            }
            self.stop_supervisor(id).await;
        }

        let session = self
            .inner
            .sessions
            .entry(id.clone())
            .or_insert_with(|| {
                NetworkSession::new(
                    id.clone(),
                    net.display_name().to_string(),
                    self.inner.deps.clone(),
                )
            })
            .clone();
        session.watch(&self.inner.pool);

        self.inner.coordinator.begin(id);
        let task = tokio::spawn(supervise(Arc::clone(&self.inner), id.clone()));
        self.inner.supervisors.insert(id.clone(), task);
        Ok(())
    }

    /// Intentional disconnect: no reconnect follows.
    pub async fn disconnect(&self, id: &NetworkId, reason: Option<&str>) -> Result<(), SendError> {
        self.inner.coordinator.mark_intentional(id);
        match self.inner.pool.get_connection(id) {
            Some(conn) if !conn.handle().is_closed() => conn.handle().quit(reason).await,
            _ => {
                // Not connected; stop a supervisor waiting out a backoff.
                self.stop_supervisor(id).await;
                Ok(())
            }
        }
    }

    /// Abort the supervisor of `id` and do the cleanup its exit path would
    /// have done.
    async fn stop_supervisor(&self, id: &NetworkId) {
        if let Some((_, task)) = self.inner.supervisors.remove(id) {
            task.abort();
            let _ = task.await;
        }
        self.inner.pool.remove(id);
        self.inner.deps.dcc.close_network(id);
    }

    /// Explicit user switch of the active network.
    pub fn switch_active(&self, id: &NetworkId) -> bool {
        self.inner.coordinator.switch_active(id)
    }

    /// Quit every network, wait briefly, then flush all sessions.
    pub async fn shutdown(&self) {
        let ids: Vec<NetworkId> = self
            .inner
            .supervisors
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for id in &ids {
            if let Err(e) = self.disconnect(id, Some("Leaving")).await {
                tracing::debug!(network = %id, error = %e, "Quit failed during shutdown");
            }
        }
        for id in &ids {
            if let Some((_, task)) = self.inner.supervisors.remove(id) {
                let abort = task.abort_handle();
                if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                    abort.abort();
                }
            }
        }
        for session in self.inner.sessions.iter() {
            session.shutdown();
        }
        tracing::info!("Runtime stopped");
    }
}

/// Join `channels` in as few lines as possible.
fn join_lines(channels: &[String]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for ch in channels {
        if !current.is_empty() && current.len() + ch.len() + 1 > MAX_JOIN_LINE {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(',');
        }
        current.push_str(ch);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

async fn supervise(rt: Arc<RuntimeInner>, id: NetworkId) {
    let mut rejoin: Vec<String> = Vec::new();
    loop {
        if rt.coordinator.is_intentional(&id) {
            break;
        }
        let net = match rt.settings.network(&id) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(network = %id, error = %e, "Network removed from config, stopping");
                break;
            }
        };
        let cfg = rt.settings.get();
        let connect = net.connect_config();

        let conn = match client::establish_connection(&connect).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(network = %id, error = %e, "Connection failed");
                match rt.coordinator.on_disconnected(&id) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => break,
                }
            }
        };

        let (handle, mut events) =
            client::connect_with_stream(conn, connect.clone(), cfg.flow.clone(), cfg.lag.clone());
        let nc = rt.pool.insert(id.clone(), handle.clone(), &connect.nick);

        for ch in &net.channels {
            if !rejoin.iter().any(|c| c.eq_ignore_ascii_case(ch)) {
                rejoin.push(ch.clone());
            }
        }

        while let Some(event) = events.recv().await {
            let registered = matches!(event, Event::Registered { .. });
            let disconnected = matches!(event, Event::Disconnected { .. });
            nc.dispatch(&event);
            if registered {
                rt.coordinator.on_registered(&id);
                for line in join_lines(&rejoin) {
                    if let Err(e) = handle.try_send(Command::Join(line)) {
                        tracing::warn!(network = %id, error = %e, "Rejoin failed");
                    }
                }
            }
            if disconnected {
                break;
            }
        }
        rejoin = nc.channels();

        match rt.coordinator.on_disconnected(&id) {
            Some(delay) => tokio::time::sleep(delay).await,
            None => break,
        }
    }
    rt.pool.remove(&id);
    rt.deps.dcc.close_network(&id);
    tracing::info!(network = %id, "Supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, NetworkConfig};
    use crate::pool::ConnectionState;
    use crate::reconnect::ReconnectConfig;
    use crate::store::{MemoryStore, MentionNotifier, NoEncryption};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    fn runtime_for(server: String) -> (Runtime, NetworkId) {
        let id = NetworkId::from("test");
        let cfg = ClientConfig {
            networks: vec![NetworkConfig {
                id: id.clone(),
                name: None,
                server,
                nick: "skein".into(),
                user: None,
                realname: None,
                tls: false,
                tls_insecure: false,
                channels: Vec::new(),
                autoconnect: true,
            }],
            reconnect: ReconnectConfig {
                initial_delay_ms: 60_000,
                ..ReconnectConfig::default()
            },
            ..ClientConfig::default()
        };
        let rt = Runtime::new(
            SettingsStore::new(cfg),
            Arc::new(MemoryStore::new()),
            Arc::new(NoEncryption),
            Arc::new(MentionNotifier),
        );
        (rt, id)
    }

    #[tokio::test]
    async fn restart_while_quitting_brings_the_network_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (rt, id) = runtime_for(listener.local_addr().unwrap().to_string());
        rt.start_network(&id).await.unwrap();

        let (sock, _) = listener.accept().await.unwrap();
        let (r, mut w) = sock.into_split();
        let mut lines = BufReader::new(r).lines();
        while !lines.next_line().await.unwrap().unwrap().starts_with("USER") {}
        w.write_all(b":irc.test 001 skein :Welcome\r\n").await.unwrap();
        tokio::time::timeout(WAIT, async {
            while rt.pool().get_connection(&id).map(|c| c.state()) != Some(ConnectionState::Registered) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The server reads the QUIT but keeps the socket open, so the old
        // supervisor is still waiting when the network is started again.
        rt.disconnect(&id, None).await.unwrap();
        while !lines.next_line().await.unwrap().unwrap().starts_with("QUIT") {}
        rt.start_network(&id).await.unwrap();

        assert!(tokio::time::timeout(WAIT, listener.accept()).await.is_ok());
        assert!(!rt.coordinator().is_intentional(&id));
        drop(w);
    }

    #[tokio::test]
    async fn disconnect_during_backoff_closes_dcc_sessions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let (rt, id) = runtime_for(addr);
        rt.start_network(&id).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while rt.coordinator().state(&id).is_none_or(|s| s.attempts == 0) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let offer = "\x01DCC CHAT chat 2130706433 5000\x01";
        assert!(rt.dcc().handle_offer(&id, "bob", offer).is_some());
        assert_eq!(rt.dcc().sessions().len(), 1);

        rt.disconnect(&id, None).await.unwrap();
        assert!(rt.dcc().sessions().is_empty());
        assert!(rt.pool().get_connection(&id).is_none());
    }

    #[test]
    fn join_lines_split_long_lists() {
        let short = vec!["#a".to_string(), "#b".to_string()];
        assert_eq!(join_lines(&short), vec!["#a,#b"]);
        let many: Vec<String> = (0..200).map(|i| format!("#channel{i:03}")).collect();
        let lines = join_lines(&many);
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.len() <= MAX_JOIN_LINE));
        assert_eq!(lines.join(",").split(',').count(), 200);
        assert!(join_lines(&[]).is_empty());
    }
}
