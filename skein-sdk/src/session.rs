//! Per-network listener that carries decoded events through the router.
//!
//! A [`NetworkSession`] watches the pool for new connection instances of its
//! network and re-attaches to each one, dropping the previous generation's
//! subscription first so a message is never delivered twice.

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;

use crate::batch::{BatchQueue, StoreSink};
use crate::client::Command;
use crate::config::SettingsStore;
use crate::ctcp;
use crate::dcc::{DccNegotiator, Handled};
use crate::event::Event;
use crate::hub::{Hub, Subscription};
use crate::lag::LagReport;
use crate::pool::{ConnectionPool, NetworkConnection};
use crate::router::{CtcpMessage, DeliveryKind, MessageRouter, Route, RouteContext, RoutedEvent};
use crate::store::{ConversationStore, Encryption, Notifier};
use crate::target::{ConversationTarget, NetworkId};

/// Verbs answered automatically.
const CLIENTINFO: &str = "ACTION CLIENTINFO PING TIME VERSION";

/// A delivery the notifier wants surfaced.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub network: NetworkId,
    pub event: RoutedEvent,
}

/// Collaborators shared by every session of a runtime.
#[derive(Clone)]
pub struct SessionDeps {
    pub settings: SettingsStore,
    pub store: Arc<dyn ConversationStore>,
    pub encryption: Arc<dyn Encryption>,
    pub notifier: Arc<dyn Notifier>,
    pub dcc: DccNegotiator,
    pub alerts: Hub<Alert>,
    pub lag: Hub<(NetworkId, LagReport)>,
}

struct Shared {
    network: NetworkId,
    network_name: String,
    router: MessageRouter,
    batch: BatchQueue,
    deps: SessionDeps,
}

pub struct NetworkSession {
    shared: Arc<Shared>,
    listener: Mutex<Option<(u64, Subscription)>>,
    watcher: Mutex<Option<Subscription>>,
}

impl NetworkSession {
    pub fn new(network: NetworkId, network_name: String, deps: SessionDeps) -> Arc<Self> {
        let router = MessageRouter::new(
            deps.settings.clone(),
            Arc::clone(&deps.store),
            Arc::clone(&deps.encryption),
        );
        let batch = BatchQueue::new(Arc::new(StoreSink::new(Arc::clone(&deps.store))));
        Arc::new(Self {
            shared: Arc::new(Shared {
                network,
                network_name,
                router,
                batch,
                deps,
            }),
            listener: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    pub fn network(&self) -> &NetworkId {
        &self.shared.network
    }

    /// Follow connection-created notifications for this network. Attaches
    /// immediately if the pool already holds a connection.
    pub fn watch(self: &Arc<Self>, pool: &ConnectionPool) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let network = self.shared.network.clone();
        let sub = pool.on_connection_created(move |conn| {
            if conn.id() != &network {
                return;
            }
            if let Some(session) = weak.upgrade() {
                session.attach(conn);
            }
        });
        *self.watcher.lock() = Some(sub);
        if let Some(conn) = pool.get_connection(&self.shared.network) {
            self.attach(&conn);
        }
    }

    /// Listen to `conn`, replacing any earlier attachment. Attaching to the
    /// same generation twice is a no-op.
    pub fn attach(&self, conn: &Arc<NetworkConnection>) {
        let mut slot = self.listener.lock();
        if let Some((generation, _)) = slot.as_ref()
            && *generation == conn.generation()
        {
            return;
        }
        if let Some((generation, mut old)) = slot.take() {
            old.unsubscribe();
            tracing::debug!(
                network = %self.shared.network,
                old = generation,
                new = conn.generation(),
                "Re-attaching listener"
            );
        }
        let shared = Arc::clone(&self.shared);
        let weak_conn = Arc::downgrade(conn);
        let sub = conn.subscribe(move |event| {
            if let Some(conn) = weak_conn.upgrade() {
                shared.on_event(&conn, event);
            }
        });
        *slot = Some((conn.generation(), sub));
    }

    /// Generation currently listened to.
    pub fn attached_generation(&self) -> Option<u64> {
        self.listener.lock().as_ref().map(|(g, _)| *g)
    }

    /// Detach and flush whatever is still queued.
    pub fn shutdown(&self) {
        self.watcher.lock().take();
        self.listener.lock().take();
        self.shared.batch.shutdown();
    }

    /// Apply queued deliveries now.
    pub fn flush(&self) {
        self.shared.batch.flush();
    }
}

impl Shared {
    fn on_event(&self, conn: &NetworkConnection, event: &Event) {
        let nick = conn.nick();
        if let Event::Lag(report) = event {
            self.deps.lag.publish(&(self.network.clone(), report.clone()));
        }
        let ctx = RouteContext {
            network: &self.network,
            network_name: &self.network_name,
            self_nick: &nick,
        };
        match self.router.route(&ctx, event) {
            Route::Deliver(ev) => self.deliver(ev, &nick),
            Route::Dcc { from, payload } => self.on_dcc(conn, &from, &payload),
            Route::Encryption(control) => self.deps.encryption.handle_control(&control),
            Route::Ctcp(msg) if msg.is_reply => self.show_ctcp_reply(&msg),
            Route::Ctcp(msg) => self.answer_ctcp(conn, &msg),
            Route::Drop(reason) => {
                tracing::trace!(network = %self.network, kind = event.kind(), ?reason, "Event not routed");
            }
        }
    }

    fn deliver(&self, mut ev: RoutedEvent, nick: &str) {
        if ev.notify_eligible && self.deps.notifier.should_notify(&ev, nick, &self.network) {
            ev.highlight = true;
            self.deps.alerts.publish(&Alert {
                network: self.network.clone(),
                event: ev.clone(),
            });
        }
        self.batch.enqueue(ev);
    }

    fn system_line(&self, target: ConversationTarget, text: String) {
        self.batch
            .enqueue(RoutedEvent::new(target, DeliveryKind::System, None, text));
    }

    fn on_dcc(&self, conn: &NetworkConnection, from: &str, payload: &str) {
        let query = ConversationTarget::query(&self.network, from);
        match self.deps.dcc.handle_offer(&self.network, from, payload) {
            Some(Handled::Pending(s)) => {
                self.system_line(query, format!("{from} offers {} (DCC #{}), awaiting decision", describe(&s.kind), s.id));
            }
            Some(Handled::Accepted(s)) => {
                self.system_line(query, format!("Accepted {} from {from} (DCC #{})", describe(&s.kind), s.id));
                let dcc = self.deps.dcc.clone();
                tokio::spawn(async move {
                    if let Err(e) = dcc.connect(s.id).await {
                        tracing::warn!(id = s.id, error = %e, "DCC connect failed");
                        dcc.close(s.id);
                    }
                });
            }
            Some(Handled::Rejected { session, notice }) => {
                self.system_line(query, format!("Rejected {} from {from}", describe(&session.kind)));
                if let Err(e) = conn.handle().try_send(Command::Notice {
                    target: from.to_string(),
                    text: notice,
                }) {
                    tracing::debug!(error = %e, "Could not send DCC rejection notice");
                }
            }
            Some(Handled::Resume { id, position }) => {
                tracing::debug!(network = %self.network, id, position, "DCC resume request");
            }
            None => {}
        }
    }

    fn answer_ctcp(&self, conn: &NetworkConnection, msg: &CtcpMessage) {
        let Some(reply) = ctcp_reply(&msg.verb, msg.params.as_deref()) else {
            tracing::debug!(network = %self.network, verb = %msg.verb, from = %msg.from, "Unanswered CTCP");
            return;
        };
        if let Err(e) = conn.handle().try_send(Command::Notice {
            target: msg.from.clone(),
            text: reply,
        }) {
            tracing::debug!(error = %e, verb = %msg.verb, "Could not send CTCP reply");
        }
    }

    fn show_ctcp_reply(&self, msg: &CtcpMessage) {
        let text = match &msg.params {
            Some(p) => format!("CTCP {} reply from {}: {p}", msg.verb, msg.from),
            None => format!("CTCP {} reply from {}", msg.verb, msg.from),
        };
        self.system_line(ConversationTarget::server(&self.network), text);
    }
}

fn describe(kind: &crate::dcc::DccKind) -> String {
    match kind {
        crate::dcc::DccKind::Chat => "a chat".to_string(),
        crate::dcc::DccKind::File { filename, size: Some(n) } => format!("{filename} ({n} bytes)"),
        crate::dcc::DccKind::File { filename, size: None } => filename.clone(),
    }
}

/// Encoded CTCP reply for a request, if the verb is one we answer.
pub fn ctcp_reply(verb: &str, params: Option<&str>) -> Option<String> {
    let body = match verb.to_ascii_uppercase().as_str() {
        "VERSION" => format!("skein {}", env!("CARGO_PKG_VERSION")),
        "PING" => params.unwrap_or_default().to_string(),
        "TIME" => Utc::now().to_rfc2822(),
        "CLIENTINFO" => CLIENTINFO.to_string(),
        _ => return None,
    };
    let verb = verb.to_ascii_uppercase();
    Some(ctcp::encode(&verb, Some(&body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctcp_replies() {
        assert_eq!(ctcp_reply("ping", Some("123")).as_deref(), Some("\x01PING 123\x01"));
        assert!(ctcp_reply("VERSION", None).unwrap().starts_with("\x01VERSION skein "));
        assert_eq!(
            ctcp_reply("CLIENTINFO", None).as_deref(),
            Some("\x01CLIENTINFO ACTION CLIENTINFO PING TIME VERSION\x01")
        );
        assert!(ctcp_reply("FINGER", None).is_none());
    }
}
