//! DCC offer parsing, accept/reject policy and session bookkeeping.
//!
//! Offers arrive as CTCP payloads inside PRIVMSG:
//!
//! ```text
//! \x01DCC CHAT chat <ip> <port>\x01
//! \x01DCC SEND <file> <ip> <port> [<size>]\x01
//! \x01DCC RESUME <file> <port> <position>\x01
//! \x01DCC ACCEPT <file> <port> <position>\x01
//! ```
//!
//! `<ip>` is either a 32-bit decimal in network byte order or a dotted quad.
//! Anything that does not fit the grammar is "not recognized" and produces
//! no session.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::SettingsStore;
use crate::ctcp::Ctcp;
use crate::hub::{Hub, Subscription};
use crate::target::{NetworkId, fold};

/// Session ids wrap back to 1 after this value.
pub const MAX_SESSION_ID: u32 = 1_000_000;

pub fn int_to_ip(n: u32) -> String {
    Ipv4Addr::from(n).to_string()
}

/// Strict dotted-quad parse. Wrong octet counts or out-of-range octets
/// yield `None`.
pub fn ip_to_int(s: &str) -> Option<u32> {
    s.parse::<Ipv4Addr>().ok().map(u32::from)
}

/// Accept either wire form and return a dotted quad.
pub fn normalize_host(s: &str) -> Option<String> {
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse::<u32>().ok().map(int_to_ip)
    } else {
        ip_to_int(s).map(int_to_ip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccOffer {
    Chat {
        host: String,
        port: u16,
    },
    Send {
        filename: String,
        host: String,
        port: u16,
        size: Option<u64>,
    },
    Resume {
        filename: String,
        port: u16,
        position: u64,
    },
    Accept {
        filename: String,
        port: u16,
        position: u64,
    },
}

/// Split a leading filename (optionally double-quoted) from the rest.
fn split_filename(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if let Some(quoted) = s.strip_prefix('"') {
        let end = quoted.find('"')?;
        let name = &quoted[..end];
        (!name.is_empty()).then_some((name, &quoted[end + 1..]))
    } else {
        s.split_once(' ')
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

/// Parse a CTCP DCC payload (with or without the `\x01` delimiters).
pub fn parse_offer(text: &str) -> Option<DccOffer> {
    let body = match Ctcp::parse(text) {
        Some(ctcp) if ctcp.is("DCC") => ctcp.params?,
        Some(_) => return None,
        None => text.strip_prefix("DCC ")?,
    };
    let (kind, rest) = body.trim().split_once(' ')?;
    match kind.to_ascii_uppercase().as_str() {
        "CHAT" => {
            let mut parts = rest.split_whitespace();
            let _protocol = parts.next()?;
            let host = normalize_host(parts.next()?)?;
            let port = parse_port(parts.next()?)?;
            Some(DccOffer::Chat { host, port })
        }
        "SEND" => {
            let (filename, rest) = split_filename(rest)?;
            let mut parts = rest.split_whitespace();
            let host = normalize_host(parts.next()?)?;
            let port = parse_port(parts.next()?)?;
            let size = match parts.next() {
                Some(s) => Some(s.parse::<u64>().ok()?),
                None => None,
            };
            Some(DccOffer::Send {
                filename: filename.to_string(),
                host,
                port,
                size,
            })
        }
        kind @ ("RESUME" | "ACCEPT") => {
            let (filename, rest) = split_filename(rest)?;
            let mut parts = rest.split_whitespace();
            let port = parts.next()?.parse::<u16>().ok()?;
            let position = parts.next()?.parse::<u64>().ok()?;
            let filename = filename.to_string();
            Some(if kind == "RESUME" {
                DccOffer::Resume {
                    filename,
                    port,
                    position,
                }
            } else {
                DccOffer::Accept {
                    filename,
                    port,
                    position,
                }
            })
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DccAction {
    Accept,
    #[default]
    Reject,
}

/// File-offer policy. Patterns are case-insensitive shell globs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DccPolicy {
    /// Always refused, whatever else is configured.
    pub never_send: Vec<String>,
    pub reject: Vec<String>,
    pub accept: Vec<String>,
    /// Once more than this many transfers from a peer were accepted, apply
    /// `default_action` instead of prompting.
    pub auto_accept_after: Option<u32>,
    pub default_action: DccAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRule {
    NeverSend,
    RejectList,
    AcceptList,
    PeerThreshold,
}

impl std::fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PolicyRule::NeverSend => "file type is never accepted",
            PolicyRule::RejectList => "file matches reject list",
            PolicyRule::AcceptList => "file matches accept list",
            PolicyRule::PeerThreshold => "peer auto-accept threshold",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept(PolicyRule),
    Reject(PolicyRule),
    /// Ask the user and wait for [`DccNegotiator::decide`].
    Prompt,
}

fn matches_any(patterns: &[String], filename: &str) -> bool {
    let opts = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    patterns.iter().any(|p| match Pattern::new(p) {
        Ok(pat) => pat.matches_with(filename, opts),
        Err(e) => {
            tracing::warn!(pattern = %p, error = %e, "Invalid DCC filename pattern");
            false
        }
    })
}

impl DccPolicy {
    /// `accepted_from_peer` is the number of transfers already accepted from
    /// the offering peer on this network.
    pub fn decide(&self, filename: &str, accepted_from_peer: u32) -> Decision {
        if matches_any(&self.never_send, filename) {
            return Decision::Reject(PolicyRule::NeverSend);
        }
        if matches_any(&self.reject, filename) {
            return Decision::Reject(PolicyRule::RejectList);
        }
        if matches_any(&self.accept, filename) {
            return Decision::Accept(PolicyRule::AcceptList);
        }
        if let Some(threshold) = self.auto_accept_after
            && accepted_from_peer > threshold
        {
            return match self.default_action {
                DccAction::Accept => Decision::Accept(PolicyRule::PeerThreshold),
                DccAction::Reject => Decision::Reject(PolicyRule::PeerThreshold),
            };
        }
        Decision::Prompt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DccDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DccStatus {
    Pending,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DccKind {
    Chat,
    File { filename: String, size: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DccSession {
    pub id: u32,
    pub peer: String,
    pub network: NetworkId,
    pub direction: DccDirection,
    pub kind: DccKind,
    pub host: String,
    pub port: u16,
    pub status: DccStatus,
    /// `None` until a decision is made.
    pub accepted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DccEvent {
    Offered(DccSession),
    Rejected { session: DccSession, rule: PolicyRule },
    Decided { id: u32, accepted: bool },
    Connected { id: u32 },
    ResumeRequested { id: u32, position: u64 },
    Closed(DccSession),
}

/// What [`DccNegotiator::handle_offer`] did with a recognized offer.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// Waiting on the user.
    Pending(DccSession),
    Accepted(DccSession),
    /// Created and closed straight away; `notice` goes back to the peer.
    Rejected { session: DccSession, notice: String },
    Resume { id: u32, position: u64 },
}

#[derive(Default)]
struct Entry {
    stream: Option<TcpStream>,
    listener_task: Option<JoinHandle<()>>,
    waiters: Vec<oneshot::Sender<bool>>,
}

struct SessionSlot {
    session: DccSession,
    entry: Entry,
}

struct Inner {
    settings: SettingsStore,
    sessions: DashMap<u32, SessionSlot>,
    accepted: DashMap<(NetworkId, String), u32>,
    next_id: AtomicU32,
    events: Hub<DccEvent>,
}

/// Tracks DCC sessions for every network.
#[derive(Clone)]
pub struct DccNegotiator {
    inner: Arc<Inner>,
}

impl DccNegotiator {
    pub fn new(settings: SettingsStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                sessions: DashMap::new(),
                accepted: DashMap::new(),
                next_id: AtomicU32::new(1),
                events: Hub::new(),
            }),
        }
    }

    pub fn subscribe<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&DccEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(cb)
    }

    pub fn session(&self, id: u32) -> Option<DccSession> {
        self.inner.sessions.get(&id).map(|s| s.session.clone())
    }

    pub fn sessions(&self) -> Vec<DccSession> {
        let mut out: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|s| s.session.clone())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Transfers previously accepted from `peer` on `network`.
    pub fn accepted_count(&self, network: &NetworkId, peer: &str) -> u32 {
        self.inner
            .accepted
            .get(&(network.clone(), fold(peer)))
            .map(|c| *c)
            .unwrap_or(0)
    }

    fn allocate_id(&self) -> u32 {
        let mut candidate = 0;
        for _ in 0..MAX_SESSION_ID {
            candidate = self
                .inner
                .next_id
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    Some(if n >= MAX_SESSION_ID { 1 } else { n + 1 })
                })
                .unwrap_or(1);
            if !self.inner.sessions.contains_key(&candidate) {
                break;
            }
        }
        candidate
    }

    fn insert(&self, session: DccSession) {
        self.inner.sessions.insert(
            session.id,
            SessionSlot {
                session,
                entry: Entry::default(),
            },
        );
    }

    fn record_accept(&self, network: &NetworkId, peer: &str) {
        *self
            .inner
            .accepted
            .entry((network.clone(), fold(peer)))
            .or_insert(0) += 1;
    }

    /// Handle a DCC payload from `from`. `None` means the payload was not
    /// recognized (or a resume matched nothing) and nothing was created.
    pub fn handle_offer(&self, network: &NetworkId, from: &str, payload: &str) -> Option<Handled> {
        let Some(offer) = parse_offer(payload) else {
            tracing::debug!(network = %network, from, "Unrecognized DCC payload");
            return None;
        };
        let (kind, host, port) = match offer {
            DccOffer::Chat { host, port } => (DccKind::Chat, host, port),
            DccOffer::Send {
                filename,
                host,
                port,
                size,
            } => (DccKind::File { filename, size }, host, port),
            DccOffer::Resume { port, position, .. } | DccOffer::Accept { port, position, .. } => {
                return self.match_resume(network, from, port, position);
            }
        };

        let mut session = DccSession {
            id: self.allocate_id(),
            peer: from.to_string(),
            network: network.clone(),
            direction: DccDirection::Incoming,
            kind,
            host,
            port,
            status: DccStatus::Pending,
            accepted: None,
        };

        let decision = match &session.kind {
            DccKind::Chat => Decision::Prompt,
            DccKind::File { filename, .. } => {
                let policy = self.inner.settings.get().dcc.clone();
                policy.decide(filename, self.accepted_count(network, from))
            }
        };
        tracing::info!(
            network = %network,
            peer = from,
            id = session.id,
            decision = ?decision,
            "DCC offer"
        );

        match decision {
            Decision::Reject(rule) => {
                session.accepted = Some(false);
                self.insert(session.clone());
                self.inner.events.publish(&DccEvent::Rejected {
                    session: session.clone(),
                    rule,
                });
                self.close(session.id);
                session.status = DccStatus::Closed;
                let what = match &session.kind {
                    DccKind::File { filename, .. } => format!("DCC SEND {filename}"),
                    DccKind::Chat => "DCC CHAT".to_string(),
                };
                Some(Handled::Rejected {
                    notice: format!("{what} rejected: {rule}"),
                    session,
                })
            }
            Decision::Accept(_) => {
                session.accepted = Some(true);
                self.record_accept(network, from);
                self.insert(session.clone());
                self.inner.events.publish(&DccEvent::Offered(session.clone()));
                Some(Handled::Accepted(session))
            }
            Decision::Prompt => {
                self.insert(session.clone());
                self.inner.events.publish(&DccEvent::Offered(session.clone()));
                Some(Handled::Pending(session))
            }
        }
    }

    fn match_resume(&self, network: &NetworkId, from: &str, port: u16, position: u64) -> Option<Handled> {
        let id = self.inner.sessions.iter().find_map(|s| {
            let s = &s.session;
            (s.network == *network && fold(&s.peer) == fold(from) && s.port == port)
                .then_some(s.id)
        })?;
        self.inner
            .events
            .publish(&DccEvent::ResumeRequested { id, position });
        Some(Handled::Resume { id, position })
    }

    /// Record the user's answer for a pending session. Rejecting closes it.
    /// Returns false when the session is unknown or already decided.
    pub fn decide(&self, id: u32, accept: bool) -> bool {
        let (waiters, network, peer) = {
            let Some(mut slot) = self.inner.sessions.get_mut(&id) else {
                return false;
            };
            if slot.session.accepted.is_some() {
                return false;
            }
            slot.session.accepted = Some(accept);
            (
                std::mem::take(&mut slot.entry.waiters),
                slot.session.network.clone(),
                slot.session.peer.clone(),
            )
        };
        for tx in waiters {
            let _ = tx.send(accept);
        }
        if accept {
            self.record_accept(&network, &peer);
        }
        self.inner
            .events
            .publish(&DccEvent::Decided { id, accepted: accept });
        if !accept {
            self.close(id);
        }
        true
    }

    /// Wait until the session is decided. `None` if it is unknown or was
    /// closed first.
    pub async fn wait_for_decision(&self, id: u32) -> Option<bool> {
        let rx = {
            let mut slot = self.inner.sessions.get_mut(&id)?;
            if let Some(decided) = slot.session.accepted {
                return Some(decided);
            }
            let (tx, rx) = oneshot::channel();
            slot.entry.waiters.push(tx);
            rx
        };
        rx.await.ok()
    }

    /// Connect to the endpoint advertised by an incoming offer.
    pub async fn connect(&self, id: u32) -> anyhow::Result<()> {
        let (host, port) = {
            let slot = self
                .inner
                .sessions
                .get(&id)
                .ok_or_else(|| anyhow::anyhow!("no DCC session {id}"))?;
            if slot.session.direction != DccDirection::Incoming {
                anyhow::bail!("DCC session {id} is not incoming");
            }
            (slot.session.host.clone(), slot.session.port)
        };
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| anyhow::anyhow!("DCC connect to {host}:{port} failed: {e}"))?;
        self.attach_stream(id, stream);
        Ok(())
    }

    /// Offer a chat to `peer`: binds an ephemeral listener and returns the
    /// session plus the PRIVMSG line to send.
    pub async fn offer_chat(
        &self,
        network: &NetworkId,
        peer: &str,
        local_ip: Ipv4Addr,
    ) -> anyhow::Result<(DccSession, String)> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = listener.local_addr()?.port();
        let session = DccSession {
            id: self.allocate_id(),
            peer: peer.to_string(),
            network: network.clone(),
            direction: DccDirection::Outgoing,
            kind: DccKind::Chat,
            host: local_ip.to_string(),
            port,
            status: DccStatus::Pending,
            accepted: Some(true),
        };
        let id = session.id;
        self.insert(session.clone());

        let this = self.clone();
        let task = tokio::spawn(async move {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!(id, %addr, "DCC chat peer connected");
                    this.attach_stream(id, stream);
                }
                Err(e) => {
                    tracing::warn!(id, error = %e, "DCC listener failed");
                    this.close(id);
                }
            }
        });
        match self.inner.sessions.get_mut(&id) {
            Some(mut slot) => slot.entry.listener_task = Some(task),
            None => task.abort(),
        }

        let line = format!(
            "PRIVMSG {peer} :\x01DCC CHAT chat {} {port}\x01",
            u32::from(local_ip)
        );
        self.inner.events.publish(&DccEvent::Offered(session.clone()));
        Ok((session, line))
    }

    fn attach_stream(&self, id: u32, stream: TcpStream) {
        {
            let Some(mut slot) = self.inner.sessions.get_mut(&id) else {
                // Closed while connecting; the stream drops here.
                return;
            };
            slot.entry.stream = Some(stream);
            slot.entry.listener_task = None;
            slot.session.status = DccStatus::Connected;
        }
        self.inner.events.publish(&DccEvent::Connected { id });
    }

    /// Hand the connected stream to the caller (chat UI, file writer).
    pub fn take_stream(&self, id: u32) -> Option<TcpStream> {
        self.inner
            .sessions
            .get_mut(&id)
            .and_then(|mut s| s.entry.stream.take())
    }

    /// Close a session: drop its stream, stop its listener, publish
    /// `Closed`. Returns false if it was already gone.
    pub fn close(&self, id: u32) -> bool {
        let Some((_, slot)) = self.inner.sessions.remove(&id) else {
            return false;
        };
        let SessionSlot { mut session, entry } = slot;
        if let Some(task) = entry.listener_task {
            task.abort();
        }
        drop(entry.stream);
        session.status = DccStatus::Closed;
        tracing::debug!(id, peer = %session.peer, "DCC session closed");
        self.inner.events.publish(&DccEvent::Closed(session));
        true
    }

    /// Close every session on `network` (on disconnect).
    pub fn close_network(&self, network: &NetworkId) {
        let ids: Vec<u32> = self
            .inner
            .sessions
            .iter()
            .filter(|s| &s.session.network == network)
            .map(|s| s.session.id)
            .collect();
        for id in ids {
            self.close(id);
        }
    }

    #[cfg(test)]
    fn set_next_id(&self, id: u32) {
        self.inner.next_id.store(id, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use parking_lot::Mutex;

    fn negotiator(policy: DccPolicy) -> DccNegotiator {
        let cfg = ClientConfig {
            dcc: policy,
            ..ClientConfig::default()
        };
        DccNegotiator::new(SettingsStore::new(cfg))
    }

    #[test]
    fn ip_conversions() {
        assert_eq!(int_to_ip(2130706433), "127.0.0.1");
        assert_eq!(ip_to_int("127.0.0.1"), Some(2130706433));
        for s in ["0.0.0.0", "255.255.255.255", "10.1.2.3"] {
            assert_eq!(int_to_ip(ip_to_int(s).unwrap()), s);
        }
        for n in [0u32, 1, 0xC0A80001, u32::MAX] {
            assert_eq!(ip_to_int(&int_to_ip(n)), Some(n));
        }
        assert_eq!(ip_to_int("1.2.3"), None);
        assert_eq!(ip_to_int("1.2.3.4.5"), None);
        assert_eq!(ip_to_int("256.0.0.1"), None);
        assert_eq!(normalize_host("3232235521").as_deref(), Some("192.168.0.1"));
        assert_eq!(normalize_host("4294967296"), None);
    }

    #[test]
    fn parse_chat_offer() {
        assert_eq!(
            parse_offer("\x01DCC CHAT chat 2130706433 12345\x01"),
            Some(DccOffer::Chat {
                host: "127.0.0.1".into(),
                port: 12345
            })
        );
        assert_eq!(parse_offer("\x01DCC CHAT chat 127.0.0.1 bogus\x01"), None);
        assert_eq!(parse_offer("\x01DCC CHAT chat 127.0.0.1\x01"), None);
        assert_eq!(parse_offer("\x01DCC CHAT chat 127.0.0.1 0\x01"), None);
        assert_eq!(parse_offer("\x01DCC\x01"), None);
        assert_eq!(parse_offer("\x01VERSION\x01"), None);
    }

    #[test]
    fn parse_send_offers() {
        assert_eq!(
            parse_offer("\x01DCC SEND report.pdf 3232235521 5000 1024\x01"),
            Some(DccOffer::Send {
                filename: "report.pdf".into(),
                host: "192.168.0.1".into(),
                port: 5000,
                size: Some(1024),
            })
        );
        assert_eq!(
            parse_offer("\x01DCC SEND \"my file.txt\" 10.0.0.1 6000\x01"),
            Some(DccOffer::Send {
                filename: "my file.txt".into(),
                host: "10.0.0.1".into(),
                port: 6000,
                size: None,
            })
        );
        assert_eq!(parse_offer("\x01DCC SEND \"unterminated 10.0.0.1 6000\x01"), None);
        assert_eq!(parse_offer("\x01DCC SEND a.txt 10.0.0.1 6000 huge\x01"), None);
        assert_eq!(
            parse_offer("\x01DCC RESUME a.txt 6000 512\x01"),
            Some(DccOffer::Resume {
                filename: "a.txt".into(),
                port: 6000,
                position: 512
            })
        );
    }

    #[test]
    fn policy_order() {
        let policy = DccPolicy {
            never_send: vec!["*.exe".into()],
            reject: vec!["*.zip".into()],
            accept: vec!["*.txt".into(), "*.EXE".into()],
            auto_accept_after: Some(0),
            default_action: DccAction::Accept,
        };
        assert_eq!(policy.decide("virus.exe", 10), Decision::Reject(PolicyRule::NeverSend));
        assert_eq!(policy.decide("VIRUS.EXE", 10), Decision::Reject(PolicyRule::NeverSend));
        assert_eq!(policy.decide("a.zip", 10), Decision::Reject(PolicyRule::RejectList));
        assert_eq!(policy.decide("notes.TXT", 0), Decision::Accept(PolicyRule::AcceptList));
        assert_eq!(policy.decide("pic.png", 0), Decision::Prompt);
        assert_eq!(policy.decide("pic.png", 1), Decision::Accept(PolicyRule::PeerThreshold));
        assert_eq!(policy.decide("a?c.png", 0), Decision::Prompt);
    }

    #[test]
    fn glob_question_mark() {
        let policy = DccPolicy {
            reject: vec!["file?.bin".into()],
            ..DccPolicy::default()
        };
        assert_eq!(policy.decide("file1.bin", 0), Decision::Reject(PolicyRule::RejectList));
        assert_eq!(policy.decide("file12.bin", 0), Decision::Prompt);
    }

    #[test]
    fn never_send_rejects_and_closes_once() {
        let neg = negotiator(DccPolicy {
            never_send: vec!["*.exe".into()],
            accept: vec!["*".into()],
            auto_accept_after: Some(0),
            default_action: DccAction::Accept,
            ..DccPolicy::default()
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = neg.subscribe(move |e| s.lock().push(e.clone()));
        let net = NetworkId::from("libera");
        let out = neg
            .handle_offer(&net, "mallory", "\x01DCC SEND virus.exe 2130706433 4000 10\x01")
            .unwrap();
        let Handled::Rejected { session, notice } = out else {
            panic!("expected rejection");
        };
        assert_eq!(session.status, DccStatus::Closed);
        assert!(notice.contains("virus.exe"));
        assert!(neg.session(session.id).is_none());
        assert!(!neg.close(session.id));
        let closed = seen
            .lock()
            .iter()
            .filter(|e| matches!(e, DccEvent::Closed(_)))
            .count();
        assert_eq!(closed, 1);
    }

    #[test]
    fn unrecognized_offer_creates_nothing() {
        let neg = negotiator(DccPolicy::default());
        let net = NetworkId::from("libera");
        assert!(neg.handle_offer(&net, "bob", "\x01DCC CHAT chat 1.2.3 80\x01").is_none());
        assert!(neg.sessions().is_empty());
    }

    #[tokio::test]
    async fn prompt_then_decide() {
        let neg = negotiator(DccPolicy::default());
        let net = NetworkId::from("libera");
        let Some(Handled::Pending(session)) =
            neg.handle_offer(&net, "bob", "\x01DCC SEND pic.png 2130706433 4000\x01")
        else {
            panic!("expected prompt");
        };
        let waiter = {
            let neg = neg.clone();
            tokio::spawn(async move { neg.wait_for_decision(session.id).await })
        };
        tokio::task::yield_now().await;
        assert!(neg.decide(session.id, true));
        assert!(!neg.decide(session.id, false));
        assert_eq!(waiter.await.unwrap(), Some(true));
        assert_eq!(neg.accepted_count(&net, "BOB"), 1);
        assert_eq!(neg.wait_for_decision(session.id).await, Some(true));
    }

    #[test]
    fn accepted_count_drives_threshold() {
        let neg = negotiator(DccPolicy {
            auto_accept_after: Some(1),
            default_action: DccAction::Accept,
            ..DccPolicy::default()
        });
        let net = NetworkId::from("libera");
        let offer = "\x01DCC SEND a.bin 2130706433 4000\x01";
        for _ in 0..2 {
            let Some(Handled::Pending(s)) = neg.handle_offer(&net, "bob", offer) else {
                panic!("expected prompt");
            };
            neg.decide(s.id, true);
        }
        assert!(matches!(neg.handle_offer(&net, "bob", offer), Some(Handled::Accepted(_))));
        // Counts are per peer.
        assert!(matches!(neg.handle_offer(&net, "carol", offer), Some(Handled::Pending(_))));
    }

    #[test]
    fn ids_wrap_and_skip_live_sessions() {
        let neg = negotiator(DccPolicy::default());
        let net = NetworkId::from("libera");
        let offer = "\x01DCC CHAT chat 2130706433 4000\x01";
        let Some(Handled::Pending(first)) = neg.handle_offer(&net, "bob", offer) else {
            panic!()
        };
        assert_eq!(first.id, 1);
        neg.set_next_id(MAX_SESSION_ID);
        let Some(Handled::Pending(last)) = neg.handle_offer(&net, "bob", offer) else {
            panic!()
        };
        assert_eq!(last.id, MAX_SESSION_ID);
        let Some(Handled::Pending(wrapped)) = neg.handle_offer(&net, "bob", offer) else {
            panic!()
        };
        // 1 is still in use.
        assert_eq!(wrapped.id, 2);
    }

    #[tokio::test]
    async fn outgoing_chat_listener_closes() {
        let neg = negotiator(DccPolicy::default());
        let net = NetworkId::from("libera");
        let (session, line) = neg
            .offer_chat(&net, "bob", Ipv4Addr::LOCALHOST)
            .await
            .unwrap();
        assert_eq!(
            line,
            format!("PRIVMSG bob :\x01DCC CHAT chat 2130706433 {}\x01", session.port)
        );
        assert_eq!(session.direction, DccDirection::Outgoing);
        assert!(neg.close(session.id));
        assert!(!neg.close(session.id));
    }

    #[tokio::test]
    async fn incoming_chat_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let neg = negotiator(DccPolicy::default());
        let net = NetworkId::from("libera");
        let payload = format!("\x01DCC CHAT chat 2130706433 {port}\x01");
        let Some(Handled::Pending(s)) = neg.handle_offer(&net, "bob", &payload) else {
            panic!()
        };
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        neg.decide(s.id, true);
        neg.connect(s.id).await.unwrap();
        accept.await.unwrap().unwrap();
        assert_eq!(neg.session(s.id).unwrap().status, DccStatus::Connected);
        assert!(neg.take_stream(s.id).is_some());
        assert!(neg.close(s.id));
    }
}
