//! Collaborator interfaces consumed by the routing pipeline, plus an
//! in-memory conversation store.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use crate::router::{DeliveryKind, EncryptionControl, RoutedEvent};
use crate::target::{ConversationTarget, NetworkId, TargetKind};

/// Maximum number of lines kept per conversation.
const MAX_LINES: usize = 1000;

/// Whether a conversation tab exists from the user's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Open,
    /// Existed, then the user closed it.
    Closed,
    /// Never created.
    Unknown,
}

/// Opaque tab handle issued by a [`ConversationStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(pub u64);

/// Owner of conversation/tab state (persistence and UI live behind it).
pub trait ConversationStore: Send + Sync {
    fn target_state(&self, target: &ConversationTarget) -> TargetState;
    /// The tab currently focused on `network`, if any.
    fn active_target(&self, network: &NetworkId) -> Option<ConversationTarget>;
    fn find_or_create(&self, target: &ConversationTarget) -> TabId;
    fn append(&self, tab: TabId, event: &RoutedEvent);
    fn mark_activity(&self, tab: TabId, highlight: bool);
}

/// End-to-end encryption collaborator.
pub trait Encryption: Send + Sync {
    fn is_encrypted_for(&self, network: &NetworkId, peer: &str) -> bool;
    fn has_channel_key(&self, channel: &str, network: &NetworkId) -> bool;
    /// Key offers, key accepts and encrypted payloads land here.
    fn handle_control(&self, control: &EncryptionControl);
}

/// Used when no encryption support is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEncryption;

impl Encryption for NoEncryption {
    fn is_encrypted_for(&self, _network: &NetworkId, _peer: &str) -> bool {
        false
    }

    fn has_channel_key(&self, _channel: &str, _network: &NetworkId) -> bool {
        false
    }

    fn handle_control(&self, control: &EncryptionControl) {
        tracing::debug!(
            network = %control.network,
            from = %control.from,
            kind = ?control.kind,
            "Encryption control message ignored (no encryption configured)"
        );
    }
}

/// Gate for sound/visual alerts on notify-eligible events.
pub trait Notifier: Send + Sync {
    fn should_notify(&self, event: &RoutedEvent, self_nick: &str, network: &NetworkId) -> bool;
}

/// Alerts on every private message and on channel lines mentioning us.
#[derive(Debug, Default, Clone, Copy)]
pub struct MentionNotifier;

impl Notifier for MentionNotifier {
    fn should_notify(&self, event: &RoutedEvent, self_nick: &str, _network: &NetworkId) -> bool {
        match event.target.kind {
            TargetKind::Query => true,
            TargetKind::Channel => mentions(&event.text, self_nick),
            TargetKind::Notice | TargetKind::Server => event.kind == DeliveryKind::Notice,
        }
    }
}

/// Whole-word, case-insensitive nick mention.
pub fn mentions(text: &str, nick: &str) -> bool {
    if nick.is_empty() {
        return false;
    }
    text.split(|c: char| !(c.is_alphanumeric() || "-_[]{}\\|^`".contains(c)))
        .any(|w| w.eq_ignore_ascii_case(nick))
}

/// One conversation held by [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct Tab {
    pub id: TabId,
    pub target: ConversationTarget,
    pub lines: VecDeque<RoutedEvent>,
    pub unread: usize,
    pub highlighted: bool,
}

#[derive(Default)]
struct MemoryInner {
    next_id: u64,
    tabs: HashMap<TabId, Tab>,
    index: HashMap<ConversationTarget, TabId>,
    closed: HashSet<ConversationTarget>,
    focus: HashMap<NetworkId, ConversationTarget>,
}

/// In-process [`ConversationStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// User closed a tab. Later deliveries may reopen it.
    pub fn close(&self, target: &ConversationTarget) {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.index.remove(target) {
            inner.tabs.remove(&id);
            inner.closed.insert(target.clone());
            if inner.focus.get(&target.network) == Some(target) {
                inner.focus.remove(&target.network);
            }
        }
    }

    /// User focused a tab; clears its unread state.
    pub fn focus(&self, target: &ConversationTarget) {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.index.get(target).copied()
            && let Some(tab) = inner.tabs.get_mut(&id)
        {
            tab.unread = 0;
            tab.highlighted = false;
        }
        inner.focus.insert(target.network.clone(), target.clone());
    }

    pub fn tab(&self, target: &ConversationTarget) -> Option<Tab> {
        let inner = self.inner.lock();
        inner
            .index
            .get(target)
            .and_then(|id| inner.tabs.get(id))
            .cloned()
    }

    pub fn lines(&self, target: &ConversationTarget) -> Vec<RoutedEvent> {
        self.tab(target)
            .map(|t| t.lines.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn targets(&self) -> Vec<ConversationTarget> {
        let inner = self.inner.lock();
        let mut out: Vec<_> = inner.index.keys().cloned().collect();
        out.sort_by_key(|t| t.key());
        out
    }
}

impl ConversationStore for MemoryStore {
    fn target_state(&self, target: &ConversationTarget) -> TargetState {
        let inner = self.inner.lock();
        if inner.index.contains_key(target) {
            TargetState::Open
        } else if inner.closed.contains(target) {
            TargetState::Closed
        } else {
            TargetState::Unknown
        }
    }

    fn active_target(&self, network: &NetworkId) -> Option<ConversationTarget> {
        self.inner.lock().focus.get(network).cloned()
    }

    fn find_or_create(&self, target: &ConversationTarget) -> TabId {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.index.get(target) {
            return *id;
        }
        inner.next_id += 1;
        let id = TabId(inner.next_id);
        inner.closed.remove(target);
        inner.index.insert(target.clone(), id);
        inner.tabs.insert(
            id,
            Tab {
                id,
                target: target.clone(),
                lines: VecDeque::new(),
                unread: 0,
                highlighted: false,
            },
        );
        tracing::debug!(target = %target, "Opened conversation");
        id
    }

    fn append(&self, tab: TabId, event: &RoutedEvent) {
        if let Some(tab) = self.inner.lock().tabs.get_mut(&tab) {
            tab.lines.push_back(event.clone());
            if tab.lines.len() > MAX_LINES {
                tab.lines.pop_front();
            }
        }
    }

    fn mark_activity(&self, tab: TabId, highlight: bool) {
        let mut inner = self.inner.lock();
        let focused = inner
            .tabs
            .get(&tab)
            .map(|t| inner.focus.get(&t.target.network) == Some(&t.target))
            .unwrap_or(false);
        if focused {
            return;
        }
        if let Some(t) = inner.tabs.get_mut(&tab) {
            t.unread += 1;
            t.highlighted |= highlight;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(target: &ConversationTarget, text: &str) -> RoutedEvent {
        RoutedEvent::new(target.clone(), DeliveryKind::Message, Some("bob".into()), text.into())
    }

    #[test]
    fn lifecycle_open_closed_unknown() {
        let store = MemoryStore::new();
        let net = NetworkId::from("libera");
        let server = ConversationTarget::server(&net);
        assert_eq!(store.target_state(&server), TargetState::Unknown);
        store.find_or_create(&server);
        assert_eq!(store.target_state(&server), TargetState::Open);
        store.close(&server);
        assert_eq!(store.target_state(&server), TargetState::Closed);
        store.find_or_create(&server);
        assert_eq!(store.target_state(&server), TargetState::Open);
    }

    #[test]
    fn unread_only_for_unfocused_tabs() {
        let store = MemoryStore::new();
        let net = NetworkId::from("libera");
        let a = ConversationTarget::channel(&net, "#a");
        let b = ConversationTarget::channel(&net, "#b");
        let ta = store.find_or_create(&a);
        let tb = store.find_or_create(&b);
        store.focus(&a);
        store.append(ta, &event(&a, "x"));
        store.mark_activity(ta, false);
        store.append(tb, &event(&b, "y"));
        store.mark_activity(tb, true);
        assert_eq!(store.tab(&a).unwrap().unread, 0);
        let tab_b = store.tab(&b).unwrap();
        assert_eq!(tab_b.unread, 1);
        assert!(tab_b.highlighted);
        assert_eq!(store.active_target(&net), Some(a));
    }

    #[test]
    fn mention_matching() {
        assert!(mentions("hey skein, ping", "skein"));
        assert!(mentions("SKEIN: hi", "skein"));
        assert!(!mentions("skeinbot says hi", "skein"));
        assert!(!mentions("anything", ""));
    }
}
