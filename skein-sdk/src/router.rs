//! Inbound target resolution.
//!
//! [`MessageRouter::route`] turns one decoded [`Event`] into a [`Route`]:
//! a delivery to a conversation, a hand-off (DCC, encryption, CTCP), or a
//! drop. Routing never fails; anything it cannot place is dropped with a
//! reason so one bad line cannot stall the pipeline.
//!
//! Priority order for PRIVMSG/NOTICE bodies:
//!
//! 1. self-echo detection (local echo flag; a message to ourselves is dropped)
//! 2. `\x01DCC ...\x01` offers go to the DCC negotiator
//! 3. `!enc-key` / `!enc-msg` / `!chanenc-msg` go to the encryption collaborator
//! 4. classification: notice rules, channel, query, connection category
//! 5. CTCP `ACTION` is delivered as a message; other verbs go to the CTCP handler
//! 6. a relay-injected `[HH:MM:SS]` stamp is stripped from the text

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SettingsStore;
use crate::ctcp::Ctcp;
use crate::event::Event;
use crate::irc::is_channel_name;
use crate::store::{ConversationStore, Encryption, TargetState};
use crate::target::{same_name, ConversationTarget, NetworkId, TargetKind};

/// Where notices (and nick changes) without a channel are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeRouting {
    /// Whatever tab is focused on that network.
    ActiveTab,
    #[default]
    ServerTab,
    /// A dedicated per-network notice view.
    NoticeTab,
    /// A query with the sender.
    QueryTab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Message,
    Action,
    Notice,
    System,
}

/// A decoded event with its resolved destination.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    pub target: ConversationTarget,
    pub kind: DeliveryKind,
    pub from: Option<String>,
    pub text: String,
    /// An encryption key exists for this conversation.
    pub encrypted: bool,
    /// Our own message echoed back by the server.
    pub local_echo: bool,
    /// May trigger an alert (the notifier makes the final call).
    pub notify_eligible: bool,
    /// The notifier asked for an alert.
    pub highlight: bool,
    pub timestamp: DateTime<Utc>,
}

impl RoutedEvent {
    pub fn new(
        target: ConversationTarget,
        kind: DeliveryKind,
        from: Option<String>,
        text: String,
    ) -> Self {
        Self {
            target,
            kind,
            from,
            text,
            encrypted: false,
            local_echo: false,
            notify_eligible: false,
            highlight: false,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionControlKind {
    /// `!enc-key`: key offer or key accept.
    Key,
    /// `!enc-msg`: encrypted private message.
    Message,
    /// `!chanenc-msg`: encrypted channel message.
    ChannelMessage,
}

const ENCRYPTION_PREFIXES: [(&str, EncryptionControlKind); 3] = [
    ("!enc-key", EncryptionControlKind::Key),
    ("!enc-msg", EncryptionControlKind::Message),
    ("!chanenc-msg", EncryptionControlKind::ChannelMessage),
];

#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionControl {
    pub network: NetworkId,
    pub kind: EncryptionControlKind,
    pub from: String,
    pub target: String,
    pub payload: String,
}

/// A CTCP request (PRIVMSG) or reply (NOTICE) other than ACTION.
#[derive(Debug, Clone, PartialEq)]
pub struct CtcpMessage {
    pub from: String,
    pub target: String,
    pub verb: String,
    pub params: Option<String>,
    pub is_reply: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    EmptyTarget,
    WildcardTarget,
    /// A message we sent to ourselves, echoed back.
    SelfEcho,
    /// Nothing to show for this event.
    NotRoutable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Deliver(RoutedEvent),
    Dcc { from: String, payload: String },
    Encryption(EncryptionControl),
    Ctcp(CtcpMessage),
    Drop(DropReason),
}

/// Per-event facts about the connection the event arrived on.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub network: &'a NetworkId,
    /// Display name; notices from an origin with this name are server notices.
    pub network_name: &'a str,
    pub self_nick: &'a str,
}

pub struct MessageRouter {
    settings: SettingsStore,
    store: Arc<dyn ConversationStore>,
    encryption: Arc<dyn Encryption>,
}

impl MessageRouter {
    pub fn new(
        settings: SettingsStore,
        store: Arc<dyn ConversationStore>,
        encryption: Arc<dyn Encryption>,
    ) -> Self {
        Self {
            settings,
            store,
            encryption,
        }
    }

    pub fn route(&self, ctx: &RouteContext<'_>, event: &Event) -> Route {
        match event {
            Event::Message {
                from,
                target,
                text,
                tags,
            } => self.route_privmsg(ctx, from, target, text, tags),
            Event::Notice {
                from,
                target,
                text,
                tags,
            } => self.route_notice(ctx, from.as_deref(), target, text, tags),
            Event::NickChanged { old_nick, new_nick } => {
                let text = if same_name(old_nick, ctx.self_nick) || same_name(new_nick, ctx.self_nick) {
                    format!("You are now known as {new_nick}")
                } else {
                    format!("{old_nick} is now known as {new_nick}")
                };
                let target = self.notice_target(ctx, Some(new_nick));
                Route::Deliver(RoutedEvent::new(target, DeliveryKind::System, None, text))
            }
            Event::ServerNotice { text } => {
                self.connection_category(ctx, strip_relay_timestamp(text).to_string())
            }
            Event::Registered { nick } => {
                self.connection_category(ctx, format!("Registered as {nick}"))
            }
            Event::Connected => self.connection_category(ctx, "Connected".to_string()),
            Event::Disconnected { reason } => {
                self.connection_category(ctx, format!("Disconnected: {reason}"))
            }
            Event::Joined { channel, nick } => {
                self.channel_system(ctx, channel, format!("{nick} has joined {channel}"))
            }
            Event::Parted {
                channel,
                nick,
                reason,
            } => {
                let text = match reason.as_deref() {
                    Some(r) if !r.is_empty() => format!("{nick} has left {channel} ({r})"),
                    _ => format!("{nick} has left {channel}"),
                };
                self.channel_system(ctx, channel, text)
            }
            Event::Kicked {
                channel,
                nick,
                by,
                reason,
            } => self.channel_system(ctx, channel, format!("{nick} was kicked by {by} ({reason})")),
            Event::TopicChanged {
                channel,
                topic,
                set_by,
            } => {
                let text = match set_by {
                    Some(by) => format!("{by} changed the topic to: {topic}"),
                    None => format!("Topic: {topic}"),
                };
                self.channel_system(ctx, channel, text)
            }
            Event::UserQuit { nick, reason } => {
                let query = ConversationTarget::query(ctx.network, nick);
                if self.store.target_state(&query) == TargetState::Open {
                    Route::Deliver(RoutedEvent::new(
                        query,
                        DeliveryKind::System,
                        None,
                        format!("{nick} has quit ({reason})"),
                    ))
                } else {
                    Route::Drop(DropReason::NotRoutable)
                }
            }
            Event::Lag(_) | Event::RawLine(_) => Route::Drop(DropReason::NotRoutable),
        }
    }

    fn route_privmsg(
        &self,
        ctx: &RouteContext<'_>,
        from: &str,
        target: &str,
        text: &str,
        tags: &HashMap<String, String>,
    ) -> Route {
        if let Some(reason) = check_target(target) {
            return Route::Drop(reason);
        }
        let from_self = !from.is_empty() && same_name(from, ctx.self_nick);
        let is_channel = is_channel_name(target);

        if from_self && !is_channel && same_name(target, ctx.self_nick) {
            return Route::Drop(DropReason::SelfEcho);
        }

        if is_dcc_payload(text) {
            if from_self {
                return Route::Drop(DropReason::SelfEcho);
            }
            return Route::Dcc {
                from: from.to_string(),
                payload: text.to_string(),
            };
        }

        if let Some(kind) = encryption_control(text) {
            if from_self {
                return Route::Drop(DropReason::SelfEcho);
            }
            return Route::Encryption(EncryptionControl {
                network: ctx.network.clone(),
                kind,
                from: from.to_string(),
                target: target.to_string(),
                payload: text.to_string(),
            });
        }

        let (kind, body) = match Ctcp::parse(text) {
            Some(ctcp) if ctcp.is("ACTION") => (DeliveryKind::Action, ctcp.params.unwrap_or("")),
            Some(ctcp) => {
                if from_self {
                    return Route::Drop(DropReason::SelfEcho);
                }
                return Route::Ctcp(CtcpMessage {
                    from: from.to_string(),
                    target: target.to_string(),
                    verb: ctcp.verb.to_ascii_uppercase(),
                    params: ctcp.params.map(str::to_string),
                    is_reply: false,
                });
            }
            None => (DeliveryKind::Message, text),
        };
        let body = strip_relay_timestamp(body).to_string();

        let mut routed = if is_channel {
            let mut r = RoutedEvent::new(
                ConversationTarget::channel(ctx.network, target),
                kind,
                Some(from.to_string()).filter(|f| !f.is_empty()),
                body,
            );
            r.encrypted = self.encryption.has_channel_key(target, ctx.network);
            r
        } else if !from.is_empty() {
            // Keyed by the other party, so our echoes and their replies
            // share one conversation.
            let peer = if from_self { target } else { from };
            let mut r = RoutedEvent::new(
                ConversationTarget::query(ctx.network, peer),
                kind,
                Some(from.to_string()),
                body,
            );
            r.encrypted = self.encryption.is_encrypted_for(ctx.network, peer);
            r.local_echo = from_self;
            r
        } else {
            RoutedEvent::new(ConversationTarget::server(ctx.network), DeliveryKind::System, None, body)
        };
        routed.notify_eligible = !from_self && routed.kind != DeliveryKind::System;
        apply_server_time(&mut routed, tags);
        Route::Deliver(routed)
    }

    fn route_notice(
        &self,
        ctx: &RouteContext<'_>,
        from: Option<&str>,
        target: &str,
        text: &str,
        tags: &HashMap<String, String>,
    ) -> Route {
        if target.is_empty() {
            return Route::Drop(DropReason::EmptyTarget);
        }
        let from_self = from.is_some_and(|f| same_name(f, ctx.self_nick));
        let to_self = same_name(target, ctx.self_nick);
        if from_self && to_self {
            return Route::Drop(DropReason::SelfEcho);
        }

        if let Some(ctcp) = Ctcp::parse(text).filter(|c| !c.is("ACTION")) {
            if from_self {
                return Route::Drop(DropReason::SelfEcho);
            }
            return Route::Ctcp(CtcpMessage {
                from: from.unwrap_or_default().to_string(),
                target: target.to_string(),
                verb: ctcp.verb.to_ascii_uppercase(),
                params: ctcp.params.map(str::to_string),
                is_reply: true,
            });
        }

        let body = strip_relay_timestamp(text).to_string();
        let server_like = is_server_like(from, ctx.network_name);

        let (dest, local_echo) = if is_channel_name(target) {
            (ConversationTarget::channel(ctx.network, target), from_self)
        } else if target == "*" || to_self {
            if server_like {
                (ConversationTarget::server(ctx.network), false)
            } else if target == "*" {
                return Route::Drop(DropReason::WildcardTarget);
            } else {
                (self.notice_target(ctx, from), false)
            }
        } else if from_self {
            (ConversationTarget::query(ctx.network, target), true)
        } else {
            (self.notice_target(ctx, from), false)
        };

        let mut routed = RoutedEvent::new(dest, DeliveryKind::Notice, from.map(str::to_string), body);
        routed.local_echo = local_echo;
        routed.notify_eligible = !from_self && !server_like;
        if routed.target.kind == TargetKind::Channel {
            routed.encrypted = self.encryption.has_channel_key(target, ctx.network);
        }
        apply_server_time(&mut routed, tags);
        Route::Deliver(routed)
    }

    /// Resolve the configured notice-routing preference.
    fn notice_target(&self, ctx: &RouteContext<'_>, sender: Option<&str>) -> ConversationTarget {
        let preference = self.settings.get().routing.notice;
        match preference {
            NoticeRouting::ServerTab => ConversationTarget::server(ctx.network),
            NoticeRouting::NoticeTab => ConversationTarget::notices(ctx.network),
            NoticeRouting::QueryTab => match sender.filter(|s| !s.is_empty()) {
                Some(nick) if !is_server_like(Some(nick), ctx.network_name) => {
                    ConversationTarget::query(ctx.network, nick)
                }
                _ => ConversationTarget::server(ctx.network),
            },
            NoticeRouting::ActiveTab => self.active_or_server(ctx.network),
        }
    }

    fn active_or_server(&self, network: &NetworkId) -> ConversationTarget {
        self.store
            .active_target(network)
            .filter(|t| &t.network == network)
            .unwrap_or_else(|| ConversationTarget::server(network))
    }

    /// Raw/system events: the server tab, unless the user closed it.
    fn connection_category(&self, ctx: &RouteContext<'_>, text: String) -> Route {
        let server = ConversationTarget::server(ctx.network);
        let dest = if self.store.target_state(&server) == TargetState::Closed {
            let fallback = self.notice_target(ctx, None);
            if fallback.kind == TargetKind::Server {
                self.active_or_server(ctx.network)
            } else {
                fallback
            }
        } else {
            server
        };
        Route::Deliver(RoutedEvent::new(dest, DeliveryKind::System, None, text))
    }

    fn channel_system(&self, ctx: &RouteContext<'_>, channel: &str, text: String) -> Route {
        if let Some(reason) = check_target(channel) {
            return Route::Drop(reason);
        }
        Route::Deliver(RoutedEvent::new(
            ConversationTarget::channel(ctx.network, channel),
            DeliveryKind::System,
            None,
            text,
        ))
    }
}

fn check_target(target: &str) -> Option<DropReason> {
    if target.trim().is_empty() {
        Some(DropReason::EmptyTarget)
    } else if target == "*" {
        Some(DropReason::WildcardTarget)
    } else {
        None
    }
}

/// `\x01DCC <TYPE> ...` bodies.
pub fn is_dcc_payload(text: &str) -> bool {
    text.strip_prefix('\x01')
        .and_then(|t| t.get(..4))
        .is_some_and(|p| p.eq_ignore_ascii_case("DCC "))
}

fn encryption_control(text: &str) -> Option<EncryptionControlKind> {
    ENCRYPTION_PREFIXES
        .iter()
        .find(|(prefix, _)| {
            text.strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
        })
        .map(|(_, kind)| *kind)
}

/// An origin that looks like a server: missing, dotted, or the network name.
pub fn is_server_like(from: Option<&str>, network_name: &str) -> bool {
    match from {
        None => true,
        Some(f) => f.is_empty() || f.contains('.') || same_name(f, network_name),
    }
}

fn is_stamp(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 10
        && b[0] == b'['
        && b[3] == b':'
        && b[6] == b':'
        && b[9] == b']'
        && [1, 2, 4, 5, 7, 8].iter().all(|&i| b[i].is_ascii_digit())
}

/// Remove a leading `[HH:MM:SS] ` or trailing ` [HH:MM:SS]` stamp added by
/// a bouncer replaying its buffer.
pub fn strip_relay_timestamp(text: &str) -> &str {
    if let Some(head) = text.get(..10)
        && is_stamp(head)
        && let Some(rest) = text[10..].strip_prefix(' ')
    {
        return rest;
    }
    if text.len() >= 11 {
        let split = text.len() - 11;
        if let (Some(body), Some(tail)) = (text.get(..split), text.get(split..))
            && let Some(stamp) = tail.strip_prefix(' ')
            && is_stamp(stamp)
        {
            return body;
        }
    }
    text
}

fn apply_server_time(routed: &mut RoutedEvent, tags: &HashMap<String, String>) {
    if let Some(ts) = tags
        .get("time")
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    {
        routed.timestamp = ts.with_timezone(&Utc);
    }
}
