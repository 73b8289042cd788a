use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Lowercase segments of a-z, 0-9 and underscores, separated by dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_'))
        {
            return false;
        }

        matches!(
            name.split('.').next(),
            Some("session" | "contact" | "pubsub" | "message")
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The event envelope published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "contact.presence.changed")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            payload,
        }
    }

    /// Build an event on the payload's canonical channel.
    pub fn from_payload(payload: EventPayload) -> Self {
        let channel = Channel(payload.channel_name().to_string());
        Self::new(channel, payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Session ───────────────────────────────────────────────────
    SessionEstablished {
        jid: String,
    },
    SessionEnded {
        reason: SessionEndReason,
    },

    // ── Contacts ──────────────────────────────────────────────────
    ContactPresenceChanged {
        jid: String,
        status: ContactStatus,
        status_message: Option<String>,
    },
    ContactPresenceError {
        jid: String,
        error: String,
    },
    ContactNameChanged {
        jid: String,
        name: String,
    },
    SubscriptionRequest {
        from: String,
    },

    // ── PubSub ────────────────────────────────────────────────────
    AvatarChanged {
        jid: String,
        hash: Option<String>,
    },
    BookmarksChanged {
        published: Vec<Bookmark>,
        retracted: Vec<String>,
    },

    // ── Messages ──────────────────────────────────────────────────
    MessageReceived {
        message: ChatMessage,
    },
    ChatStateReceived {
        from: String,
        state: ChatState,
    },
}

impl EventPayload {
    /// The channel this payload is published on.
    pub fn channel_name(&self) -> &'static str {
        match self {
            EventPayload::SessionEstablished { .. } => "session.established",
            EventPayload::SessionEnded { .. } => "session.ended",
            EventPayload::ContactPresenceChanged { .. } => "contact.presence.changed",
            EventPayload::ContactPresenceError { .. } => "contact.presence.error",
            EventPayload::ContactNameChanged { .. } => "contact.name.changed",
            EventPayload::SubscriptionRequest { .. } => "contact.subscription.request",
            EventPayload::AvatarChanged { .. } => "pubsub.avatar.changed",
            EventPayload::BookmarksChanged { .. } => "pubsub.bookmarks.changed",
            EventPayload::MessageReceived { .. } => "message.received",
            EventPayload::ChatStateReceived { .. } => "message.chat_state",
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionEndReason {
    /// `disconnect()` was called.
    UserRequested,
    /// The transport went away underneath an online session.
    Unexpected { reason: String },
}

impl SessionEndReason {
    pub fn is_unexpected(&self) -> bool {
        matches!(self, SessionEndReason::Unexpected { .. })
    }
}

/// XMPP presence "show" values (RFC 6121 section 4.7.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceShow {
    /// Available (no <show/> element -- the default)
    Available,
    /// Free for chat
    Chat,
    Away,
    /// Extended away
    Xa,
    /// Do not disturb
    Dnd,
    /// Unavailable (the resource is gone)
    Unavailable,
}

impl PresenceShow {
    /// The `<show/>` text for this value, if one is sent on the wire.
    pub fn as_show_str(&self) -> Option<&'static str> {
        match self {
            PresenceShow::Available | PresenceShow::Unavailable => None,
            PresenceShow::Chat => Some("chat"),
            PresenceShow::Away => Some("away"),
            PresenceShow::Xa => Some("xa"),
            PresenceShow::Dnd => Some("dnd"),
        }
    }
}

/// Aggregated status of a contact across all of its resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContactStatus {
    Online,
    Away,
    Xa,
    Dnd,
    Offline,
}

impl From<PresenceShow> for ContactStatus {
    fn from(show: PresenceShow) -> Self {
        match show {
            PresenceShow::Available | PresenceShow::Chat => ContactStatus::Online,
            PresenceShow::Away => ContactStatus::Away,
            PresenceShow::Xa => ContactStatus::Xa,
            PresenceShow::Dnd => ContactStatus::Dnd,
            PresenceShow::Unavailable => ContactStatus::Offline,
        }
    }
}

impl std::fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ContactStatus::Online => "online",
            ContactStatus::Away => "away",
            ContactStatus::Xa => "xa",
            ContactStatus::Dnd => "dnd",
            ContactStatus::Offline => "offline",
        };
        f.write_str(label)
    }
}

/// A chat message received from a contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned or sender-generated message id, empty if absent
    pub id: String,

    /// Bare JID of the sender
    pub from: String,

    /// Resource the message was sent from, if any
    pub from_resource: Option<String>,

    /// Bare JID of the recipient
    pub to: String,

    pub body: String,

    /// When the message was received (UTC)
    pub timestamp: DateTime<Utc>,

    pub message_type: MessageType,

    /// Thread ID for conversation threading, if present
    pub thread: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Chat,
    Normal,
    Headline,
}

/// XEP-0085 Chat State Notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatState {
    Active,
    Composing,
    Paused,
    Inactive,
    Gone,
}

impl ChatState {
    pub fn from_element_name(name: &str) -> Option<Self> {
        Some(match name {
            "active" => ChatState::Active,
            "composing" => ChatState::Composing,
            "paused" => ChatState::Paused,
            "inactive" => ChatState::Inactive,
            "gone" => ChatState::Gone,
            _ => return None,
        })
    }
}

/// A conference room bookmark (XEP-0402).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    /// Bare JID of the room, also the PEP item id
    pub jid: String,
    pub name: Option<String>,
    pub autojoin: bool,
    pub nick: Option<String>,
    pub password: Option<String>,
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// Broadcast-backed bus. Subscribers filter by glob pattern on the channel
/// name, e.g. `contact.*` or `{session,pubsub}.*`.
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        if !Channel::is_valid(event.channel.as_str()) {
            return Err(EventBusError::InvalidChannel(event.channel.to_string()));
        }

        // No subscribers is not an error: notifications are fire-and-forget.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        if pattern.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();

        Ok(EventSubscription {
            matcher,
            receiver: self.sender.subscribe(),
        })
    }
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn channel_validation() {
        assert!(Channel::is_valid("session.established"));
        assert!(Channel::is_valid("contact.presence.changed"));
        assert!(Channel::is_valid("pubsub.avatar.changed"));
        assert!(Channel::is_valid("message.chat_state"));

        assert!(!Channel::is_valid("ui.theme.changed"));
        assert!(!Channel::is_valid("session..established"));
        assert!(!Channel::is_valid(".session"));
        assert!(!Channel::is_valid("session."));
        assert!(!Channel::is_valid("Session.Established"));
        assert!(!Channel::is_valid("contact-presence"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn channel_domain() {
        let channel = Channel::new("contact.presence.changed").unwrap();
        assert_eq!(channel.domain(), "contact");
        assert_eq!(channel.to_string(), "contact.presence.changed");
    }

    #[test]
    fn every_payload_maps_to_a_valid_channel() {
        let payloads = vec![
            EventPayload::SessionEstablished {
                jid: "alice@example.com/web".into(),
            },
            EventPayload::SessionEnded {
                reason: SessionEndReason::UserRequested,
            },
            EventPayload::ContactPresenceChanged {
                jid: "bob@example.com".into(),
                status: ContactStatus::Away,
                status_message: None,
            },
            EventPayload::ContactPresenceError {
                jid: "bob@example.com".into(),
                error: "forbidden".into(),
            },
            EventPayload::ContactNameChanged {
                jid: "bob@example.com".into(),
                name: "Bob".into(),
            },
            EventPayload::SubscriptionRequest {
                from: "carol@example.com".into(),
            },
            EventPayload::AvatarChanged {
                jid: "bob@example.com".into(),
                hash: None,
            },
            EventPayload::BookmarksChanged {
                published: Vec::new(),
                retracted: Vec::new(),
            },
            EventPayload::ChatStateReceived {
                from: "bob@example.com".into(),
                state: ChatState::Composing,
            },
        ];

        for payload in payloads {
            let name = payload.channel_name();
            assert!(Channel::is_valid(name), "invalid channel {name}");
        }
    }

    #[test]
    fn presence_show_maps_to_contact_status() {
        assert_eq!(ContactStatus::from(PresenceShow::Available), ContactStatus::Online);
        assert_eq!(ContactStatus::from(PresenceShow::Chat), ContactStatus::Online);
        assert_eq!(ContactStatus::from(PresenceShow::Xa), ContactStatus::Xa);
        assert_eq!(
            ContactStatus::from(PresenceShow::Unavailable),
            ContactStatus::Offline
        );
        assert_eq!(PresenceShow::Dnd.as_show_str(), Some("dnd"));
        assert_eq!(PresenceShow::Available.as_show_str(), None);
    }

    #[test]
    fn event_serializes_with_tagged_payload() {
        let event = Event::from_payload(EventPayload::AvatarChanged {
            jid: "bob@example.com".into(),
            hash: Some("abc".into()),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["channel"], "pubsub.avatar.changed");
        assert_eq!(json["payload"]["type"], "avatarChanged");
        assert_eq!(json["payload"]["data"]["hash"], "abc");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn subscription_filters_by_pattern() {
        let bus = BroadcastEventBus::default();
        let mut contacts = bus.subscribe("contact.*").unwrap();

        bus.publish(Event::from_payload(EventPayload::SessionEstablished {
            jid: "alice@example.com/web".into(),
        }))
        .unwrap();
        bus.publish(Event::from_payload(EventPayload::ContactNameChanged {
            jid: "bob@example.com".into(),
            name: "Bob".into(),
        }))
        .unwrap();

        let event = tokio::time::timeout(Duration::from_millis(100), contacts.recv())
            .await
            .expect("timed out")
            .expect("should receive contact event");
        assert_eq!(event.channel.as_str(), "contact.name.changed");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn brace_patterns_span_domains() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("{session,pubsub}.*").unwrap();

        bus.publish(Event::from_payload(EventPayload::AvatarChanged {
            jid: "bob@example.com".into(),
            hash: None,
        }))
        .unwrap();

        let event = sub.recv().await.unwrap();
        assert_matches!(event.payload, EventPayload::AvatarChanged { hash: None, .. });
    }

    #[test]
    fn publish_without_subscribers_succeeds() {
        let bus = BroadcastEventBus::new(4);
        let result = bus.publish(Event::from_payload(EventPayload::SessionEnded {
            reason: SessionEndReason::UserRequested,
        }));
        assert!(result.is_ok());
    }

    #[test]
    fn empty_pattern_is_rejected() {
        let bus = BroadcastEventBus::default();
        assert!(matches!(
            bus.subscribe(""),
            Err(EventBusError::InvalidPattern(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lagging_subscriber_reports_missed_events() {
        let bus = BroadcastEventBus::new(1);
        let mut sub = bus.subscribe("*").unwrap();

        for name in ["a", "b", "c"] {
            bus.publish(Event::from_payload(EventPayload::SubscriptionRequest {
                from: format!("{name}@example.com"),
            }))
            .unwrap();
        }

        assert_matches!(sub.recv().await, Err(EventBusError::Lagged(_)));
    }
}
