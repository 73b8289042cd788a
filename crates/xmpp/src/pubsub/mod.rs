//! PEP notification handling.
//!
//! Each supported node namespace maps to a pure handler that turns a parsed
//! pubsub event into a normalized update.

pub mod avatar;
pub mod bookmarks;
pub mod nick;

use std::collections::HashMap;

use xmpp_parsers::{
    message::Message,
    pubsub::{
        ItemId,
        event::{Item, PubSubEvent},
    },
};

use fluux_core::event::Bookmark;

use crate::stanza::{find_payload, ns};

/// Normalized result of a recognized pubsub notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubUpdate {
    /// `hash` is `None` when the avatar was removed.
    Avatar { jid: String, hash: Option<String> },
    Nick { jid: String, name: String },
    /// The contact withdrew its nickname; nothing to surface.
    NickRetracted { jid: String },
    Bookmarks {
        published: Vec<Bookmark>,
        retracted: Vec<String>,
    },
}

/// Handler for one node: publisher bare JID and the parsed event.
/// Returns `None` when the payload is not recognized.
pub type PubSubHandler = fn(&str, &PubSubEvent) -> Option<PubSubUpdate>;

/// Node namespace to handler table.
#[derive(Clone)]
pub struct PubSubDispatcher {
    handlers: HashMap<String, PubSubHandler>,
}

impl Default for PubSubDispatcher {
    fn default() -> Self {
        let mut dispatcher = Self::empty();
        dispatcher.register(ns::AVATAR_METADATA, avatar::handle_metadata);
        dispatcher.register(ns::NICK, nick::handle_nick);
        dispatcher.register(ns::BOOKMARKS2, bookmarks::handle_bookmarks);
        dispatcher
    }
}

impl PubSubDispatcher {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register or replace the handler for `node`.
    pub fn register(&mut self, node: impl Into<String>, handler: PubSubHandler) {
        self.handlers.insert(node.into(), handler);
    }

    pub fn handles(&self, node: &str) -> bool {
        self.handlers.contains_key(node)
    }

    /// Hand `event` to the handler registered for its node.
    pub fn dispatch(&self, from: &str, event: &PubSubEvent) -> Option<PubSubUpdate> {
        let handler = self.handlers.get(&event.node_name().0)?;
        handler(from, event)
    }
}

/// The pubsub `<event/>` carried by `message`, if any.
pub fn pubsub_event(message: &Message) -> Option<PubSubEvent> {
    find_payload(&message.payloads)
}

/// Items published by `event`; empty for other event kinds.
pub(crate) fn published_items(event: &PubSubEvent) -> &[Item] {
    match event {
        PubSubEvent::PublishedItems { items, .. } => items,
        _ => &[],
    }
}

/// Ids retracted by `event`; empty for other event kinds.
pub(crate) fn retracted_ids(event: &PubSubEvent) -> &[ItemId] {
    match event {
        PubSubEvent::RetractedItems { items, .. } => items,
        _ => &[],
    }
}
