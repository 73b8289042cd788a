use std::sync::Arc;

use tracing::warn;

use fluux_core::event::{
    Bookmark, ChatMessage, ChatState, ContactStatus, Event, EventBus, EventPayload,
    SessionEndReason,
};

/// One-way notification sink for external state containers.
///
/// Called from the session task in stanza order. Implementations must not
/// block and must not call back into the connection manager synchronously.
pub trait StoreBinder: Send + Sync {
    fn on_contact_presence_changed(
        &self,
        jid: &str,
        status: ContactStatus,
        status_message: Option<&str>,
    );

    /// `hash` is `None` when the contact removed its avatar.
    fn on_avatar_changed(&self, jid: &str, hash: Option<&str>);

    fn on_contact_name_changed(&self, jid: &str, name: &str);

    fn on_session_established(&self, jid: &str);

    fn on_session_ended(&self, reason: &SessionEndReason);

    fn on_message(&self, message: &ChatMessage);

    fn on_contact_presence_error(&self, _jid: &str, _error: &str) {}

    fn on_subscription_request(&self, _from: &str) {}

    fn on_chat_state(&self, _from: &str, _state: ChatState) {}

    fn on_bookmarks_changed(&self, _published: &[Bookmark], _retracted: &[String]) {}
}

/// Republishes every notification on the event bus.
pub struct EventBusBinder {
    bus: Arc<dyn EventBus>,
}

impl EventBusBinder {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    fn publish(&self, payload: EventPayload) {
        let channel = payload.channel_name();
        if let Err(error) = self.bus.publish(Event::from_payload(payload)) {
            warn!(channel, %error, "failed to publish event");
        }
    }
}

impl StoreBinder for EventBusBinder {
    fn on_contact_presence_changed(
        &self,
        jid: &str,
        status: ContactStatus,
        status_message: Option<&str>,
    ) {
        self.publish(EventPayload::ContactPresenceChanged {
            jid: jid.to_string(),
            status,
            status_message: status_message.map(str::to_string),
        });
    }

    fn on_avatar_changed(&self, jid: &str, hash: Option<&str>) {
        self.publish(EventPayload::AvatarChanged {
            jid: jid.to_string(),
            hash: hash.map(str::to_string),
        });
    }

    fn on_contact_name_changed(&self, jid: &str, name: &str) {
        self.publish(EventPayload::ContactNameChanged {
            jid: jid.to_string(),
            name: name.to_string(),
        });
    }

    fn on_session_established(&self, jid: &str) {
        self.publish(EventPayload::SessionEstablished {
            jid: jid.to_string(),
        });
    }

    fn on_session_ended(&self, reason: &SessionEndReason) {
        self.publish(EventPayload::SessionEnded {
            reason: reason.clone(),
        });
    }

    fn on_message(&self, message: &ChatMessage) {
        self.publish(EventPayload::MessageReceived {
            message: message.clone(),
        });
    }

    fn on_contact_presence_error(&self, jid: &str, error: &str) {
        self.publish(EventPayload::ContactPresenceError {
            jid: jid.to_string(),
            error: error.to_string(),
        });
    }

    fn on_subscription_request(&self, from: &str) {
        self.publish(EventPayload::SubscriptionRequest {
            from: from.to_string(),
        });
    }

    fn on_chat_state(&self, from: &str, state: ChatState) {
        self.publish(EventPayload::ChatStateReceived {
            from: from.to_string(),
            state,
        });
    }

    fn on_bookmarks_changed(&self, published: &[Bookmark], retracted: &[String]) {
        self.publish(EventPayload::BookmarksChanged {
            published: published.to_vec(),
            retracted: retracted.to_vec(),
        });
    }
}
