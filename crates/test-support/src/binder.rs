use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use fluux_core::event::{Bookmark, ChatMessage, ChatState, ContactStatus, SessionEndReason};
use fluux_xmpp::StoreBinder;

/// One recorded binder notification.
#[derive(Debug, Clone, PartialEq)]
pub enum BinderEvent {
    PresenceChanged {
        jid: String,
        status: ContactStatus,
        status_message: Option<String>,
    },
    PresenceError {
        jid: String,
        error: String,
    },
    AvatarChanged {
        jid: String,
        hash: Option<String>,
    },
    NameChanged {
        jid: String,
        name: String,
    },
    SessionEstablished {
        jid: String,
    },
    SessionEnded(SessionEndReason),
    Message(ChatMessage),
    SubscriptionRequest {
        from: String,
    },
    ChatState {
        from: String,
        state: ChatState,
    },
    BookmarksChanged {
        published: Vec<Bookmark>,
        retracted: Vec<String>,
    },
}

/// Store binder that keeps every notification for later assertions.
#[derive(Default)]
pub struct RecordingBinder {
    events: Mutex<Vec<BinderEvent>>,
    activity: Notify,
}

impl RecordingBinder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BinderEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<BinderEvent> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Wait until a recorded event matches `predicate` and return it.
    pub async fn wait_for(&self, predicate: impl Fn(&BinderEvent) -> bool) -> BinderEvent {
        loop {
            let notified = self.activity.notified();
            if let Some(event) = self.lock().iter().find(|event| predicate(event)).cloned() {
                return event;
            }
            notified.await;
        }
    }

    fn record(&self, event: BinderEvent) {
        self.lock().push(event);
        self.activity.notify_waiters();
    }
}

impl StoreBinder for RecordingBinder {
    fn on_contact_presence_changed(
        &self,
        jid: &str,
        status: ContactStatus,
        status_message: Option<&str>,
    ) {
        self.record(BinderEvent::PresenceChanged {
            jid: jid.to_string(),
            status,
            status_message: status_message.map(str::to_string),
        });
    }

    fn on_avatar_changed(&self, jid: &str, hash: Option<&str>) {
        self.record(BinderEvent::AvatarChanged {
            jid: jid.to_string(),
            hash: hash.map(str::to_string),
        });
    }

    fn on_contact_name_changed(&self, jid: &str, name: &str) {
        self.record(BinderEvent::NameChanged {
            jid: jid.to_string(),
            name: name.to_string(),
        });
    }

    fn on_session_established(&self, jid: &str) {
        self.record(BinderEvent::SessionEstablished {
            jid: jid.to_string(),
        });
    }

    fn on_session_ended(&self, reason: &SessionEndReason) {
        self.record(BinderEvent::SessionEnded(reason.clone()));
    }

    fn on_message(&self, message: &ChatMessage) {
        self.record(BinderEvent::Message(message.clone()));
    }

    fn on_contact_presence_error(&self, jid: &str, error: &str) {
        self.record(BinderEvent::PresenceError {
            jid: jid.to_string(),
            error: error.to_string(),
        });
    }

    fn on_subscription_request(&self, from: &str) {
        self.record(BinderEvent::SubscriptionRequest {
            from: from.to_string(),
        });
    }

    fn on_chat_state(&self, from: &str, state: ChatState) {
        self.record(BinderEvent::ChatState {
            from: from.to_string(),
            state,
        });
    }

    fn on_bookmarks_changed(&self, published: &[Bookmark], retracted: &[String]) {
        self.record(BinderEvent::BookmarksChanged {
            published: published.to_vec(),
            retracted: retracted.to_vec(),
        });
    }
}
