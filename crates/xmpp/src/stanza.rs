use chrono::Utc;
use xmpp_parsers::{
    caps::Caps,
    chatstates,
    delay::Delay,
    idle::Idle,
    iq::{Iq, IqType},
    message::{Message, MessageType as WireMessageType},
    minidom::Element,
    muc::user::MucUser,
    presence::{Presence, Show, Type as PresenceType},
    stanza_error,
    vcard_update::VCardUpdate,
};

use fluux_core::event::{ChatMessage, ChatState, MessageType, PresenceShow};
use fluux_presence::PresenceUpdate;

use crate::error::StanzaError;

pub mod ns {
    pub const CLIENT: &str = "jabber:client";
    pub const CAPS: &str = "http://jabber.org/protocol/caps";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const PING: &str = "urn:xmpp:ping";
    pub const PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
    pub const AVATAR_METADATA: &str = "urn:xmpp:avatar:metadata";
    pub const NICK: &str = "http://jabber.org/protocol/nick";
    pub const BOOKMARKS2: &str = "urn:xmpp:bookmarks:1";
    pub const CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
    pub const IDLE: &str = "urn:xmpp:idle:1";
}

pub fn is_iq(stanza: &Element) -> bool {
    stanza.is("iq", ns::CLIENT)
}

pub fn is_presence(stanza: &Element) -> bool {
    stanza.is("presence", ns::CLIENT)
}

pub fn is_message(stanza: &Element) -> bool {
    stanza.is("message", ns::CLIENT)
}

/// First payload that parses as `T`.
pub(crate) fn find_payload<T: TryFrom<Element>>(payloads: &[Element]) -> Option<T> {
    payloads
        .iter()
        .find_map(|payload| T::try_from(payload.clone()).ok())
}

/// Empty `type='result'` reply to an IQ get/set.
pub fn iq_result_for(request: &Iq) -> Iq {
    Iq {
        from: None,
        to: request.from.clone(),
        id: request.id.clone(),
        payload: IqType::Result(None),
    }
}

/// Error condition carried by a `type='error'` stanza's payloads.
fn payload_error(payloads: &[Element]) -> StanzaError {
    find_payload::<stanza_error::StanzaError>(payloads)
        .map(|error| StanzaError::from(&error))
        .unwrap_or_else(StanzaError::undefined)
}

/// Outgoing presence. `caps` is the XEP-0115 `<c/>` element.
pub fn presence(
    show: PresenceShow,
    status: Option<&str>,
    priority: i8,
    caps: Option<Element>,
) -> Element {
    let (presence_type, wire_show) = match show {
        PresenceShow::Unavailable => (PresenceType::Unavailable, None),
        PresenceShow::Available => (PresenceType::None, None),
        PresenceShow::Chat => (PresenceType::None, Some(Show::Chat)),
        PresenceShow::Away => (PresenceType::None, Some(Show::Away)),
        PresenceShow::Xa => (PresenceType::None, Some(Show::Xa)),
        PresenceShow::Dnd => (PresenceType::None, Some(Show::Dnd)),
    };

    let mut presence = Presence::new(presence_type)
        .with_priority(priority)
        .with_payloads(caps.into_iter().collect());
    presence.show = wire_show;
    if let Some(status) = status {
        presence.set_status("", status);
    }
    presence.into()
}

/// What an inbound presence stanza means for the session.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPresence {
    /// Availability change of one resource. `avatar` carries the XEP-0153
    /// photo hint: `Some(None)` means the avatar was removed.
    Update {
        update: PresenceUpdate,
        avatar: Option<Option<String>>,
    },
    Error {
        jid: String,
        error: StanzaError,
    },
    SubscriptionRequest {
        from: String,
    },
    /// Subscription bookkeeping and probes; nothing to surface.
    Ignored {
        presence_type: PresenceType,
    },
}

/// Interpret a presence stanza. `None` when it does not parse, has no
/// sender, or is MUC occupant presence.
pub fn parse_presence(stanza: &Element) -> Option<InboundPresence> {
    let presence = Presence::try_from(stanza.clone()).ok()?;
    let from = presence.from.as_ref()?;
    if is_muc_presence(&presence) {
        return None;
    }

    let jid = from.to_bare().to_string();
    let resource = from
        .resource()
        .map(|resource| resource.to_string())
        .unwrap_or_default();

    let show = match &presence.type_ {
        PresenceType::None | PresenceType::Unavailable => convert_show(&presence),
        PresenceType::Error => {
            return Some(InboundPresence::Error {
                jid,
                error: payload_error(&presence.payloads),
            });
        }
        PresenceType::Subscribe => return Some(InboundPresence::SubscriptionRequest { from: jid }),
        other => {
            return Some(InboundPresence::Ignored {
                presence_type: other.clone(),
            });
        }
    };

    let avatar = if matches!(show, PresenceShow::Unavailable) {
        None
    } else {
        find_payload::<VCardUpdate>(&presence.payloads)
            .and_then(|update| update.photo)
            .map(|photo| photo.data.map(|hash| hex(&hash)))
    };

    let update = PresenceUpdate {
        jid,
        resource,
        show,
        priority: presence.priority,
        status: presence
            .statuses
            .get("")
            .or_else(|| presence.statuses.values().next())
            .cloned(),
        last_interaction: find_payload::<Idle>(&presence.payloads)
            .map(|idle| idle.since.0.with_timezone(&Utc)),
        client: find_payload::<Caps>(&presence.payloads).map(|caps| caps.node),
    };

    Some(InboundPresence::Update { update, avatar })
}

fn is_muc_presence(presence: &Presence) -> bool {
    presence
        .payloads
        .iter()
        .any(|payload| MucUser::try_from(payload.clone()).is_ok())
}

fn convert_show(presence: &Presence) -> PresenceShow {
    if presence.type_ == PresenceType::Unavailable {
        return PresenceShow::Unavailable;
    }
    match presence.show {
        None => PresenceShow::Available,
        Some(Show::Chat) => PresenceShow::Chat,
        Some(Show::Away) => PresenceShow::Away,
        Some(Show::Xa) => PresenceShow::Xa,
        Some(Show::Dnd) => PresenceShow::Dnd,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// What an inbound message stanza means for the session.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Chat(ChatMessage),
    ChatState { from: String, state: ChatState },
}

/// Interpret a direct message. Group chat and error messages are not
/// handled here.
pub fn parse_message(stanza: &Element) -> Option<InboundMessage> {
    let message = Message::try_from(stanza.clone()).ok()?;
    interpret_message(&message)
}

pub(crate) fn interpret_message(message: &Message) -> Option<InboundMessage> {
    let message_type = match message.type_ {
        WireMessageType::Normal => MessageType::Normal,
        WireMessageType::Chat => MessageType::Chat,
        WireMessageType::Headline => MessageType::Headline,
        WireMessageType::Groupchat | WireMessageType::Error => return None,
    };
    let from = message.from.as_ref()?;
    let sender = from.to_bare().to_string();

    if let Some((_, body)) = message.get_best_body(Vec::new()) {
        let timestamp = find_payload::<Delay>(&message.payloads)
            .map(|delay| delay.stamp.0.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        return Some(InboundMessage::Chat(ChatMessage {
            id: message.id.clone().unwrap_or_default(),
            from: sender,
            from_resource: from.resource().map(|resource| resource.to_string()),
            to: message
                .to
                .as_ref()
                .map(|to| to.to_bare().to_string())
                .unwrap_or_default(),
            body: body.0.clone(),
            timestamp,
            message_type,
            thread: message.thread.as_ref().map(|thread| thread.0.clone()),
        }));
    }

    find_payload::<chatstates::ChatState>(&message.payloads).map(|state| {
        InboundMessage::ChatState {
            from: sender,
            state: convert_chat_state(state),
        }
    })
}

fn convert_chat_state(state: chatstates::ChatState) -> ChatState {
    match state {
        chatstates::ChatState::Active => ChatState::Active,
        chatstates::ChatState::Composing => ChatState::Composing,
        chatstates::ChatState::Paused => ChatState::Paused,
        chatstates::ChatState::Inactive => ChatState::Inactive,
        chatstates::ChatState::Gone => ChatState::Gone,
    }
}
