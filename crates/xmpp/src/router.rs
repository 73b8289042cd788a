use std::{collections::HashMap, sync::Arc};

use jid::BareJid;
use tracing::debug;
use xmpp_parsers::{
    disco::DiscoInfoQuery,
    iq::{Iq, IqType},
    message::Message,
    minidom::Element,
    ping::Ping,
    pubsub::event::PubSubEvent,
};

use fluux_presence::PresenceAggregator;

use crate::{
    caps::CapabilityAdvertiser,
    correlator::{RequestCorrelator, Resolution},
    pubsub::{PubSubDispatcher, PubSubUpdate, pubsub_event},
    stanza::{
        InboundMessage, InboundPresence, interpret_message, iq_result_for, is_iq, is_message,
        is_presence, parse_presence,
    },
    store::StoreBinder,
};

/// Which branch consumed an inbound stanza.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// IQ response for a request this session issued.
    Response(Resolution),
    Presence,
    PubSub,
    Message,
    /// A query addressed to us; the reply must be sent back.
    Query(Element),
    Unhandled,
}

impl RouteOutcome {
    pub fn handled(&self) -> bool {
        !matches!(self, RouteOutcome::Unhandled)
    }
}

/// Dispatches inbound stanzas to the correlator, the presence aggregator
/// and the feature handlers, and reports results to the store binder.
pub struct EventRouter {
    account: BareJid,
    correlator: Arc<RequestCorrelator>,
    caps: Arc<CapabilityAdvertiser>,
    binder: Arc<dyn StoreBinder>,
    presence: PresenceAggregator,
    pubsub: PubSubDispatcher,
    avatars: HashMap<String, Option<String>>,
}

impl EventRouter {
    /// `account` is our own JID; PEP events without a sender are ours.
    pub fn new(
        account: BareJid,
        correlator: Arc<RequestCorrelator>,
        caps: Arc<CapabilityAdvertiser>,
        binder: Arc<dyn StoreBinder>,
    ) -> Self {
        Self {
            account,
            correlator,
            caps,
            binder,
            presence: PresenceAggregator::new(),
            pubsub: PubSubDispatcher::default(),
            avatars: HashMap::new(),
        }
    }

    pub fn with_pubsub(mut self, pubsub: PubSubDispatcher) -> Self {
        self.pubsub = pubsub;
        self
    }

    pub fn presence(&self) -> &PresenceAggregator {
        &self.presence
    }

    /// Forget per-session state.
    pub fn reset(&mut self) {
        self.presence.clear();
        self.avatars.clear();
    }

    /// Route one stanza: IQ responses first, then presence, pubsub events,
    /// messages and finally IQ queries. Stanzas that fail to parse are
    /// unhandled.
    pub fn route(&mut self, stanza: &Element) -> RouteOutcome {
        if is_iq(stanza) {
            return self.route_iq(stanza);
        }

        if is_presence(stanza) {
            return self.route_presence(stanza);
        }

        if is_message(stanza) {
            return self.route_message(stanza);
        }

        debug!(name = %stanza.name(), "unhandled stanza");
        RouteOutcome::Unhandled
    }

    fn route_iq(&self, stanza: &Element) -> RouteOutcome {
        let iq = match Iq::try_from(stanza.clone()) {
            Ok(iq) => iq,
            Err(error) => {
                debug!(%error, "malformed iq");
                return RouteOutcome::Unhandled;
            }
        };

        if matches!(iq.payload, IqType::Result(_) | IqType::Error(_)) {
            return match self.correlator.resolve(iq) {
                Resolution::Unknown => RouteOutcome::Unhandled,
                resolution => RouteOutcome::Response(resolution),
            };
        }

        match &iq.payload {
            IqType::Get(payload) => self.route_query(&iq, payload),
            _ => RouteOutcome::Unhandled,
        }
    }

    fn route_presence(&mut self, stanza: &Element) -> RouteOutcome {
        let Some(inbound) = parse_presence(stanza) else {
            return RouteOutcome::Unhandled;
        };

        match inbound {
            InboundPresence::Update { update, avatar } => {
                let jid = update.jid.clone();
                let outcome = self.presence.apply_presence(update);
                if outcome.changed {
                    self.binder.on_contact_presence_changed(
                        &jid,
                        outcome.presence.status,
                        outcome.presence.status_message.as_deref(),
                    );
                }
                if let Some(hash) = avatar {
                    self.update_avatar(&jid, hash);
                }
            }
            InboundPresence::Error { jid, error } => {
                let condition = error.condition;
                if self.presence.apply_error(&jid, condition.as_str()) {
                    self.binder.on_contact_presence_error(&jid, &condition);
                }
            }
            InboundPresence::SubscriptionRequest { from } => {
                debug!(from = %from, "subscription request received");
                self.binder.on_subscription_request(&from);
            }
            InboundPresence::Ignored { presence_type } => {
                debug!(?presence_type, "presence ignored");
            }
        }
        RouteOutcome::Presence
    }

    fn route_message(&mut self, stanza: &Element) -> RouteOutcome {
        let message = match Message::try_from(stanza.clone()) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, "malformed message");
                return RouteOutcome::Unhandled;
            }
        };

        if let Some(event) = pubsub_event(&message) {
            return self.route_pubsub(&message, &event);
        }

        match interpret_message(&message) {
            Some(InboundMessage::Chat(message)) => {
                debug!(from = %message.from, id = %message.id, "message received");
                self.binder.on_message(&message);
                RouteOutcome::Message
            }
            Some(InboundMessage::ChatState { from, state }) => {
                self.binder.on_chat_state(&from, state);
                RouteOutcome::Message
            }
            None => RouteOutcome::Unhandled,
        }
    }

    fn route_pubsub(&mut self, message: &Message, event: &PubSubEvent) -> RouteOutcome {
        let from = message
            .from
            .as_ref()
            .map(|from| from.to_bare())
            .unwrap_or_else(|| self.account.clone())
            .to_string();

        let Some(update) = self.pubsub.dispatch(&from, event) else {
            debug!(from = %from, node = %event.node_name().0, "pubsub event not recognized");
            return RouteOutcome::Unhandled;
        };

        match update {
            PubSubUpdate::Avatar { jid, hash } => self.update_avatar(&jid, hash),
            PubSubUpdate::Nick { jid, name } => self.binder.on_contact_name_changed(&jid, &name),
            PubSubUpdate::NickRetracted { jid } => {
                debug!(jid = %jid, "nickname retracted");
            }
            PubSubUpdate::Bookmarks {
                published,
                retracted,
            } => self.binder.on_bookmarks_changed(&published, &retracted),
        }
        RouteOutcome::PubSub
    }

    fn route_query(&self, iq: &Iq, payload: &Element) -> RouteOutcome {
        if let Ok(query) = DiscoInfoQuery::try_from(payload.clone()) {
            if self.caps.answers_node(query.node.as_deref()) {
                return RouteOutcome::Query(self.caps.disco_info_response(iq, query.node));
            }
            return RouteOutcome::Unhandled;
        }

        if Ping::try_from(payload.clone()).is_ok() {
            return RouteOutcome::Query(iq_result_for(iq).into());
        }

        RouteOutcome::Unhandled
    }

    fn update_avatar(&mut self, jid: &str, hash: Option<String>) {
        if self.avatars.get(jid) == Some(&hash) {
            return;
        }
        self.binder.on_avatar_changed(jid, hash.as_deref());
        self.avatars.insert(jid.to_string(), hash);
    }
}
