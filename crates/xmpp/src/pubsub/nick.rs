//! XEP-0172: User Nickname notifications.

use xmpp_parsers::{nick::Nick, pubsub::event::PubSubEvent};

use super::{PubSubUpdate, published_items, retracted_ids};

pub fn handle_nick(from: &str, event: &PubSubEvent) -> Option<PubSubUpdate> {
    let nick = published_items(event)
        .iter()
        .filter_map(|item| item.payload.clone())
        .filter_map(|payload| Nick::try_from(payload).ok())
        .last();

    match nick.map(|Nick(name)| name.trim().to_string()) {
        Some(name) if !name.is_empty() => Some(PubSubUpdate::Nick {
            jid: from.to_string(),
            name,
        }),
        Some(_) => Some(PubSubUpdate::NickRetracted {
            jid: from.to_string(),
        }),
        None if !retracted_ids(event).is_empty() => Some(PubSubUpdate::NickRetracted {
            jid: from.to_string(),
        }),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use xmpp_parsers::minidom::Element;

    use super::*;

    fn event(payload: &str) -> PubSubEvent {
        let element: Element = format!(
            "<event xmlns='http://jabber.org/protocol/pubsub#event'>\
                <items node='http://jabber.org/protocol/nick'>{payload}</items>\
            </event>"
        )
        .parse()
        .unwrap();
        PubSubEvent::try_from(element).unwrap()
    }

    #[test]
    fn published_nick() {
        let event = event("<item><nick xmlns='http://jabber.org/protocol/nick'>Ishmael</nick></item>");
        assert_eq!(
            handle_nick("bob@example.com", &event),
            Some(PubSubUpdate::Nick {
                jid: "bob@example.com".into(),
                name: "Ishmael".into(),
            })
        );
    }

    #[test]
    fn retracted_or_empty_nick() {
        let retracted = event("<retract id='current'/>");
        let empty = event("<item><nick xmlns='http://jabber.org/protocol/nick'/></item>");
        let expected = Some(PubSubUpdate::NickRetracted {
            jid: "bob@example.com".into(),
        });
        assert_eq!(handle_nick("bob@example.com", &retracted), expected);
        assert_eq!(handle_nick("bob@example.com", &empty), expected);
    }

    #[test]
    fn foreign_payload_is_not_recognized() {
        let event = event("<item><mood xmlns='http://jabber.org/protocol/mood'/></item>");
        assert_eq!(handle_nick("bob@example.com", &event), None);
    }
}
