//! XEP-0402: PEP Native Bookmarks notifications.

use jid::BareJid;
use xmpp_parsers::{
    bookmarks2::{Autojoin, Conference},
    pubsub::event::PubSubEvent,
};

use fluux_core::event::Bookmark;

use super::{PubSubUpdate, published_items, retracted_ids};

/// Build a bookmark from a `<conference/>` payload. The item id is the room
/// JID and must name a room, not just a service.
pub fn parse_bookmark(item_id: &str, conference: &Conference) -> Option<Bookmark> {
    let room = BareJid::new(item_id).ok().filter(|room| room.node().is_some())?;

    Some(Bookmark {
        jid: room.to_string(),
        name: conference.name.clone(),
        autojoin: conference.autojoin == Autojoin::True,
        nick: conference.nick.clone(),
        password: conference.password.clone(),
    })
}

pub fn handle_bookmarks(_from: &str, event: &PubSubEvent) -> Option<PubSubUpdate> {
    let published: Vec<Bookmark> = published_items(event)
        .iter()
        .filter_map(|item| {
            let id = item.id.as_ref()?;
            let conference = Conference::try_from(item.payload.clone()?).ok()?;
            parse_bookmark(&id.0, &conference)
        })
        .collect();
    let retracted: Vec<String> = retracted_ids(event).iter().map(|id| id.0.clone()).collect();

    if published.is_empty() && retracted.is_empty() {
        return None;
    }
    Some(PubSubUpdate::Bookmarks {
        published,
        retracted,
    })
}
