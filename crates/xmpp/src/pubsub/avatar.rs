//! XEP-0084: User Avatar metadata notifications.

use xmpp_parsers::{
    avatar::{Info, Metadata},
    pubsub::event::PubSubEvent,
};

use super::{PubSubUpdate, published_items};

/// Avatar metadata as advertised in an `<info/>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarInfo {
    /// SHA-1 of the image data, hex encoded
    pub id: String,
    pub mime_type: String,
    pub bytes: u32,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub url: Option<String>,
}

impl From<&Info> for AvatarInfo {
    fn from(info: &Info) -> Self {
        Self {
            id: info.id.to_hex(),
            mime_type: info.type_.clone(),
            bytes: info.bytes,
            width: info.width,
            height: info.height,
            url: info.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvatarMetadata {
    /// Empty `<metadata/>`: the publisher disabled its avatar.
    Disabled,
    Info(AvatarInfo),
}

impl From<&Metadata> for AvatarMetadata {
    fn from(metadata: &Metadata) -> Self {
        match metadata.infos.first() {
            None => AvatarMetadata::Disabled,
            Some(info) => AvatarMetadata::Info(info.into()),
        }
    }
}

pub fn handle_metadata(from: &str, event: &PubSubEvent) -> Option<PubSubUpdate> {
    let metadata = published_items(event)
        .iter()
        .filter_map(|item| item.payload.clone())
        .filter_map(|payload| Metadata::try_from(payload).ok())
        .last()?;
    let hash = match AvatarMetadata::from(&metadata) {
        AvatarMetadata::Disabled => None,
        AvatarMetadata::Info(info) => Some(info.id),
    };

    Some(PubSubUpdate::Avatar {
        jid: from.to_string(),
        hash,
    })
}
