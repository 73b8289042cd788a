//! XEP-0115: Entity Capabilities
//!
//! Builds the client's own capability advertisement: the disco#info identity
//! and feature list, the verification string and its SHA-1 hash, and the
//! `<c/>` element attached to outgoing presence.
//!
//! ## Key Components
//!
//! - `Identity`: the disco#info identity, chosen by runtime platform
//! - `build_verification_string()` / `compute_hash()`: XEP-0115 Section 5
//! - `CapabilityAdvertiser`: memoizes the hash and answers disco#info queries
//!
//! ## References
//!
//! - <https://xmpp.org/extensions/xep-0115.html>

use std::sync::{Mutex, OnceLock, PoisonError, RwLock};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures::future::BoxFuture;
use sha1::{Digest, Sha1};
use tracing::debug;
use xmpp_parsers::{
    disco::{self, DiscoInfoResult, Feature},
    iq::{Iq, IqType},
    minidom::Element,
};

use fluux_core::config::Platform;

use crate::stanza::{iq_result_for, ns};

/// Platform assumed until detection completes.
pub const FALLBACK_PLATFORM: Platform = Platform::Web;

/// Features advertised by the engine itself.
pub const DEFAULT_FEATURES: &[&str] = &[
    ns::CAPS,
    ns::CHATSTATES,
    ns::DISCO_INFO,
    "http://jabber.org/protocol/nick+notify",
    "urn:xmpp:avatar:metadata+notify",
    "urn:xmpp:bookmarks:1+notify",
    ns::IDLE,
    ns::PING,
];

/// A disco#info identity (XEP-0030).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub category: String,
    /// The identity `type` attribute.
    pub kind: String,
    pub name: String,
}

impl Identity {
    pub fn new(
        category: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Web => Self::new("client", "web", "Fluux Web"),
            Platform::Desktop => Self::new("client", "pc", "Fluux Desktop"),
            Platform::Mobile => Self::new("client", "phone", "Fluux Mobile"),
        }
    }
}

impl From<&Identity> for disco::Identity {
    fn from(identity: &Identity) -> Self {
        disco::Identity {
            category: identity.category.clone(),
            type_: identity.kind.clone(),
            lang: None,
            name: Some(identity.name.clone()),
        }
    }
}

/// Build the verification string per XEP-0115 Section 5.1:
/// `category/type//name<` followed by every feature suffixed with `<`,
/// features sorted by byte order first.
pub fn build_verification_string<S: AsRef<str>>(identity: &Identity, features: &[S]) -> String {
    let mut sorted: Vec<&str> = features.iter().map(|f| f.as_ref()).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut s = format!("{}/{}//{}<", identity.category, identity.kind, identity.name);
    for feature in sorted {
        s.push_str(feature);
        s.push('<');
    }
    s
}

/// SHA-1 of the UTF-8 verification string, base64 encoded (standard
/// alphabet, padded, no line wrapping).
pub fn compute_hash(verification: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(verification.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Asynchronous runtime platform detection.
pub trait PlatformDetector: Send + Sync {
    fn detect(&self) -> BoxFuture<'_, Option<Platform>>;
}

/// Detection from the compilation target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TargetPlatformDetector;

impl PlatformDetector for TargetPlatformDetector {
    fn detect(&self) -> BoxFuture<'_, Option<Platform>> {
        let platform = if cfg!(any(target_os = "android", target_os = "ios")) {
            Platform::Mobile
        } else if cfg!(target_arch = "wasm32") {
            Platform::Web
        } else {
            Platform::Desktop
        };
        Box::pin(async move { Some(platform) })
    }
}

#[derive(Debug, Clone)]
struct CachedHash {
    platform: Platform,
    hash: String,
}

/// The client's capability advertisement.
///
/// The platform identity is write-once. The hash is memoized per identity
/// and invalidated explicitly when the feature list changes.
#[derive(Debug)]
pub struct CapabilityAdvertiser {
    node: String,
    platform: OnceLock<Platform>,
    features: RwLock<Vec<String>>,
    cache: Mutex<Option<CachedHash>>,
}

impl CapabilityAdvertiser {
    pub fn new(node: impl Into<String>) -> Self {
        Self::with_features(node, DEFAULT_FEATURES.iter().map(|f| f.to_string()).collect())
    }

    pub fn with_features(node: impl Into<String>, features: Vec<String>) -> Self {
        Self {
            node: node.into(),
            platform: OnceLock::new(),
            features: RwLock::new(features),
            cache: Mutex::new(None),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Detected platform, or the fallback before detection.
    pub fn platform(&self) -> Platform {
        self.platform.get().copied().unwrap_or(FALLBACK_PLATFORM)
    }

    pub fn platform_detected(&self) -> bool {
        self.platform.get().is_some()
    }

    /// Record the platform. Returns false if one was already set.
    pub fn set_platform(&self, platform: Platform) -> bool {
        let stored = self.platform.set(platform).is_ok();
        if stored {
            debug!(?platform, "capability platform set");
        }
        stored
    }

    /// Run detection once; later calls return the stored platform.
    pub async fn detect_platform(&self, detector: &dyn PlatformDetector) -> Platform {
        if let Some(platform) = self.platform.get() {
            return *platform;
        }
        if let Some(platform) = detector.detect().await {
            self.set_platform(platform);
        }
        self.platform()
    }

    pub fn identity(&self) -> Identity {
        Identity::for_platform(self.platform())
    }

    pub fn features(&self) -> Vec<String> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the feature list and drop the memoized hash.
    pub fn set_features(&self, features: Vec<String>) {
        *self
            .features
            .write()
            .unwrap_or_else(PoisonError::into_inner) = features;
        self.clear_cache();
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn verification_string(&self) -> String {
        build_verification_string(&self.identity(), &self.features())
    }

    /// The current verification hash.
    pub fn caps_hash(&self) -> String {
        let platform = self.platform();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.as_ref().filter(|cached| cached.platform == platform) {
            return cached.hash.clone();
        }

        let hash = compute_hash(&self.verification_string());
        debug!(?platform, hash = %hash, "capability hash computed");
        *cache = Some(CachedHash {
            platform,
            hash: hash.clone(),
        });
        hash
    }

    /// `<c xmlns='http://jabber.org/protocol/caps' hash='sha-1' node='…' ver='…'/>`
    pub fn caps_element(&self) -> Element {
        Element::builder("c", ns::CAPS)
            .attr("hash", "sha-1")
            .attr("node", self.node.as_str())
            .attr("ver", self.caps_hash())
            .build()
    }

    /// Whether a disco#info query node addresses this advertisement:
    /// no node, or `node#ver` with the current hash.
    pub fn answers_node(&self, node: Option<&str>) -> bool {
        match node {
            None => true,
            Some(node) => node
                .split_once('#')
                .is_some_and(|(base, ver)| base == self.node && ver == self.caps_hash()),
        }
    }

    /// Result IQ answering a disco#info get for `node`.
    pub fn disco_info_response(&self, request: &Iq, node: Option<String>) -> Element {
        let mut features = self.features();
        features.sort_unstable();
        features.dedup();

        let result = DiscoInfoResult {
            node,
            identities: vec![(&self.identity()).into()],
            features: features.into_iter().map(Feature::new).collect(),
            extensions: Vec::new(),
        };
        Iq {
            payload: IqType::Result(Some(result.into())),
            ..iq_result_for(request)
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_verification_string_for_web_identity() {
        let identity = Identity::new("client", "web", "Fluux Web");
        let unsorted = [
            "urn:xmpp:ping",
            "http://jabber.org/protocol/disco#info",
            "http://jabber.org/protocol/caps",
        ];
        let sorted = [
            "http://jabber.org/protocol/caps",
            "http://jabber.org/protocol/disco#info",
            "urn:xmpp:ping",
        ];

        let expected = "client/web//Fluux Web<\
            http://jabber.org/protocol/caps<\
            http://jabber.org/protocol/disco#info<\
            urn:xmpp:ping<";
        assert_eq!(build_verification_string(&identity, &unsorted), expected);
        assert_eq!(build_verification_string(&identity, &sorted), expected);
    }

    #[test]
    fn test_hash_matches_xep0115_example() {
        // XEP-0115 Section 5.2 simple generation example
        let identity = Identity::new("client", "pc", "Exodus 0.9.1");
        let features = [
            "http://jabber.org/protocol/muc",
            "http://jabber.org/protocol/disco#info",
            "http://jabber.org/protocol/caps",
            "http://jabber.org/protocol/disco#items",
        ];
        let verification = build_verification_string(&identity, &features);
        assert_eq!(compute_hash(&verification), "QgayPKawpkPSDYmwT/WM94uAlu0=");
    }

    #[test]
    fn test_hash_is_order_independent() {
        let forward = CapabilityAdvertiser::new("https://fluux.io/caps");
        let mut reversed: Vec<String> = DEFAULT_FEATURES.iter().rev().map(|f| f.to_string()).collect();
        reversed.push(ns::PING.to_string());
        let backward = CapabilityAdvertiser::with_features("https://fluux.io/caps", reversed);

        assert_eq!(forward.caps_hash(), backward.caps_hash());
        assert_eq!(forward.caps_hash(), forward.caps_hash());
    }

    #[test]
    fn test_platform_identities() {
        assert_eq!(Identity::for_platform(Platform::Web).kind, "web");
        assert_eq!(Identity::for_platform(Platform::Desktop).kind, "pc");
        assert_eq!(Identity::for_platform(Platform::Mobile).name, "Fluux Mobile");
    }

    #[test]
    fn test_fallback_before_detection_and_write_once() {
        let caps = CapabilityAdvertiser::new("https://fluux.io/caps");
        assert!(!caps.platform_detected());
        assert_eq!(caps.platform(), Platform::Web);
        let web_hash = caps.caps_hash();

        assert!(caps.set_platform(Platform::Desktop));
        assert!(!caps.set_platform(Platform::Mobile));
        assert_eq!(caps.platform(), Platform::Desktop);
        assert_ne!(caps.caps_hash(), web_hash);
    }

    #[test]
    fn test_set_features_invalidates_hash() {
        let caps = CapabilityAdvertiser::new("https://fluux.io/caps");
        let before = caps.caps_hash();

        let mut features = caps.features();
        features.push("urn:xmpp:receipts".to_string());
        caps.set_features(features);

        assert_ne!(caps.caps_hash(), before);
    }

    #[test]
    fn test_caps_element() {
        let caps = CapabilityAdvertiser::new("https://fluux.io/caps");
        let element = caps.caps_element();
        assert_eq!(element.name(), "c");
        assert_eq!(element.ns(), ns::CAPS);
        assert_eq!(element.attr("hash"), Some("sha-1"));
        assert_eq!(element.attr("node"), Some("https://fluux.io/caps"));
        assert_eq!(element.attr("ver"), Some(caps.caps_hash().as_str()));
    }

    #[test]
    fn test_disco_info_response_lists_identity_and_features() {
        let caps = CapabilityAdvertiser::new("https://fluux.io/caps");
        let node = format!("https://fluux.io/caps#{}", caps.caps_hash());
        let request: Element = format!(
            "<iq xmlns='jabber:client' type='get' id='d1' from='bob@example.com/phone'>\
                <query xmlns='http://jabber.org/protocol/disco#info' node='{node}'/>\
            </iq>"
        )
        .parse()
        .unwrap();
        let request = Iq::try_from(request).unwrap();

        assert!(caps.answers_node(Some(node.as_str())));
        assert!(caps.answers_node(None));
        assert!(!caps.answers_node(Some("https://fluux.io/caps#stale")));

        let reply = caps.disco_info_response(&request, Some(node.clone()));
        assert_eq!(reply.attr("type"), Some("result"));
        assert_eq!(reply.attr("id"), Some("d1"));
        assert_eq!(reply.attr("to"), Some("bob@example.com/phone"));

        let query = reply.get_child("query", ns::DISCO_INFO).unwrap();
        assert_eq!(query.attr("node"), Some(node.as_str()));
        let identity = query.get_child("identity", ns::DISCO_INFO).unwrap();
        assert_eq!(identity.attr("name"), Some("Fluux Web"));
        let features: Vec<_> = query
            .children()
            .filter(|child| child.name() == "feature")
            .filter_map(|child| child.attr("var"))
            .collect();
        assert_eq!(features.len(), DEFAULT_FEATURES.len());
        assert!(features.contains(&ns::PING));
    }

    struct FixedDetector(Option<Platform>);

    impl PlatformDetector for FixedDetector {
        fn detect(&self) -> BoxFuture<'_, Option<Platform>> {
            let platform = self.0;
            Box::pin(async move { platform })
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_detection_runs_once() {
        let caps = CapabilityAdvertiser::new("https://fluux.io/caps");
        assert_eq!(
            caps.detect_platform(&FixedDetector(Some(Platform::Mobile))).await,
            Platform::Mobile
        );
        assert_eq!(
            caps.detect_platform(&FixedDetector(Some(Platform::Desktop))).await,
            Platform::Mobile
        );
        assert_eq!(caps.identity().kind, "phone");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_failed_detection_keeps_fallback() {
        let caps = CapabilityAdvertiser::new("https://fluux.io/caps");
        assert_eq!(caps.detect_platform(&FixedDetector(None)).await, Platform::Web);
        assert!(!caps.platform_detected());
    }

    #[test]
    fn test_concurrent_hash_is_consistent() {
        let caps = Arc::new(CapabilityAdvertiser::new("https://fluux.io/caps"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let caps = Arc::clone(&caps);
                std::thread::spawn(move || caps.caps_hash())
            })
            .collect();
        let hashes: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(hashes.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
