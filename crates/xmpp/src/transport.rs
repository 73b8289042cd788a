use std::time::Duration;

use jid::FullJid;
use xmpp_parsers::minidom::Element;

use fluux_core::config::{Config, DEFAULT_CAPS_NODE, Platform};

use crate::error::ConnectionError;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub jid: String,
    pub password: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    /// Requested resource; the server may assign a different one.
    pub resource: Option<String>,
    /// Deadline for the whole connect, authenticate and bind sequence.
    pub connect_timeout: Duration,
    /// Default timeout for correlated requests.
    pub request_timeout: Duration,
    /// Broadcast an available presence as soon as the session is bound.
    pub send_initial_presence: bool,
    pub caps_node: String,
    /// Overrides platform detection for the advertised identity.
    pub platform: Option<Platform>,
}

impl ConnectionConfig {
    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            password: password.into(),
            server: None,
            port: None,
            resource: None,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            send_initial_presence: true,
            caps_node: DEFAULT_CAPS_NODE.to_string(),
            platform: None,
        }
    }
}

impl From<&Config> for ConnectionConfig {
    fn from(config: &Config) -> Self {
        Self {
            jid: config.account.jid.clone(),
            password: config.account.password.clone(),
            server: config.account.server.clone(),
            port: config.account.port,
            resource: config.account.resource.clone(),
            connect_timeout: Duration::from_secs(config.connection.connect_timeout_seconds.into()),
            request_timeout: Duration::from_secs(config.connection.request_timeout_seconds.into()),
            send_initial_presence: config.connection.send_initial_presence,
            caps_node: config.capabilities.node.clone(),
            platform: config.capabilities.platform,
        }
    }
}

/// Result of resource binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSession {
    /// Full JID assigned by the server.
    pub jid: FullJid,
    /// Stream features advertised after authentication, by namespace.
    pub features: Vec<String>,
}

/// Stanza-level XMPP transport.
///
/// Implementations own socket handling, stream framing, TLS and SASL; the
/// engine only sees parsed top-level stanzas.
pub trait XmppTransport: Send + 'static {
    /// Open the stream to the server.
    fn connect(
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self, ConnectionError>> + Send
    where
        Self: Sized;

    /// Authenticate with the configured credentials. Rejected credentials
    /// must map to `ConnectionError::AuthenticationFailed`.
    fn authenticate(
        &mut self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn bind(
        &mut self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<BoundSession, ConnectionError>> + Send;

    fn send(&mut self, stanza: Element) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Next inbound stanza; `Ok(None)` once the server closed the stream.
    ///
    /// Must be cancel-safe: the session loop drops an in-flight `recv` to
    /// service outbound stanzas and shutdown.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Element>, ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

#[cfg(test)]
mod tests {
    use fluux_core::config::load_config_from_str;

    use super::*;

    #[test]
    fn connection_config_from_core_config() {
        let config = load_config_from_str(
            r#"
[account]
jid = "alice@example.com"
password = "secret"
server = "xmpp.example.com"
port = 5223
resource = "web"

[connection]
connect_timeout_seconds = 10
request_timeout_seconds = 5
send_initial_presence = false

[capabilities]
node = "https://example.com/caps"
platform = "desktop"
"#,
        )
        .unwrap();

        let connection = ConnectionConfig::from(&config);
        assert_eq!(connection.jid, "alice@example.com");
        assert_eq!(connection.server.as_deref(), Some("xmpp.example.com"));
        assert_eq!(connection.port, Some(5223));
        assert_eq!(connection.resource.as_deref(), Some("web"));
        assert_eq!(connection.connect_timeout, Duration::from_secs(10));
        assert_eq!(connection.request_timeout, Duration::from_secs(5));
        assert!(!connection.send_initial_presence);
        assert_eq!(connection.caps_node, "https://example.com/caps");
        assert_eq!(connection.platform, Some(Platform::Desktop));
    }

    #[test]
    fn defaults_for_programmatic_config() {
        let config = ConnectionConfig::new("alice@example.com", "secret");
        assert_eq!(config.caps_node, DEFAULT_CAPS_NODE);
        assert!(config.send_initial_presence);
        assert_eq!(config.platform, None);
    }
}
