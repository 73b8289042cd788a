use thiserror::Error;
use xmpp_parsers::{minidom::Element, stanza_error};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("connection timeout")]
    Timeout,

    #[error("not connected")]
    NotConnected,

    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("connection attempt cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// Credential rejection is final; everything else may succeed on a new attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::AuthenticationFailed(_) | ConnectionError::Cancelled
        )
    }
}

/// Failure of a correlated request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,

    /// The session ended before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The peer answered with `type='error'`.
    #[error(transparent)]
    Stanza(#[from] StanzaError),
}

/// An XMPP stanza error (RFC 6120 section 8.3).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error_type} error: {condition}{}", .text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default())]
pub struct StanzaError {
    /// `cancel`, `continue`, `modify`, `auth` or `wait`
    pub error_type: String,
    /// Defined condition element name, e.g. `item-not-found`
    pub condition: String,
    pub text: Option<String>,
}

impl StanzaError {
    /// Stand-in for an error stanza that carries no usable `<error/>` child.
    pub fn undefined() -> Self {
        Self {
            error_type: "cancel".to_string(),
            condition: "undefined-condition".to_string(),
            text: None,
        }
    }
}

impl From<&stanza_error::StanzaError> for StanzaError {
    fn from(error: &stanza_error::StanzaError) -> Self {
        let condition = Element::from(error.defined_condition.clone());
        Self {
            error_type: error.type_.to_string(),
            condition: condition.name().to_string(),
            text: error
                .texts
                .get("")
                .or_else(|| error.texts.values().next())
                .filter(|text| !text.is_empty())
                .cloned(),
        }
    }
}
