pub mod caps;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod pubsub;
pub mod router;
pub mod stanza;
pub mod store;
pub mod transport;

pub use caps::{CapabilityAdvertiser, Identity, PlatformDetector, TargetPlatformDetector};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use correlator::{PendingResponse, RequestCorrelator, Resolution};
pub use error::{ConnectionError, RequestError, StanzaError};
pub use pubsub::{PubSubDispatcher, PubSubUpdate};
pub use router::{EventRouter, RouteOutcome};
pub use store::{EventBusBinder, StoreBinder};
pub use transport::{BoundSession, XmppTransport};
