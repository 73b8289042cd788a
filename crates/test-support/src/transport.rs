//! In-memory transport driven by a per-account script.
//!
//! `ConnectionManager` builds its transport through `XmppTransport::connect`,
//! so scripts are looked up by the bare JID of the connecting account. Each
//! test installs a [`ScriptedServer`] for its own account and can run in
//! parallel with the others.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use jid::{BareJid, Jid};
use tokio::sync::{Notify, mpsc};
use xmpp_parsers::minidom::Element;

use fluux_xmpp::{BoundSession, ConnectionConfig, ConnectionError, XmppTransport, stanza::ns};

use crate::fixtures;

const DEFAULT_RESOURCE: &str = "fluux";

enum Inbound {
    Stanza(Element),
    Closed,
    Failed(ConnectionError),
}

struct ServerState {
    connect: Result<(), ConnectionError>,
    authenticate: Result<(), ConnectionError>,
    auth_gate: Option<Arc<Notify>>,
    resource: Option<String>,
    features: Vec<String>,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    sent: Vec<Element>,
    connects: usize,
    closes: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            connect: Ok(()),
            authenticate: Ok(()),
            auth_gate: None,
            resource: None,
            features: vec!["urn:xmpp:sm:3".to_string(), "urn:xmpp:csi:0".to_string()],
            inbound: None,
            sent: Vec::new(),
            connects: 0,
            closes: 0,
        }
    }
}

/// Scripts are keyed by bare JID; unparsable input is used as is.
fn account_key(jid: &str) -> String {
    Jid::new(jid)
        .map(|jid| jid.to_bare().to_string())
        .unwrap_or_else(|_| jid.to_string())
}

fn servers() -> &'static Mutex<HashMap<String, ScriptedServer>> {
    static SERVERS: OnceLock<Mutex<HashMap<String, ScriptedServer>>> = OnceLock::new();
    SERVERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Test-side handle on the fake server for one account.
#[derive(Clone)]
pub struct ScriptedServer {
    state: Arc<Mutex<ServerState>>,
    activity: Arc<Notify>,
}

impl ScriptedServer {
    /// Register a fresh server for `jid`, replacing any previous script.
    pub fn install(jid: &str) -> Self {
        let server = Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            activity: Arc::new(Notify::new()),
        };
        servers()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account_key(jid), server.clone());
        server
    }

    fn lookup(jid: &str) -> Option<Self> {
        servers()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account_key(jid))
            .cloned()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.activity.notify_waiters();
    }

    pub fn refuse_connection(&self, error: ConnectionError) {
        self.state().connect = Err(error);
    }

    pub fn reject_credentials(&self, condition: &str) {
        self.state().authenticate = Err(ConnectionError::AuthenticationFailed(condition.into()));
    }

    /// Park authentication until the returned gate is released with
    /// `notify_one`.
    pub fn hold_authentication(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().auth_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Resource the server assigns, overriding the requested one.
    pub fn assign_resource(&self, resource: &str) {
        self.state().resource = Some(resource.to_string());
    }

    /// Push a stanza to the connected client. Returns false when no stream is open.
    pub fn deliver(&self, stanza: Element) -> bool {
        self.push(Inbound::Stanza(stanza))
    }

    pub fn deliver_fixture(&self, name: &str) -> bool {
        self.deliver(fixtures::stanza(name))
    }

    /// Close the stream from the server side.
    pub fn close_stream(&self) -> bool {
        self.push(Inbound::Closed)
    }

    pub fn fail_stream(&self, error: ConnectionError) -> bool {
        self.push(Inbound::Failed(error))
    }

    fn push(&self, inbound: Inbound) -> bool {
        self.state()
            .inbound
            .as_ref()
            .is_some_and(|sender| sender.send(inbound).is_ok())
    }

    /// Everything the client wrote, in order.
    pub fn sent(&self) -> Vec<Element> {
        self.state().sent.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    /// Wait until the client wrote a stanza matching `predicate`.
    pub async fn wait_for_sent(&self, predicate: impl Fn(&Element) -> bool) -> Element {
        loop {
            let notified = self.activity.notified();
            if let Some(stanza) = self.state().sent.iter().find(|stanza| predicate(stanza)).cloned()
            {
                return stanza;
            }
            notified.await;
        }
    }

    /// Wait for the client's next IQ carrying a `name` child in `namespace`.
    pub async fn wait_for_iq(&self, name: &str, namespace: &str) -> Element {
        self.wait_for_sent(|stanza| stanza.is("iq", ns::CLIENT) && stanza.has_child(name, namespace))
            .await
    }

    pub async fn wait_for_closes(&self, count: usize) {
        loop {
            let notified = self.activity.notified();
            if self.state().closes >= count {
                return;
            }
            notified.await;
        }
    }
}

/// Client end of a [`ScriptedServer`].
pub struct ScriptedTransport {
    server: ScriptedServer,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl XmppTransport for ScriptedTransport {
    async fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let server = ScriptedServer::lookup(&config.jid).ok_or_else(|| {
            ConnectionError::Network(format!("no scripted server for {}", config.jid))
        })?;

        let inbound = {
            let mut state = server.state();
            state.connects += 1;
            state.connect.clone()?;
            let (sender, receiver) = mpsc::unbounded_channel();
            state.inbound = Some(sender);
            receiver
        };
        server.touch();

        Ok(Self { server, inbound })
    }

    async fn authenticate(&mut self, _config: &ConnectionConfig) -> Result<(), ConnectionError> {
        let gate = self.server.state().auth_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.server.state().authenticate.clone()
    }

    async fn bind(&mut self, config: &ConnectionConfig) -> Result<BoundSession, ConnectionError> {
        let state = self.server.state();
        let resource = state
            .resource
            .clone()
            .or_else(|| config.resource.clone())
            .unwrap_or_else(|| DEFAULT_RESOURCE.to_string());

        let jid = BareJid::new(&config.jid)
            .and_then(|account| account.with_resource_str(&resource))
            .map_err(|error| ConnectionError::Network(format!("cannot bind {resource}: {error}")))?;

        Ok(BoundSession {
            jid,
            features: state.features.clone(),
        })
    }

    async fn send(&mut self, stanza: Element) -> Result<(), ConnectionError> {
        self.server.state().sent.push(stanza);
        self.server.touch();
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Element>, ConnectionError> {
        match self.inbound.recv().await {
            Some(Inbound::Stanza(stanza)) => Ok(Some(stanza)),
            Some(Inbound::Failed(error)) => Err(error),
            Some(Inbound::Closed) | None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        {
            let mut state = self.server.state();
            state.closes += 1;
            state.inbound = None;
        }
        self.inbound.close();
        self.server.touch();
        Ok(())
    }
}
