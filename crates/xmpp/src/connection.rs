use std::{
    marker::PhantomData,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, timeout_at},
};
use tokio_util::sync::CancellationToken;
use jid::Jid;
use tracing::{debug, info, warn};
use xmpp_parsers::{iq::Iq, minidom::Element, ping::Ping};

use fluux_core::event::{PresenceShow, SessionEndReason};

pub use crate::transport::ConnectionConfig;
use crate::{
    caps::{CapabilityAdvertiser, PlatformDetector, TargetPlatformDetector},
    correlator::RequestCorrelator,
    error::{ConnectionError, RequestError, StanzaError},
    pubsub::{PubSubDispatcher, PubSubHandler},
    router::{EventRouter, RouteOutcome},
    stanza,
    store::StoreBinder,
    transport::{BoundSession, XmppTransport},
};

/// Outbound stanzas buffered between callers and the session task.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Session life cycle. A failure in any non-terminal state tears down
/// through `Disconnecting` back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Binding,
    Online,
    Disconnecting,
}

impl ConnectionState {
    /// A `connect()` is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Authenticating | ConnectionState::Binding
        )
    }
}

struct Attempt {
    id: u64,
    token: CancellationToken,
}

struct Session {
    id: u64,
    jid: String,
    outbound: mpsc::Sender<Element>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    attempt: Option<Attempt>,
    session: Option<Session>,
}

struct Shared {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
    correlator: Arc<RequestCorrelator>,
    caps: Arc<CapabilityAdvertiser>,
    pubsub: Mutex<PubSubDispatcher>,
    binder: Arc<dyn StoreBinder>,
    detector: Arc<dyn PlatformDetector>,
}

/// Owns the session with the server and is the only entry point for
/// application code.
///
/// Cloning is cheap; clones drive the same session.
pub struct ConnectionManager<T: XmppTransport> {
    shared: Arc<Shared>,
    _transport: PhantomData<fn() -> T>,
}

impl<T: XmppTransport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _transport: PhantomData,
        }
    }
}

impl<T: XmppTransport> ConnectionManager<T> {
    pub fn new(config: ConnectionConfig, binder: Arc<dyn StoreBinder>) -> Self {
        Self::with_platform_detector(config, binder, Arc::new(TargetPlatformDetector))
    }

    pub fn with_platform_detector(
        config: ConnectionConfig,
        binder: Arc<dyn StoreBinder>,
        detector: Arc<dyn PlatformDetector>,
    ) -> Self {
        let caps = Arc::new(CapabilityAdvertiser::new(config.caps_node.clone()));
        if let Some(platform) = config.platform {
            caps.set_platform(platform);
        }
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                config,
                state,
                inner: Mutex::new(Inner::default()),
                correlator: Arc::new(RequestCorrelator::new()),
                caps,
                pubsub: Mutex::new(PubSubDispatcher::default()),
                binder,
                detector,
            }),
            _transport: PhantomData,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Full JID of the bound session.
    pub fn bound_jid(&self) -> Option<String> {
        self.shared
            .lock_inner()
            .session
            .as_ref()
            .map(|session| session.jid.clone())
    }

    pub fn capabilities(&self) -> &Arc<CapabilityAdvertiser> {
        &self.shared.caps
    }

    /// Route PEP events for `node` to `handler`. Takes effect from the next
    /// session.
    pub fn register_pubsub_handler(&self, node: impl Into<String>, handler: PubSubHandler) {
        self.shared
            .pubsub
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(node, handler);
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    /// Connect, authenticate and bind. Returns the bound full JID.
    ///
    /// Already online returns the current JID; an attempt in flight fails
    /// with `AlreadyConnecting`.
    pub async fn connect(&self) -> Result<String, ConnectionError> {
        let (attempt_id, token) = {
            let mut inner = self.shared.lock_inner();
            let state = self.state();
            match state {
                ConnectionState::Disconnected => {}
                ConnectionState::Online if inner.session.is_some() => {
                    return Ok(inner
                        .session
                        .as_ref()
                        .map(|session| session.jid.clone())
                        .unwrap_or_default());
                }
                _ => {
                    debug!(?state, "connect rejected");
                    return Err(ConnectionError::AlreadyConnecting);
                }
            }

            inner.next_id += 1;
            let attempt = Attempt {
                id: inner.next_id,
                token: CancellationToken::new(),
            };
            let handle = (attempt.id, attempt.token.clone());
            inner.attempt = Some(attempt);
            self.shared.set_state(ConnectionState::Connecting);
            handle
        };

        info!(jid = %self.shared.config.jid, attempt = attempt_id, "connecting");
        let shared = Arc::clone(&self.shared);
        match tokio::spawn(run_attempt::<T>(shared, attempt_id, token)).await {
            Ok(result) => result,
            Err(error) => {
                let error = ConnectionError::Network(format!("connection task failed: {error}"));
                self.shared.finish_failed_attempt(attempt_id, &error);
                Err(error)
            }
        }
    }

    /// Tear the session down. Safe from any state and never fails; the
    /// transport is closed when this returns.
    pub async fn disconnect(&self) {
        let mut state_rx = self.shared.state.subscribe();
        let (attempt, session) = {
            let mut inner = self.shared.lock_inner();
            let attempt = inner.attempt.take();
            let session = inner.session.take();
            if attempt.is_some() || session.is_some() {
                self.shared.set_state(ConnectionState::Disconnecting);
            }
            (attempt, session)
        };

        if let Some(attempt) = attempt {
            debug!(attempt = attempt.id, "cancelling connection attempt");
            attempt.token.cancel();
        }

        if let Some(session) = session {
            session.shutdown.cancel();
            if let Err(error) = session.task.await {
                warn!(%error, "session task ended abnormally");
            }
            self.shared.correlator.cancel_all();
            self.shared.set_state(ConnectionState::Disconnected);
            info!(jid = %session.jid, "disconnected");
            self.shared
                .binder
                .on_session_ended(&SessionEndReason::UserRequested);
            return;
        }

        // A cancelled attempt (or a concurrent disconnect) finishes the teardown.
        let _ = state_rx
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    /// Queue a stanza for the server. Only valid while online.
    pub async fn send(&self, stanza: Element) -> Result<(), ConnectionError> {
        let outbound = {
            let inner = self.shared.lock_inner();
            match &inner.session {
                Some(session) if self.state() == ConnectionState::Online => {
                    session.outbound.clone()
                }
                _ => return Err(ConnectionError::NotConnected),
            }
        };
        outbound
            .send(stanza)
            .await
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Send `stanza` with a fresh id and wait for the matching response,
    /// using the configured request timeout.
    pub async fn request(&self, stanza: Element) -> Result<Element, RequestError> {
        self.request_with_timeout(stanza, self.shared.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        mut stanza: Element,
        timeout: Duration,
    ) -> Result<Element, RequestError> {
        if self.state() != ConnectionState::Online {
            return Err(ConnectionError::NotConnected.into());
        }
        let pending = self.shared.correlator.register(&mut stanza, timeout);
        self.send(stanza).await?;
        pending.wait().await
    }

    /// Broadcast our presence with the capability advertisement attached.
    pub async fn set_presence(
        &self,
        show: PresenceShow,
        status: Option<&str>,
        priority: i8,
    ) -> Result<(), ConnectionError> {
        let caps = (!matches!(show, PresenceShow::Unavailable)).then(|| self.shared.caps.caps_element());
        self.send(stanza::presence(show, status, priority, caps))
            .await
    }

    /// XEP-0199 ping. `None` pings our server.
    pub async fn ping(&self, target: Option<&str>) -> Result<(), RequestError> {
        let mut ping = Iq::from_get(String::new(), Ping);
        if let Some(target) = target {
            let to = Jid::new(target).map_err(|error| {
                RequestError::Stanza(StanzaError {
                    error_type: "modify".into(),
                    condition: "jid-malformed".into(),
                    text: Some(error.to_string()),
                })
            })?;
            ping = ping.with_to(to);
        }
        self.request(ping.into()).await?;
        Ok(())
    }
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "connection state changed");
        }
    }

    fn owns_attempt(inner: &Inner, attempt_id: u64) -> bool {
        inner
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.id == attempt_id && !attempt.token.is_cancelled())
    }

    /// Move a live attempt to its next phase.
    fn advance(&self, attempt_id: u64, next: ConnectionState) -> Result<(), ConnectionError> {
        let inner = self.lock_inner();
        if !Self::owns_attempt(&inner, attempt_id) {
            return Err(ConnectionError::Cancelled);
        }
        self.set_state(next);
        Ok(())
    }

    fn begin_teardown(&self, attempt_id: u64) {
        let inner = self.lock_inner();
        if Self::owns_attempt(&inner, attempt_id) {
            self.set_state(ConnectionState::Disconnecting);
        }
    }

    fn finish_failed_attempt(&self, attempt_id: u64, error: &ConnectionError) {
        {
            let mut inner = self.lock_inner();
            if inner
                .attempt
                .as_ref()
                .is_some_and(|attempt| attempt.id == attempt_id)
            {
                inner.attempt = None;
            }
            self.set_state(ConnectionState::Disconnected);
        }

        match error {
            ConnectionError::Cancelled => debug!(attempt = attempt_id, "connection attempt cancelled"),
            error => warn!(attempt = attempt_id, %error, "connection attempt failed"),
        }
    }

    /// Hand the bound transport to a new session task. Gives the transport
    /// back if the attempt was cancelled meanwhile.
    fn install_session<T: XmppTransport>(
        self: &Arc<Self>,
        attempt_id: u64,
        transport: T,
        bound: BoundSession,
    ) -> Result<oneshot::Receiver<()>, T> {
        let mut inner = self.lock_inner();
        if !Self::owns_attempt(&inner, attempt_id) {
            return Err(transport);
        }
        inner.attempt = None;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let pubsub = self
            .pubsub
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let router = EventRouter::new(
            bound.jid.to_bare(),
            Arc::clone(&self.correlator),
            Arc::clone(&self.caps),
            Arc::clone(&self.binder),
        )
        .with_pubsub(pubsub);

        let task = tokio::spawn(run_session(
            Arc::clone(self),
            SessionTask {
                id: attempt_id,
                jid: bound.jid.to_string(),
                transport,
                router,
                outbound: outbound_rx,
                shutdown: shutdown.clone(),
            },
            ready_tx,
        ));

        info!(jid = %bound.jid, features = bound.features.len(), "session bound");
        inner.session = Some(Session {
            id: attempt_id,
            jid: bound.jid.to_string(),
            outbound: outbound_tx,
            shutdown,
            task,
        });
        self.set_state(ConnectionState::Online);
        Ok(ready_rx)
    }

    /// The transport went away underneath session `session_id`.
    fn session_lost(&self, session_id: u64, reason: String) {
        let session = {
            let mut inner = self.lock_inner();
            if !inner
                .session
                .as_ref()
                .is_some_and(|session| session.id == session_id)
            {
                return;
            }
            let session = inner.session.take();
            self.set_state(ConnectionState::Disconnected);
            session
        };

        self.correlator.cancel_all();
        let jid = session.map(|session| session.jid).unwrap_or_default();
        warn!(jid = %jid, reason = %reason, "connection lost");
        self.binder
            .on_session_ended(&SessionEndReason::Unexpected { reason });
    }
}

async fn run_attempt<T: XmppTransport>(
    shared: Arc<Shared>,
    attempt_id: u64,
    token: CancellationToken,
) -> Result<String, ConnectionError> {
    let result = establish::<T>(&shared, attempt_id, &token).await;
    if let Err(error) = &result {
        shared.finish_failed_attempt(attempt_id, error);
    }
    result
}

async fn establish<T: XmppTransport>(
    shared: &Arc<Shared>,
    attempt_id: u64,
    token: &CancellationToken,
) -> Result<String, ConnectionError> {
    let deadline = Instant::now() + shared.config.connect_timeout;

    if !shared.caps.platform_detected() {
        let detection = async {
            Ok(shared.caps.detect_platform(shared.detector.as_ref()).await)
        };
        let platform = guarded(token, deadline, detection).await?;
        debug!(?platform, "platform detected");
    }

    let mut transport = guarded(token, deadline, T::connect(&shared.config)).await?;

    let bound = match negotiate(shared, attempt_id, token, deadline, &mut transport).await {
        Ok(bound) => bound,
        Err(error) => {
            shared.begin_teardown(attempt_id);
            close_transport(&mut transport).await;
            return Err(error);
        }
    };

    let jid = bound.jid.to_string();
    let ready = match shared.install_session(attempt_id, transport, bound) {
        Ok(ready) => ready,
        Err(mut transport) => {
            close_transport(&mut transport).await;
            return Err(ConnectionError::Cancelled);
        }
    };
    // The session task reports the established session before routing anything.
    let _ = ready.await;
    Ok(jid)
}

async fn negotiate<T: XmppTransport>(
    shared: &Shared,
    attempt_id: u64,
    token: &CancellationToken,
    deadline: Instant,
    transport: &mut T,
) -> Result<BoundSession, ConnectionError> {
    shared.advance(attempt_id, ConnectionState::Authenticating)?;
    guarded(token, deadline, transport.authenticate(&shared.config)).await?;

    shared.advance(attempt_id, ConnectionState::Binding)?;
    guarded(token, deadline, transport.bind(&shared.config)).await
}

/// Race one connect step against cancellation and the overall deadline.
async fn guarded<O>(
    token: &CancellationToken,
    deadline: Instant,
    step: impl Future<Output = Result<O, ConnectionError>>,
) -> Result<O, ConnectionError> {
    tokio::select! {
        _ = token.cancelled() => Err(ConnectionError::Cancelled),
        result = timeout_at(deadline, step) => result.unwrap_or(Err(ConnectionError::Timeout)),
    }
}

async fn close_transport<T: XmppTransport>(transport: &mut T) {
    if let Err(error) = transport.close().await {
        debug!(%error, "transport close failed");
    }
}

struct SessionTask<T> {
    id: u64,
    jid: String,
    transport: T,
    router: EventRouter,
    outbound: mpsc::Receiver<Element>,
    shutdown: CancellationToken,
}

async fn run_session<T: XmppTransport>(
    shared: Arc<Shared>,
    mut task: SessionTask<T>,
    ready: oneshot::Sender<()>,
) {
    shared.binder.on_session_established(&task.jid);
    let _ = ready.send(());

    let initial_presence = shared.config.send_initial_presence.then(|| {
        stanza::presence(
            PresenceShow::Available,
            None,
            0,
            Some(shared.caps.caps_element()),
        )
    });

    let result = drive_session(&mut task, initial_presence).await;
    close_transport(&mut task.transport).await;
    task.router.reset();

    match result {
        Ok(()) => debug!(jid = %task.jid, "session task stopped"),
        Err(error) => shared.session_lost(task.id, error.to_string()),
    }
}

/// Pump stanzas until shutdown (`Ok`) or transport loss (`Err`). Inbound
/// stanzas are routed one at a time in arrival order.
async fn drive_session<T: XmppTransport>(
    task: &mut SessionTask<T>,
    initial_presence: Option<Element>,
) -> Result<(), ConnectionError> {
    if let Some(presence) = initial_presence {
        task.transport.send(presence).await?;
    }

    loop {
        tokio::select! {
            biased;

            _ = task.shutdown.cancelled() => return Ok(()),

            Some(stanza) = task.outbound.recv() => task.transport.send(stanza).await?,

            inbound = task.transport.recv() => {
                let Some(stanza) = inbound? else {
                    return Err(ConnectionError::Network("stream closed by server".to_string()));
                };
                match task.router.route(&stanza) {
                    RouteOutcome::Query(reply) => task.transport.send(reply).await?,
                    RouteOutcome::Unhandled => {
                        debug!(name = %stanza.name(), id = stanza.attr("id").unwrap_or_default(), "stanza not handled");
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connecting_states() {
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(ConnectionState::Authenticating.is_connecting());
        assert!(ConnectionState::Binding.is_connecting());
        assert!(!ConnectionState::Online.is_connecting());
        assert!(!ConnectionState::Disconnecting.is_connecting());
        assert!(!ConnectionState::Disconnected.is_connecting());
    }

    #[test]
    fn state_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Authenticating).unwrap(),
            "\"authenticating\""
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn guarded_step_times_out_at_deadline() {
        let token = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let result: Result<(), _> = guarded(&token, deadline, std::future::pending()).await;
        assert_eq!(result, Err(ConnectionError::Timeout));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn guarded_step_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let deadline = Instant::now() + Duration::from_secs(5);
        let result: Result<(), _> = guarded(&token, deadline, std::future::pending()).await;
        assert_eq!(result, Err(ConnectionError::Cancelled));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn guarded_step_passes_through_errors() {
        let token = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let result: Result<(), _> = guarded(&token, deadline, async {
            Err(ConnectionError::AuthenticationFailed("not-authorized".into()))
        })
        .await;
        assert_eq!(
            result,
            Err(ConnectionError::AuthenticationFailed("not-authorized".into()))
        );
    }
}
