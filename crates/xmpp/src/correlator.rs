use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    sync::oneshot,
    time::{Instant, timeout_at},
};
use tracing::debug;
use uuid::Uuid;
use xmpp_parsers::{
    iq::{Iq, IqType},
    minidom::Element,
};

use crate::error::{RequestError, StanzaError};

/// How many expired ids are remembered for discarding late responses.
const EXPIRED_ID_CAPACITY: usize = 256;

/// What happened to a response handed to [`RequestCorrelator::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A waiting request was completed.
    Resolved,
    /// The request had already timed out or was cancelled; the response was dropped.
    Discarded,
    /// The id was never issued by this correlator.
    Unknown,
}

struct Pending {
    sender: oneshot::Sender<Iq>,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, Pending>,
    expired: VecDeque<String>,
    expired_ids: HashSet<String>,
}

impl State {
    fn remember_expired(&mut self, id: String) {
        if self.expired_ids.insert(id.clone()) {
            self.expired.push_back(id);
        }
        while self.expired.len() > EXPIRED_ID_CAPACITY {
            if let Some(oldest) = self.expired.pop_front() {
                self.expired_ids.remove(&oldest);
            }
        }
    }

    /// Move entries whose deadline has passed to the expired set, whether
    /// or not their waiter has noticed yet.
    fn purge_expired(&mut self, now: Instant) {
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in overdue {
            self.pending.remove(&id);
            self.remember_expired(id);
        }
    }
}

/// Matches outgoing requests to their responses by stanza id.
#[derive(Default)]
pub struct RequestCorrelator {
    state: Mutex<State>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign a fresh id to `stanza` and register a pending entry for it.
    ///
    /// The returned handle must be awaited after the stanza is sent; dropping
    /// it abandons the request.
    pub fn register(self: &Arc<Self>, stanza: &mut Element, timeout: Duration) -> PendingResponse {
        let (sender, receiver) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let id = {
            let mut state = self.state();
            let id = loop {
                let candidate = format!("fluux-{}", Uuid::new_v4().simple());
                if !state.pending.contains_key(&candidate) && !state.expired_ids.contains(&candidate) {
                    break candidate;
                }
            };
            state.pending.insert(id.clone(), Pending { sender, deadline });
            id
        };

        stanza.set_attr("id", id.as_str());
        debug!(id = %id, timeout_ms = timeout.as_millis() as u64, "request registered");

        PendingResponse {
            id,
            deadline,
            receiver,
            correlator: Arc::clone(self),
            finished: false,
        }
    }

    /// Hand a response to the request waiting on its id. A response that
    /// arrives after the request's deadline is discarded even if the waiter
    /// has not observed the timeout yet.
    pub fn resolve(&self, response: Iq) -> Resolution {
        let mut state = self.state();
        if let Some(pending) = state.pending.remove(&response.id) {
            if pending.deadline <= Instant::now() {
                debug!(id = %response.id, "discarding late response");
                state.remember_expired(response.id);
                return Resolution::Discarded;
            }
            drop(state);
            let id = response.id.clone();
            if pending.sender.send(response).is_err() {
                debug!(id = %id, "request abandoned before its response arrived");
            }
            return Resolution::Resolved;
        }

        if state.expired_ids.contains(&response.id) {
            debug!(id = %response.id, "discarding late response");
            return Resolution::Discarded;
        }

        Resolution::Unknown
    }

    pub fn is_pending(&self, id: &str) -> bool {
        let mut state = self.state();
        state.purge_expired(Instant::now());
        state.pending.contains_key(id)
    }

    /// Requests still inside their deadline.
    pub fn pending_count(&self) -> usize {
        let mut state = self.state();
        state.purge_expired(Instant::now());
        state.pending.len()
    }

    /// Fail every pending request with [`RequestError::Cancelled`].
    pub fn cancel_all(&self) {
        let mut state = self.state();
        let ids: Vec<String> = state.pending.drain().map(|(id, _)| id).collect();
        if !ids.is_empty() {
            debug!(count = ids.len(), "cancelling pending requests");
        }
        for id in ids {
            state.remember_expired(id);
        }
    }

    /// Remove `id` if still pending.
    fn expire(&self, id: &str) {
        let mut state = self.state();
        if state.pending.remove(id).is_some() {
            state.remember_expired(id.to_string());
        }
    }
}

/// A registered request awaiting its response.
pub struct PendingResponse {
    id: String,
    deadline: Instant,
    receiver: oneshot::Receiver<Iq>,
    correlator: Arc<RequestCorrelator>,
    finished: bool,
}

impl PendingResponse {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response.
    ///
    /// A `type='error'` response fails with [`RequestError::Stanza`].
    pub async fn wait(mut self) -> Result<Element, RequestError> {
        let outcome = timeout_at(self.deadline, &mut self.receiver).await;
        self.finished = true;

        let response = match outcome {
            Ok(Ok(response)) => response,
            // The entry was dropped: cancelled, or discarded once overdue.
            Ok(Err(_)) if Instant::now() < self.deadline => return Err(RequestError::Cancelled),
            Ok(Err(_)) => return Err(self.timed_out()),
            Err(_) => {
                self.correlator.expire(&self.id);
                // Resolved before the deadline but not yet received.
                self.receiver.try_recv().map_err(|_| self.timed_out())?
            }
        };

        match response.payload {
            IqType::Error(error) => Err(RequestError::Stanza(StanzaError::from(&error))),
            _ => Ok(response.into()),
        }
    }

    fn timed_out(&self) -> RequestError {
        debug!(id = %self.id, "request timed out");
        RequestError::Timeout
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.finished {
            self.correlator.expire(&self.id);
        }
    }
}
