//! In-process signaling hub
//!
//! Every participant connects an endpoint to a shared hub. Messages are
//! encoded to JSON on send and decoded (and validated) on delivery, so the
//! hub exercises the same boundary a network transport would. Delivery
//! routes to the per-call subscription first, then to the endpoint's
//! listener; anything else is dropped.

use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use crate::domain::signaling::{SignalingMessage, SignalingTransport, Subscription};
use crate::infrastructure::protocols::signaling::codec::SignalingCodec;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type Inbox = mpsc::UnboundedSender<SignalingMessage>;

#[derive(Default)]
struct Endpoint {
    next_token: AtomicU64,
    calls: Mutex<HashMap<CallId, (u64, Inbox)>>,
    listener: Mutex<Option<(u64, Inbox)>>,
}

impl Endpoint {
    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst)
    }

    fn route(&self, message: SignalingMessage) -> bool {
        let call_inbox = self
            .calls
            .lock()
            .get(message.call_id())
            .map(|(_, inbox)| inbox.clone());
        if let Some(inbox) = call_inbox {
            if inbox.send(message.clone()).is_ok() {
                return true;
            }
        }

        let listener = self.listener.lock().as_ref().map(|(_, inbox)| inbox.clone());
        match listener {
            Some(inbox) => inbox.send(message).is_ok(),
            None => false,
        }
    }
}

pub struct MemorySignalingHub {
    endpoints: RwLock<HashMap<ParticipantId, Arc<Endpoint>>>,
    codec: SignalingCodec,
    delivered: AtomicUsize,
    dropped: AtomicUsize,
}

impl MemorySignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            codec: SignalingCodec::new(),
            delivered: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        })
    }

    /// Register `participant` and hand back its transport
    pub fn connect(self: &Arc<Self>, participant: impl Into<ParticipantId>) -> MemorySignalingTransport {
        let participant = participant.into();
        self.endpoints
            .write()
            .entry(participant.clone())
            .or_insert_with(|| Arc::new(Endpoint::default()));
        info!("Signaling endpoint connected: {}", participant);

        MemorySignalingTransport {
            hub: self.clone(),
            local: participant,
        }
    }

    pub fn disconnect(&self, participant: &ParticipantId) {
        if self.endpoints.write().remove(participant).is_some() {
            info!("Signaling endpoint disconnected: {}", participant);
        }
    }

    pub fn is_connected(&self, participant: &ParticipantId) -> bool {
        self.endpoints.read().contains_key(participant)
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    fn endpoint(&self, participant: &ParticipantId) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(participant).cloned()
    }

    fn deliver(&self, to: &ParticipantId, frame: &str) -> Result<()> {
        let endpoint = self
            .endpoint(to)
            .ok_or_else(|| CallError::Transport(format!("{} is not connected", to)))?;

        let message = match self.codec.decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame for {}: {}", to, e);
                self.dropped.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
        };

        debug!(
            call_id = %message.call_id(),
            "{} {} -> {}",
            message.name(),
            message.sender(),
            to
        );

        if endpoint.route(message) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        } else {
            debug!("No subscriber for message to {}, dropped", to);
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// One participant's view of the hub
#[derive(Clone)]
pub struct MemorySignalingTransport {
    hub: Arc<MemorySignalingHub>,
    local: ParticipantId,
}

impl MemorySignalingTransport {
    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Push a raw frame to the local participant, as a remote peer would
    pub fn inject(&self, frame: &str) -> Result<()> {
        self.hub.deliver(&self.local, frame)
    }

    fn local_endpoint(&self) -> Option<Weak<Endpoint>> {
        self.hub.endpoint(&self.local).map(|e| Arc::downgrade(&e))
    }
}

#[async_trait]
impl SignalingTransport for MemorySignalingTransport {
    async fn send(&self, to: &ParticipantId, message: SignalingMessage) -> Result<()> {
        let frame = self.hub.codec.encode(&message)?;
        self.hub.deliver(to, &frame)
    }

    fn subscribe(&self, call_id: CallId, inbox: Inbox) -> Subscription {
        let endpoint = match self.local_endpoint() {
            Some(endpoint) => endpoint,
            None => {
                warn!("subscribe on disconnected endpoint {}", self.local);
                return Subscription::noop();
            }
        };

        let token = match endpoint.upgrade() {
            Some(live) => {
                let token = live.token();
                live.calls.lock().insert(call_id, (token, inbox));
                token
            }
            None => return Subscription::noop(),
        };

        Subscription::new(move || {
            if let Some(live) = endpoint.upgrade() {
                let mut calls = live.calls.lock();
                if calls.get(&call_id).map(|(t, _)| *t) == Some(token) {
                    calls.remove(&call_id);
                }
            }
        })
    }

    fn listen(&self, inbox: Inbox) -> Subscription {
        let endpoint = match self.local_endpoint() {
            Some(endpoint) => endpoint,
            None => {
                warn!("listen on disconnected endpoint {}", self.local);
                return Subscription::noop();
            }
        };

        let token = match endpoint.upgrade() {
            Some(live) => {
                let token = live.token();
                *live.listener.lock() = Some((token, inbox));
                token
            }
            None => return Subscription::noop(),
        };

        Subscription::new(move || {
            if let Some(live) = endpoint.upgrade() {
                let mut listener = live.listener.lock();
                if listener.as_ref().map(|(t, _)| *t) == Some(token) {
                    *listener = None;
                }
            }
        })
    }
}
