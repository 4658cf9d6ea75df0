//! Session manager
//!
//! Owns the single call slot of the local participant. Outgoing requests
//! and incoming offers both go through here; an offer that arrives while a
//! session is live is answered with a busy Bye and never reaches the UI.

use crate::application::call_session::{CallSession, SessionContext};
use crate::application::metrics;
use crate::domain::call::event::CallEventEnvelope;
use crate::domain::call::history::{CallHistory, CallRecord};
use crate::domain::call::policy::CallPolicy;
use crate::domain::call::value_object::CallKind;
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use crate::domain::signaling::{ByeReason, SignalingMessage, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub struct SessionManager {
    local: ParticipantId,
    ctx: SessionContext,
    policy: Arc<dyn CallPolicy>,
    /// At most one non-terminal session at a time
    slot: Mutex<Option<CallSession>>,
    listener: Mutex<Option<Subscription>>,
}

impl SessionManager {
    pub fn new(local: impl Into<ParticipantId>, ctx: SessionContext, policy: Arc<dyn CallPolicy>) -> Arc<Self> {
        Arc::new(Self {
            local: local.into(),
            ctx,
            policy,
            slot: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    pub fn local_participant(&self) -> &ParticipantId {
        &self.local
    }

    /// UI event stream for every session this manager creates
    pub fn subscribe(&self) -> broadcast::Receiver<CallEventEnvelope> {
        self.ctx.events.subscribe()
    }

    pub fn history(&self) -> Arc<dyn CallHistory> {
        self.ctx.history.clone()
    }

    pub async fn recent_calls(&self, limit: usize) -> Result<Vec<CallRecord>> {
        self.ctx.history.recent(limit).await
    }

    /// The live session, if any
    pub fn current_session(&self) -> Option<CallSession> {
        self.slot
            .lock()
            .as_ref()
            .filter(|session| !session.is_terminal())
            .cloned()
    }

    /// Start listening for offers on the signaling transport
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.ctx.transport.listen(tx);
        if self.listener.lock().replace(subscription).is_some() {
            debug!("Replacing previous signaling listener for {}", self.local);
        }

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.on_incoming_signal(message).await;
            }
            debug!("Signaling listener stopped");
        });

        info!("Session manager for {} listening", self.local);
    }

    /// Stop accepting new offers. A live session keeps running.
    pub fn stop(&self) {
        self.listener.lock().take();
    }

    /// Place a call, failing with `Busy` while another session is live
    pub async fn request_outgoing_call(&self, participants: Vec<ParticipantId>, kind: CallKind) -> Result<CallSession> {
        for participant in &participants {
            if !self.policy.can_call(&self.local, participant).await {
                info!("Call from {} to {} blocked by policy", self.local, participant);
                return Err(CallError::CallBlocked(participant.to_string()));
            }
        }

        let session = {
            let mut slot = self.slot.lock();
            if let Some(current) = slot.as_ref().filter(|session| !session.is_terminal()) {
                return Err(CallError::Busy(current.call_id().to_string()));
            }
            let session = CallSession::new(self.ctx.clone(), self.local.clone());
            *slot = Some(session.clone());
            session
        };

        if let Err(e) = session.start_outgoing(participants, kind).await {
            if !session.is_terminal() {
                session.end().await;
            }
            return Err(e);
        }
        Ok(session)
    }

    /// Hang up the live session, if any
    pub async fn end_current(&self) {
        if let Some(session) = self.current_session() {
            session.end().await;
        }
    }

    /// Handle a message no session has subscribed to
    pub async fn on_incoming_signal(&self, message: SignalingMessage) {
        let current = self.slot.lock().clone();
        if let Some(session) = current.filter(|session| session.call_id() == *message.call_id()) {
            if session.is_terminal() {
                debug!(call_id = %session.call_id(), "Dropping {} for finished call", message.name());
            } else {
                session.handle_signaling_message(message).await;
            }
            return;
        }

        let (call_id, from, kind, sdp) = match message {
            SignalingMessage::Offer {
                call_id,
                from,
                kind,
                sdp,
                ice_restart: false,
            } => (call_id, from, kind, sdp),
            other => {
                debug!(
                    call_id = %other.call_id(),
                    "Dropping stray {} from {}",
                    other.name(),
                    other.sender()
                );
                return;
            }
        };

        if from == self.local {
            warn!(call_id = %call_id, "Dropping offer from ourselves");
            return;
        }

        if !self.policy.can_call(&from, &self.local).await {
            info!(call_id = %call_id, "Declining blocked caller {}", from);
            self.send_bye(call_id, &from, ByeReason::Declined).await;
            return;
        }

        let ringing = {
            let mut slot = self.slot.lock();
            match slot.as_ref().filter(|session| !session.is_terminal()) {
                Some(current) => Err(current.call_id()),
                None => {
                    let session = CallSession::incoming(
                        self.ctx.clone(),
                        self.local.clone(),
                        call_id,
                        from.clone(),
                        kind,
                        sdp,
                    );
                    *slot = Some(session.clone());
                    Ok(session)
                }
            }
        };

        match ringing {
            Ok(session) => session.ring(),
            Err(current) => {
                info!(call_id = %call_id, "Busy with call {}, rejecting {}", current, from);
                metrics::record_busy_rejection();
                self.send_bye(call_id, &from, ByeReason::Busy).await;
            }
        }
    }

    async fn send_bye(&self, call_id: CallId, to: &ParticipantId, reason: ByeReason) {
        let bye = SignalingMessage::Bye {
            call_id,
            from: self.local.clone(),
            reason,
        };
        if let Err(e) = self.ctx.transport.send(to, bye).await {
            warn!(call_id = %call_id, "Failed to send Bye to {}: {}", to, e);
        }
    }
}
