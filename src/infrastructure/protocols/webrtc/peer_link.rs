/// Peer link
///
/// Owns the offer/answer negotiation with exactly one remote participant.
/// All operations take `&self`; the internal lock is never held across an
/// await, so `close()` can land while a backend call is suspended. Results
/// that arrive after `close()` are discarded.
use crate::domain::call::value_object::{LinkRole, PeerLinkState};
use crate::domain::media::StreamHandle;
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use crate::infrastructure::protocols::ice::IceCandidate;
use crate::infrastructure::protocols::webrtc::connection::{
    ConnectionObserver, IceConnectionState, PeerConnection, PeerConnectionFactory,
};
use crate::infrastructure::protocols::webrtc::sdp::SessionDescription;
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Typed events a link reports to its owner
#[derive(Debug, Clone)]
pub enum LinkEvent {
    StateChanged(PeerLinkState),
    LocalCandidate(IceCandidate),
    RemoteStream(StreamHandle),
    /// Negotiation or ICE failure. The link is Disconnected, not closed;
    /// the owner decides between an ICE restart and `close()`.
    Failed(String),
}

#[async_trait]
pub trait LinkEventHandler: Send + Sync {
    async fn on_link_event(&self, participant: &ParticipantId, event: LinkEvent);
}

struct LinkCore {
    state: PeerLinkState,
    role: Option<LinkRole>,
    connection: Option<Arc<dyn PeerConnection>>,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    flushing: bool,
    /// An async backend call is outstanding
    in_transition: bool,
    restart_pending: bool,
    restarts: u32,
    /// Last ICE report was Connected
    ice_connected: bool,
}

struct LinkInner {
    call_id: CallId,
    participant: ParticipantId,
    handler: Arc<dyn LinkEventHandler>,
    /// Tombstone checked by every async continuation
    closed: AtomicBool,
    core: Mutex<LinkCore>,
}

#[derive(Clone)]
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl PeerLink {
    pub fn new(call_id: CallId, participant: ParticipantId, handler: Arc<dyn LinkEventHandler>) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                call_id,
                participant,
                handler,
                closed: AtomicBool::new(false),
                core: Mutex::new(LinkCore {
                    state: PeerLinkState::New,
                    role: None,
                    connection: None,
                    remote_description_set: false,
                    pending_candidates: VecDeque::new(),
                    flushing: false,
                    in_transition: false,
                    restart_pending: false,
                    restarts: 0,
                    ice_connected: false,
                }),
            }),
        }
    }

    pub fn call_id(&self) -> CallId {
        self.inner.call_id
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.inner.participant
    }

    pub fn state(&self) -> PeerLinkState {
        self.lock().state
    }

    pub fn role(&self) -> Option<LinkRole> {
        self.lock().role
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// ICE restarts issued by this link so far
    pub fn restarts(&self) -> u32 {
        self.lock().restarts
    }

    pub fn is_restarting(&self) -> bool {
        self.lock().restart_pending
    }

    /// Remote candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.lock().pending_candidates.len()
    }

    fn lock(&self) -> MutexGuard<'_, LinkCore> {
        self.inner.core.lock()
    }

    fn closed_error(&self) -> CallError {
        CallError::LinkClosed(format!("link to {} is closed", self.inner.participant))
    }

    /// Create the backend connection and register its callbacks.
    /// A repeated `open` with the same role in state New is a no-op.
    pub fn open(&self, role: LinkRole, factory: &dyn PeerConnectionFactory) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        {
            let core = self.lock();
            if core.state != PeerLinkState::New {
                return Err(CallError::InvalidState(format!(
                    "open called on link to {} in state {}",
                    self.inner.participant, core.state
                )));
            }
            match core.role {
                Some(existing) if existing == role && core.connection.is_some() => return Ok(()),
                Some(existing) => {
                    return Err(CallError::InvalidState(format!(
                        "link to {} already opened as {:?}",
                        self.inner.participant, existing
                    )))
                }
                None => {}
            }
        }

        let observer: Arc<dyn ConnectionObserver> = Arc::new(LinkObserver {
            link: Arc::downgrade(&self.inner),
        });
        let connection = factory.create(&self.inner.participant, observer)?;

        {
            let mut core = self.lock();
            if self.is_closed() {
                connection.close();
                return Err(self.closed_error());
            }
            core.role = Some(role);
            core.connection = Some(connection);
        }

        debug!(
            call_id = %self.inner.call_id,
            participant = %self.inner.participant,
            "Opened peer link as {:?}",
            role
        );
        Ok(())
    }

    /// Send the shared local stream over this link
    pub fn attach_local_stream(&self, stream: StreamHandle) -> Result<()> {
        let connection = self
            .lock()
            .connection
            .clone()
            .ok_or_else(|| CallError::InvalidState("link not opened".to_string()))?;
        connection.add_local_stream(stream);
        Ok(())
    }

    /// Claim the link for one async backend call
    fn begin<T>(&self, operation: &str, check: impl FnOnce(&mut LinkCore) -> Result<T>) -> Result<(Arc<dyn PeerConnection>, T)> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let mut core = self.lock();
        if core.in_transition {
            return Err(CallError::InvalidState(format!(
                "{} while another negotiation step is in flight",
                operation
            )));
        }
        let connection = core
            .connection
            .clone()
            .ok_or_else(|| CallError::InvalidState(format!("{} on a link that was never opened", operation)))?;
        let value = check(&mut core)?;
        core.in_transition = true;
        Ok((connection, value))
    }

    /// Apply the outcome of an async backend call, unless the link was closed meanwhile
    async fn complete<T>(&self, operation: &str, result: Result<T>, next: Option<PeerLinkState>) -> Result<T> {
        if self.is_closed() {
            debug!(
                participant = %self.inner.participant,
                "Discarding {} result, link closed while it was in flight",
                operation
            );
            return Err(self.closed_error());
        }

        match result {
            Ok(value) => {
                let (changed, connected) = {
                    let mut core = self.lock();
                    core.in_transition = false;
                    let changed = next.map(|state| transition(&mut core, state)).unwrap_or(false);
                    // ICE may finish before the signaling step that unblocks it
                    let connected = changed
                        && core.ice_connected
                        && matches!(core.state, PeerLinkState::AnswerSent | PeerLinkState::AnswerReceived)
                        && transition(&mut core, PeerLinkState::Connected);
                    (changed, connected)
                };
                if let (true, Some(state)) = (changed, next) {
                    self.emit(LinkEvent::StateChanged(state)).await;
                }
                if connected {
                    self.emit(LinkEvent::StateChanged(PeerLinkState::Connected)).await;
                }
                Ok(value)
            }
            Err(err) => {
                {
                    let mut core = self.lock();
                    core.in_transition = false;
                    core.restart_pending = false;
                }
                self.fail(format!("{} failed: {}", operation, err)).await;
                Err(err)
            }
        }
    }

    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let participant = self.inner.participant.clone();
        let (connection, ()) = self.begin("create_offer", |core| {
            if core.role != Some(LinkRole::Caller) {
                return Err(CallError::InvalidState(format!(
                    "create_offer on link to {} requires the caller role",
                    participant
                )));
            }
            if core.state != PeerLinkState::New {
                return Err(CallError::InvalidState(format!(
                    "create_offer on link to {} in state {}",
                    participant, core.state
                )));
            }
            Ok(())
        })?;

        let result = async {
            let offer = connection.create_offer(false).await?;
            connection.set_local_description(offer.clone()).await?;
            Ok(offer)
        }
        .await;

        self.complete("create_offer", result, Some(PeerLinkState::OfferSent)).await
    }

    pub async fn receive_offer(&self, offer: SessionDescription) -> Result<()> {
        let participant = self.inner.participant.clone();
        let (connection, ()) = self.begin("receive_offer", |core| {
            if core.role != Some(LinkRole::Callee) || core.state != PeerLinkState::New {
                return Err(CallError::InvalidState(format!(
                    "receive_offer on link to {} requires a new callee link (state {})",
                    participant, core.state
                )));
            }
            Ok(())
        })?;

        let result = connection.set_remote_description(offer).await;
        self.complete("receive_offer", result, Some(PeerLinkState::OfferReceived))
            .await?;
        self.remote_description_applied().await;
        Ok(())
    }

    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let participant = self.inner.participant.clone();
        let (connection, ()) = self.begin("create_answer", |core| {
            if core.state != PeerLinkState::OfferReceived {
                return Err(CallError::InvalidState(format!(
                    "create_answer on link to {} in state {}",
                    participant, core.state
                )));
            }
            Ok(())
        })?;

        let result = async {
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            Ok(answer)
        }
        .await;

        self.complete("create_answer", result, Some(PeerLinkState::AnswerSent)).await
    }

    /// Apply the remote answer to our offer, or to our ICE restart offer
    pub async fn receive_answer(&self, answer: SessionDescription) -> Result<()> {
        let participant = self.inner.participant.clone();
        let (connection, restart) = self.begin("receive_answer", |core| {
            let restart = core.restart_pending
                && matches!(core.state, PeerLinkState::Connected | PeerLinkState::Disconnected);
            if core.state != PeerLinkState::OfferSent && !restart {
                return Err(CallError::InvalidState(format!(
                    "receive_answer on link to {} in state {}",
                    participant, core.state
                )));
            }
            Ok(restart)
        })?;

        let result = connection.set_remote_description(answer).await;
        let next = if restart { None } else { Some(PeerLinkState::AnswerReceived) };
        self.complete("receive_answer", result, next).await?;

        if restart {
            self.lock().restart_pending = false;
        }
        self.remote_description_applied().await;
        Ok(())
    }

    /// Re-offer with fresh ICE credentials. Caller role only.
    pub async fn restart_ice(&self) -> Result<SessionDescription> {
        let participant = self.inner.participant.clone();
        let (connection, ()) = self.begin("restart_ice", |core| {
            if core.role != Some(LinkRole::Caller) {
                return Err(CallError::InvalidState(format!(
                    "restart_ice on link to {} requires the caller role",
                    participant
                )));
            }
            if !matches!(core.state, PeerLinkState::Connected | PeerLinkState::Disconnected) {
                return Err(CallError::InvalidState(format!(
                    "restart_ice on link to {} in state {}",
                    participant, core.state
                )));
            }
            core.restart_pending = true;
            core.restarts += 1;
            core.remote_description_set = false;
            Ok(())
        })?;

        info!(
            call_id = %self.inner.call_id,
            participant = %self.inner.participant,
            "Restarting ICE"
        );

        let result = async {
            let offer = connection.create_offer(true).await?;
            connection.set_local_description(offer.clone()).await?;
            Ok(offer)
        }
        .await;

        self.complete("restart_ice", result, None).await
    }

    /// Answer a restart offer from the remote side
    pub async fn accept_restart(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let participant = self.inner.participant.clone();
        let (connection, ()) = self.begin("accept_restart", |core| {
            if !matches!(core.state, PeerLinkState::Connected | PeerLinkState::Disconnected) {
                return Err(CallError::InvalidState(format!(
                    "restart offer on link to {} in state {}",
                    participant, core.state
                )));
            }
            core.remote_description_set = false;
            Ok(())
        })?;

        let result = async {
            connection.set_remote_description(offer).await?;
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            Ok(answer)
        }
        .await;

        let answer = self.complete("accept_restart", result, None).await?;
        self.remote_description_applied().await;
        Ok(answer)
    }

    /// Queue a remote candidate; it is applied once the remote description is set,
    /// in arrival order
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let should_flush = {
            let mut core = self.lock();
            let exchange_begun = core.state != PeerLinkState::New
                || core.in_transition
                || core.role == Some(LinkRole::Callee);
            if !exchange_begun {
                return Err(CallError::InvalidState(format!(
                    "remote candidate for {} before the offer/answer exchange began",
                    self.inner.participant
                )));
            }
            core.pending_candidates.push_back(candidate);
            core.remote_description_set && !core.flushing
        };

        if should_flush {
            self.flush_candidates().await;
        }
        Ok(())
    }

    async fn remote_description_applied(&self) {
        {
            let mut core = self.lock();
            if self.is_closed() {
                return;
            }
            core.remote_description_set = true;
        }
        self.flush_candidates().await;
    }

    async fn flush_candidates(&self) {
        {
            let mut core = self.lock();
            if core.flushing || !core.remote_description_set {
                return;
            }
            core.flushing = true;
        }

        loop {
            let next = {
                let mut core = self.lock();
                if self.is_closed() || !core.remote_description_set {
                    core.flushing = false;
                    return;
                }
                match (core.pending_candidates.pop_front(), core.connection.clone()) {
                    (Some(candidate), Some(connection)) => (candidate, connection),
                    _ => {
                        core.flushing = false;
                        return;
                    }
                }
            };

            let (candidate, connection) = next;
            if let Err(e) = connection.add_ice_candidate(candidate.clone()).await {
                warn!(
                    participant = %self.inner.participant,
                    "Remote candidate rejected: {} ({})",
                    candidate,
                    e
                );
            }
        }
    }

    /// Report a failure and park the link in Disconnected
    pub async fn fail(&self, reason: String) {
        if self.is_closed() {
            return;
        }

        let changed = {
            let mut core = self.lock();
            transition(&mut core, PeerLinkState::Disconnected)
        };
        if changed {
            self.emit(LinkEvent::StateChanged(PeerLinkState::Disconnected)).await;
        }

        warn!(
            call_id = %self.inner.call_id,
            participant = %self.inner.participant,
            "Peer link failed: {}",
            reason
        );
        self.emit(LinkEvent::Failed(reason)).await;
    }

    /// Release the backend connection. Safe from any state, any number of times.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let connection = {
            let mut core = self.lock();
            core.state = PeerLinkState::Closed;
            core.pending_candidates.clear();
            core.flushing = false;
            core.in_transition = false;
            core.connection.take()
        };
        if let Some(connection) = connection {
            connection.close();
        }

        info!(
            call_id = %self.inner.call_id,
            participant = %self.inner.participant,
            "Closed peer link"
        );
        self.emit(LinkEvent::StateChanged(PeerLinkState::Closed)).await;
    }

    async fn emit(&self, event: LinkEvent) {
        self.inner
            .handler
            .on_link_event(&self.inner.participant, event)
            .await;
    }

    async fn on_ice_state(&self, state: IceConnectionState) {
        if self.is_closed() {
            return;
        }

        debug!(participant = %self.inner.participant, "ICE state {:?}", state);
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                let changed = {
                    let mut core = self.lock();
                    core.ice_connected = true;
                    match core.state {
                        PeerLinkState::AnswerSent
                        | PeerLinkState::AnswerReceived
                        | PeerLinkState::Disconnected => transition(&mut core, PeerLinkState::Connected),
                        _ => false,
                    }
                };
                if changed {
                    self.emit(LinkEvent::StateChanged(PeerLinkState::Connected)).await;
                }
            }
            IceConnectionState::Disconnected => {
                let changed = {
                    let mut core = self.lock();
                    core.ice_connected = false;
                    core.state == PeerLinkState::Connected
                        && transition(&mut core, PeerLinkState::Disconnected)
                };
                if changed {
                    self.emit(LinkEvent::StateChanged(PeerLinkState::Disconnected)).await;
                }
            }
            IceConnectionState::Failed => {
                self.lock().ice_connected = false;
                self.fail("ICE connectivity failed".to_string()).await;
            }
            IceConnectionState::New | IceConnectionState::Checking | IceConnectionState::Closed => {}
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.lock();
        f.debug_struct("PeerLink")
            .field("call_id", &self.inner.call_id)
            .field("participant", &self.inner.participant)
            .field("state", &core.state)
            .field("role", &core.role)
            .field("pending_candidates", &core.pending_candidates.len())
            .finish()
    }
}

fn transition(core: &mut LinkCore, next: PeerLinkState) -> bool {
    if core.state == next || !core.state.can_transition_to(next) {
        return false;
    }
    core.state = next;
    true
}

/// Backend callbacks routed into the owning link
struct LinkObserver {
    link: Weak<LinkInner>,
}

impl LinkObserver {
    fn link(&self) -> Option<PeerLink> {
        self.link.upgrade().map(|inner| PeerLink { inner })
    }
}

#[async_trait]
impl ConnectionObserver for LinkObserver {
    async fn on_local_candidate(&self, candidate: IceCandidate) {
        if let Some(link) = self.link() {
            if !link.is_closed() {
                link.emit(LinkEvent::LocalCandidate(candidate)).await;
            }
        }
    }

    async fn on_remote_stream(&self, stream: StreamHandle) {
        if let Some(link) = self.link() {
            if !link.is_closed() {
                link.emit(LinkEvent::RemoteStream(stream)).await;
            }
        }
    }

    async fn on_ice_state(&self, state: IceConnectionState) {
        if let Some(link) = self.link() {
            link.on_ice_state(state).await;
        }
    }
}
