//! Call session
//!
//! One logical call (1:1 or group) from the local participant's point of
//! view. The session owns one [`PeerLink`] per remote participant, folds
//! their states into a single [`SessionState`], owns the media flags and
//! the local stream, and tears everything down exactly once.
//!
//! Locking: the session state sits behind a `parking_lot` mutex that is
//! never held across an await. Every async continuation checks the `ended`
//! tombstone before touching state.

use crate::application::events::CallEventBus;
use crate::application::metrics;
use crate::config::CallConfig;
use crate::domain::call::event::CallEvent;
use crate::domain::call::history::{CallHistory, CallRecord};
use crate::domain::call::value_object::{
    CallDirection, CallKind, CallOutcome, EndReason, LinkRole, MediaFlags, PeerLinkState,
    SessionState,
};
use crate::domain::media::{MediaConstraints, MediaEngine, StreamHandle};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use crate::domain::signaling::{ByeReason, SignalingMessage, SignalingTransport, Subscription};
use crate::infrastructure::protocols::ice::IceCandidate;
use crate::infrastructure::protocols::webrtc::connection::PeerConnectionFactory;
use crate::infrastructure::protocols::webrtc::peer_link::{LinkEvent, LinkEventHandler, PeerLink};
use crate::infrastructure::protocols::webrtc::sdp::SessionDescription;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Collaborators shared by every session of one local participant
#[derive(Clone)]
pub struct SessionContext {
    pub transport: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn MediaEngine>,
    pub connections: Arc<dyn PeerConnectionFactory>,
    pub history: Arc<dyn CallHistory>,
    pub events: CallEventBus,
    pub config: CallConfig,
}

impl SessionContext {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaEngine>,
        connections: Arc<dyn PeerConnectionFactory>,
        history: Arc<dyn CallHistory>,
        config: CallConfig,
    ) -> Self {
        Self {
            transport,
            media,
            connections,
            history,
            events: CallEventBus::default(),
            config,
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq)]
pub struct CallStats {
    pub call_id: CallId,
    pub state: SessionState,
    pub direction: Option<CallDirection>,
    pub kind: CallKind,
    pub participants: Vec<ParticipantId>,
    pub connected_links: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Start to Active
    pub setup_time: Option<Duration>,
    /// Active to end, or to now while the call is live
    pub talk_time: Option<Duration>,
}

struct LinkSlot {
    link: PeerLink,
    /// Our offer or answer went out, so local candidates may follow it
    description_sent: bool,
    outbound: Vec<IceCandidate>,
    ever_connected: bool,
    grace_timer: Option<JoinHandle<()>>,
}

impl LinkSlot {
    fn new(link: PeerLink) -> Self {
        Self {
            link,
            description_sent: false,
            outbound: Vec::new(),
            ever_connected: false,
            grace_timer: None,
        }
    }
}

#[derive(Default)]
struct Timestamps {
    started_at: Option<DateTime<Utc>>,
    answered_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    answered: Option<Instant>,
    ended: Option<Instant>,
}

struct SessionCore {
    state: SessionState,
    direction: Option<CallDirection>,
    kind: CallKind,
    participants: Vec<ParticipantId>,
    /// Sent us a Bye
    departed: HashSet<ParticipantId>,
    /// Link given up after a failure
    failed: HashSet<ParticipantId>,
    links: HashMap<ParticipantId, LinkSlot>,
    flags: MediaFlags,
    local_stream: Option<StreamHandle>,
    /// Rendered media of participants still in the call
    remote_streams: HashMap<ParticipantId, StreamHandle>,
    pending_offer: Option<String>,
    accepting: bool,
    /// Remote candidates that arrived while the call was still ringing
    early_candidates: Vec<(ParticipantId, IceCandidate)>,
    ring_timer: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
    end_reason: Option<EndReason>,
    times: Timestamps,
}

impl SessionCore {
    fn remaining(&self) -> impl Iterator<Item = &ParticipantId> {
        self.participants
            .iter()
            .filter(move |p| !self.departed.contains(*p))
    }

    fn connected_links(&self) -> usize {
        self.remaining()
            .filter(|p| !self.failed.contains(*p))
            .filter_map(|p| self.links.get(p))
            .filter(|slot| slot.link.state().is_connected())
            .count()
    }
}

struct SessionInner {
    call_id: CallId,
    local: ParticipantId,
    ctx: SessionContext,
    /// Tombstone set by the first terminate
    ended: AtomicBool,
    core: Mutex<SessionCore>,
}

#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

enum FailureAction {
    Restart(PeerLink),
    AwaitRestart,
    Abandon,
    Ignore,
}

impl CallSession {
    /// An Idle session for an outgoing call
    pub fn new(ctx: SessionContext, local: ParticipantId) -> Self {
        Self::build(ctx, local, CallId::new(), SessionState::Idle, None, CallKind::Voice, Vec::new(), None)
    }

    /// A ringing session for an offer received from `from`
    pub(crate) fn incoming(
        ctx: SessionContext,
        local: ParticipantId,
        call_id: CallId,
        from: ParticipantId,
        kind: CallKind,
        offer: String,
    ) -> Self {
        let session = Self::build(
            ctx,
            local,
            call_id,
            SessionState::Incoming,
            Some(CallDirection::Incoming),
            kind,
            vec![from],
            Some(offer),
        );
        {
            let mut core = session.lock();
            core.times.started_at = Some(Utc::now());
            core.times.started = Some(Instant::now());
        }
        session
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        ctx: SessionContext,
        local: ParticipantId,
        call_id: CallId,
        state: SessionState,
        direction: Option<CallDirection>,
        kind: CallKind,
        participants: Vec<ParticipantId>,
        pending_offer: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                call_id,
                local,
                ctx,
                ended: AtomicBool::new(false),
                core: Mutex::new(SessionCore {
                    state,
                    direction,
                    kind,
                    participants,
                    departed: HashSet::new(),
                    failed: HashSet::new(),
                    links: HashMap::new(),
                    flags: MediaFlags::for_kind(kind),
                    local_stream: None,
                    remote_streams: HashMap::new(),
                    pending_offer,
                    accepting: false,
                    early_candidates: Vec::new(),
                    ring_timer: None,
                    subscription: None,
                    end_reason: None,
                    times: Timestamps::default(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.inner.core.lock()
    }

    fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    pub fn call_id(&self) -> CallId {
        self.inner.call_id
    }

    pub fn local_participant(&self) -> &ParticipantId {
        &self.inner.local
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Between Outgoing/Incoming and Ended/Failed
    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn direction(&self) -> Option<CallDirection> {
        self.lock().direction
    }

    pub fn kind(&self) -> CallKind {
        self.lock().kind
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        self.lock().participants.clone()
    }

    pub fn media_flags(&self) -> MediaFlags {
        self.lock().flags
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.lock().end_reason.clone()
    }

    pub fn local_stream(&self) -> Option<StreamHandle> {
        self.lock().local_stream.clone()
    }

    pub fn remote_stream(&self, participant: &ParticipantId) -> Option<StreamHandle> {
        self.lock().remote_streams.get(participant).cloned()
    }

    /// Participants whose media is currently attached
    pub fn remote_streams(&self) -> Vec<(ParticipantId, StreamHandle)> {
        let core = self.lock();
        core.participants
            .iter()
            .filter_map(|p| core.remote_streams.get(p).map(|stream| (p.clone(), stream.clone())))
            .collect()
    }

    pub fn link(&self, participant: &ParticipantId) -> Option<PeerLink> {
        self.lock().links.get(participant).map(|slot| slot.link.clone())
    }

    pub fn link_state(&self, participant: &ParticipantId) -> Option<PeerLinkState> {
        self.link(participant).map(|link| link.state())
    }

    pub fn stats(&self) -> CallStats {
        let core = self.lock();
        let now = Instant::now();
        let times = &core.times;

        CallStats {
            call_id: self.inner.call_id,
            state: core.state,
            direction: core.direction,
            kind: core.kind,
            participants: core.participants.clone(),
            connected_links: core.connected_links(),
            started_at: times.started_at,
            answered_at: times.answered_at,
            ended_at: times.ended_at,
            setup_time: times
                .started
                .zip(times.answered)
                .map(|(started, answered)| answered.duration_since(started)),
            talk_time: times
                .answered
                .map(|answered| times.ended.unwrap_or(now).duration_since(answered)),
        }
    }

    /// Place a call to `participants`, one caller link each
    pub async fn start_outgoing(&self, participants: Vec<ParticipantId>, kind: CallKind) -> Result<()> {
        let mut unique: Vec<ParticipantId> = Vec::with_capacity(participants.len());
        for participant in participants {
            if !unique.contains(&participant) {
                unique.push(participant);
            }
        }

        {
            let mut core = self.lock();
            if self.is_ended() || core.state.is_terminal() {
                return Err(CallError::SessionEnded(format!("call {} has ended", self.inner.call_id)));
            }
            if core.state != SessionState::Idle {
                return Err(CallError::AlreadyInCall(format!(
                    "call {} is {}",
                    self.inner.call_id, core.state
                )));
            }
            if unique.is_empty() {
                return Err(CallError::InvalidArgument("no participants to call".to_string()));
            }
            if let Some(bad) = unique.iter().find(|p| p.is_empty() || **p == self.inner.local) {
                return Err(CallError::InvalidArgument(format!("cannot call '{}'", bad)));
            }

            core.state = SessionState::Outgoing;
            core.direction = Some(CallDirection::Outgoing);
            core.kind = kind;
            core.flags = MediaFlags::for_kind(kind);
            core.participants = unique.clone();
            core.times.started_at = Some(Utc::now());
            core.times.started = Some(Instant::now());
        }

        info!(
            call_id = %self.inner.call_id,
            "Starting {} call to {}",
            kind.as_str(),
            join_ids(&unique)
        );
        metrics::record_call_started();
        self.publish_state(SessionState::Idle, SessionState::Outgoing, None);
        self.subscribe_transport();
        self.arm_ring_timer();

        self.acquire_local_stream(kind).await?;

        join_all(unique.into_iter().map(|p| self.offer_to(p))).await;
        Ok(())
    }

    /// Answer the ringing call with `offer` from `from`
    pub async fn accept_incoming(&self, call_id: CallId, from: ParticipantId, offer: String) -> Result<()> {
        let kind = {
            let mut core = self.lock();
            if self.is_ended() || core.state.is_terminal() {
                return Err(CallError::SessionEnded(format!("call {} has ended", self.inner.call_id)));
            }
            if call_id != self.inner.call_id {
                return Err(CallError::UnknownCall(format!(
                    "{} is not the ringing call {}",
                    call_id, self.inner.call_id
                )));
            }
            if core.state != SessionState::Incoming || core.accepting {
                return Err(CallError::InvalidState(format!(
                    "accept_incoming on call {} in state {}",
                    call_id, core.state
                )));
            }
            if !core.participants.contains(&from) {
                return Err(CallError::InvalidArgument(format!("{} is not calling", from)));
            }
            core.accepting = true;
            core.pending_offer = None;
            core.kind
        };

        info!(call_id = %call_id, "Accepting call from {}", from);
        self.acquire_local_stream(kind).await?;

        let link = PeerLink::new(call_id, from.clone(), self.link_handler());
        let opened = link.open(LinkRole::Callee, self.inner.ctx.connections.as_ref()).and_then(|()| {
            match self.local_stream() {
                Some(stream) => link.attach_local_stream(stream),
                None => Ok(()),
            }
        });
        if let Err(e) = opened {
            warn!(call_id = %call_id, "Could not open link to {}: {}", from, e);
            self.terminate(SessionState::Failed, EndReason::LinksFailed).await;
            return Err(e);
        }

        let early = {
            let mut core = self.lock();
            if self.is_ended() {
                None
            } else {
                core.links.insert(from.clone(), LinkSlot::new(link.clone()));
                let (mine, others): (Vec<_>, Vec<_>) = std::mem::take(&mut core.early_candidates)
                    .into_iter()
                    .partition(|(p, _)| *p == from);
                core.early_candidates = others;
                Some(mine)
            }
        };
        let Some(early) = early else {
            link.close().await;
            return Err(CallError::SessionEnded(format!("call {} has ended", call_id)));
        };

        let negotiated = async {
            for (_, candidate) in early {
                link.add_remote_candidate(candidate).await?;
            }
            link.receive_offer(SessionDescription::offer(offer)).await?;
            link.create_answer().await
        }
        .await;

        match negotiated {
            Ok(answer) => {
                let message = SignalingMessage::Answer {
                    call_id,
                    from: self.inner.local.clone(),
                    sdp: answer.sdp,
                };
                self.send_description(&from, message).await;
                self.advance(SessionState::Incoming, SessionState::Connecting);
                self.recompute().await;
                Ok(())
            }
            Err(CallError::LinkClosed(_)) if self.is_ended() => Err(CallError::SessionEnded(format!(
                "call {} ended while answering",
                call_id
            ))),
            Err(e) => {
                warn!(call_id = %call_id, "Answering {} failed: {}", from, e);
                self.abandon_link(&from).await;
                Err(e)
            }
        }
    }

    /// Accept the ringing call with the offer it arrived with
    pub async fn accept(&self) -> Result<()> {
        let pending = {
            let core = self.lock();
            core.pending_offer
                .clone()
                .zip(core.participants.first().cloned())
        };
        match pending {
            Some((offer, from)) => self.accept_incoming(self.inner.call_id, from, offer).await,
            None if self.is_ended() => Err(CallError::SessionEnded(format!(
                "call {} has ended",
                self.inner.call_id
            ))),
            None => Err(CallError::InvalidState(format!(
                "call {} has no pending offer",
                self.inner.call_id
            ))),
        }
    }

    /// Decline the ringing call. No link is ever created.
    pub async fn reject_incoming(&self, call_id: CallId) -> Result<()> {
        {
            let core = self.lock();
            if self.is_ended() || core.state.is_terminal() {
                return Ok(());
            }
            if call_id != self.inner.call_id {
                return Err(CallError::UnknownCall(format!(
                    "{} is not the ringing call {}",
                    call_id, self.inner.call_id
                )));
            }
            if core.state != SessionState::Incoming || core.accepting {
                return Err(CallError::InvalidState(format!(
                    "reject_incoming on call {} in state {}",
                    call_id, core.state
                )));
            }
        }

        info!(call_id = %call_id, "Rejecting incoming call");
        self.terminate(SessionState::Ended, EndReason::Rejected).await;
        Ok(())
    }

    /// Route one inbound message to the link of its sender
    pub async fn handle_signaling_message(&self, message: SignalingMessage) {
        if self.is_ended() {
            debug!(call_id = %self.inner.call_id, "Dropping {} for ended call", message.name());
            return;
        }
        if message.call_id() != &self.inner.call_id {
            warn!(
                call_id = %self.inner.call_id,
                "Dropping {} for call {}",
                message.name(),
                message.call_id()
            );
            return;
        }

        let sender = message.sender().clone();
        let (known, link) = {
            let core = self.lock();
            (
                core.participants.contains(&sender) && !core.departed.contains(&sender),
                core.links.get(&sender).map(|slot| slot.link.clone()),
            )
        };
        if !known {
            warn!(
                call_id = %self.inner.call_id,
                "Dropping {} from unknown participant {}",
                message.name(),
                sender
            );
            return;
        }

        match message {
            SignalingMessage::Offer { ice_restart: true, sdp, .. } => match link {
                Some(link) => self.accept_restart_offer(&sender, link, sdp).await,
                None => warn!(call_id = %self.inner.call_id, "Restart offer from {} without a link", sender),
            },
            SignalingMessage::Offer { .. } => {
                debug!(call_id = %self.inner.call_id, "Ignoring repeated offer from {}", sender);
            }
            SignalingMessage::Answer { sdp, .. } => match link {
                Some(link) => match link.receive_answer(SessionDescription::answer(sdp)).await {
                    Ok(()) => self.recompute().await,
                    Err(e) => warn!(call_id = %self.inner.call_id, "Answer from {} not applied: {}", sender, e),
                },
                None => warn!(call_id = %self.inner.call_id, "Answer from {} without a link", sender),
            },
            SignalingMessage::IceCandidate { candidate, .. } => {
                let candidate = match IceCandidate::from_descriptor(&candidate) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        warn!(call_id = %self.inner.call_id, "Bad candidate from {}: {}", sender, e);
                        return;
                    }
                };
                match link {
                    Some(link) => {
                        if let Err(e) = link.add_remote_candidate(candidate).await {
                            debug!(call_id = %self.inner.call_id, "Candidate from {} dropped: {}", sender, e);
                        }
                    }
                    None => {
                        let mut core = self.lock();
                        if core.state == SessionState::Incoming {
                            core.early_candidates.push((sender, candidate));
                        } else {
                            debug!(call_id = %self.inner.call_id, "Candidate from {} before its link, dropped", sender);
                        }
                    }
                }
            }
            SignalingMessage::Bye { reason, .. } => self.on_remote_bye(sender, reason).await,
        }
    }

    /// Flip the microphone. No-op once the session is over.
    pub fn toggle_mute(&self) -> MediaFlags {
        self.update_flags(|flags, stream| {
            flags.muted = !flags.muted;
            if let Some(stream) = stream {
                stream.set_audio_enabled(!flags.muted);
            }
        })
    }

    /// Flip the camera flag. A voice call keeps a voice stream.
    pub fn toggle_video(&self) -> MediaFlags {
        self.update_flags(|flags, stream| {
            flags.video_enabled = !flags.video_enabled;
            if let Some(stream) = stream {
                stream.set_video_enabled(flags.video_enabled);
            }
        })
    }

    fn update_flags(&self, apply: impl FnOnce(&mut MediaFlags, Option<&StreamHandle>)) -> MediaFlags {
        let flags = {
            let mut core = self.lock();
            if self.is_ended() || core.state.is_terminal() {
                return core.flags;
            }
            let mut flags = core.flags;
            apply(&mut flags, core.local_stream.as_ref());
            core.flags = flags;
            flags
        };

        debug!(call_id = %self.inner.call_id, "Media flags {:?}", flags);
        self.inner.ctx.events.publish(CallEvent::MediaFlagsChanged {
            call_id: self.inner.call_id,
            flags,
        });
        flags
    }

    pub async fn switch_camera(&self) -> Result<()> {
        let stream = {
            let core = self.lock();
            if self.is_ended() || core.state.is_terminal() {
                return Ok(());
            }
            if !core.kind.has_video() {
                return Err(CallError::InvalidState("switch_camera on a voice call".to_string()));
            }
            core.local_stream
                .clone()
                .ok_or_else(|| CallError::InvalidState("no local stream acquired yet".to_string()))?
        };
        self.inner.ctx.media.switch_camera(&stream).await
    }

    /// Hang up. Safe to call any number of times.
    pub async fn end(&self) {
        let reason = {
            let core = self.lock();
            if core.state == SessionState::Incoming && !core.accepting {
                EndReason::Rejected
            } else {
                EndReason::LocalHangup
            }
        };
        self.terminate(SessionState::Ended, reason).await;
    }

    /// Surface an incoming session: listen for its messages and start ringing
    pub(crate) fn ring(&self) {
        let from = self.participants().into_iter().next();
        metrics::record_incoming_call();
        self.publish_state(SessionState::Idle, SessionState::Incoming, None);
        self.subscribe_transport();
        self.arm_ring_timer();

        if let Some(from) = from {
            info!(call_id = %self.inner.call_id, "Incoming {} call from {}", self.kind().as_str(), from);
            self.inner.ctx.events.publish(CallEvent::IncomingCall {
                call_id: self.inner.call_id,
                from,
                kind: self.kind(),
            });
        }
    }

    async fn acquire_local_stream(&self, kind: CallKind) -> Result<()> {
        let constraints = if kind.has_video() {
            MediaConstraints::video()
        } else {
            MediaConstraints::voice()
        };

        match self.inner.ctx.media.acquire(constraints).await {
            Ok(stream) => {
                let late = {
                    let mut core = self.lock();
                    if self.is_ended() {
                        Some(stream)
                    } else {
                        stream.set_audio_enabled(!core.flags.muted);
                        stream.set_video_enabled(core.flags.video_enabled);
                        core.local_stream = Some(stream);
                        None
                    }
                };
                match late {
                    Some(stream) => {
                        debug!(call_id = %self.inner.call_id, "Releasing stream acquired after end");
                        self.inner.ctx.media.release(&stream);
                        Err(CallError::SessionEnded(format!(
                            "call {} ended while acquiring media",
                            self.inner.call_id
                        )))
                    }
                    None => Ok(()),
                }
            }
            Err(_) if self.is_ended() => Err(CallError::SessionEnded(format!(
                "call {} ended while acquiring media",
                self.inner.call_id
            ))),
            Err(e) => {
                let reason = match e {
                    CallError::MediaUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                warn!(call_id = %self.inner.call_id, "Local media unavailable: {}", reason);
                self.terminate(SessionState::Failed, EndReason::MediaUnavailable(reason.clone()))
                    .await;
                Err(CallError::MediaUnavailable(reason))
            }
        }
    }

    async fn offer_to(&self, participant: ParticipantId) {
        let link = PeerLink::new(self.inner.call_id, participant.clone(), self.link_handler());
        let stream = {
            let mut core = self.lock();
            if self.is_ended() {
                return;
            }
            core.links.insert(participant.clone(), LinkSlot::new(link.clone()));
            core.local_stream.clone()
        };

        let offered = async {
            link.open(LinkRole::Caller, self.inner.ctx.connections.as_ref())?;
            if let Some(stream) = stream {
                link.attach_local_stream(stream)?;
            }
            link.create_offer().await
        }
        .await;

        match offered {
            Ok(offer) => {
                let message = SignalingMessage::Offer {
                    call_id: self.inner.call_id,
                    from: self.inner.local.clone(),
                    kind: self.kind(),
                    sdp: offer.sdp,
                    ice_restart: false,
                };
                self.send_description(&participant, message).await;
            }
            Err(CallError::LinkClosed(_)) => {
                debug!(call_id = %self.inner.call_id, "Link to {} closed before the offer went out", participant);
            }
            Err(e) => {
                warn!(call_id = %self.inner.call_id, "Offer to {} failed: {}", participant, e);
                self.abandon_link(&participant).await;
            }
        }
    }

    async fn accept_restart_offer(&self, participant: &ParticipantId, link: PeerLink, sdp: String) {
        {
            let mut core = self.lock();
            if let Some(slot) = core.links.get_mut(participant) {
                slot.description_sent = false;
                if let Some(timer) = slot.grace_timer.take() {
                    timer.abort();
                }
            }
        }

        info!(call_id = %self.inner.call_id, "ICE restart offered by {}", participant);
        match link.accept_restart(SessionDescription::offer(sdp)).await {
            Ok(answer) => {
                let message = SignalingMessage::Answer {
                    call_id: self.inner.call_id,
                    from: self.inner.local.clone(),
                    sdp: answer.sdp,
                };
                self.send_description(participant, message).await;
            }
            Err(e) => warn!(call_id = %self.inner.call_id, "Restart offer from {} not applied: {}", participant, e),
        }
    }

    async fn on_remote_bye(&self, sender: ParticipantId, reason: ByeReason) {
        info!(call_id = %self.inner.call_id, "{} left the call ({:?})", sender, reason);

        let (ringing, link, remaining) = {
            let mut core = self.lock();
            core.departed.insert(sender.clone());
            core.remote_streams.remove(&sender);
            let link = core.links.get(&sender).map(|slot| slot.link.clone());
            let remaining = core.remaining().count();
            (core.state == SessionState::Incoming && !core.accepting, link, remaining)
        };

        if let Some(link) = link {
            link.close().await;
        }

        if ringing {
            self.terminate(SessionState::Ended, EndReason::RemoteHangup).await;
        } else if remaining == 0 {
            let (target, end_reason) = match reason {
                ByeReason::Hangup => (SessionState::Ended, EndReason::RemoteHangup),
                ByeReason::Declined => (SessionState::Ended, EndReason::RemoteDeclined),
                ByeReason::Busy => (SessionState::Ended, EndReason::RemoteBusy),
                ByeReason::Timeout => (SessionState::Failed, EndReason::CallTimedOut),
                ByeReason::Failed => (SessionState::Failed, EndReason::LinksFailed),
            };
            self.terminate(target, end_reason).await;
        } else {
            self.recompute().await;
        }
    }

    async fn on_link_event(&self, participant: ParticipantId, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged(state) => {
                debug!(call_id = %self.inner.call_id, "Link to {} is {}", participant, state);
                self.inner.ctx.events.publish(CallEvent::LinkStateChanged {
                    call_id: self.inner.call_id,
                    participant: participant.clone(),
                    state,
                });

                if state.is_connected() {
                    let mut core = self.lock();
                    if let Some(slot) = core.links.get_mut(&participant) {
                        slot.ever_connected = true;
                        if let Some(timer) = slot.grace_timer.take() {
                            timer.abort();
                        }
                    }
                }
                if !self.is_ended() {
                    self.recompute().await;
                }
            }
            LinkEvent::LocalCandidate(candidate) => {
                let ready = {
                    let mut core = self.lock();
                    if self.is_ended() {
                        return;
                    }
                    match core.links.get_mut(&participant) {
                        Some(slot) if slot.description_sent => Some(candidate),
                        Some(slot) => {
                            slot.outbound.push(candidate);
                            None
                        }
                        None => None,
                    }
                };
                if let Some(candidate) = ready {
                    self.send_candidate(&participant, candidate).await;
                }
            }
            LinkEvent::RemoteStream(stream) => {
                {
                    let mut core = self.lock();
                    if self.is_ended() || core.state.is_terminal() {
                        return;
                    }
                    core.remote_streams.insert(participant.clone(), stream.clone());
                }
                let has_video = stream.has_video();
                self.inner.ctx.media.attach(stream, &participant);
                self.inner.ctx.events.publish(CallEvent::RemoteStreamAttached {
                    call_id: self.inner.call_id,
                    participant,
                    has_video,
                });
            }
            LinkEvent::Failed(reason) => self.on_link_failed(participant, reason).await,
        }
    }

    async fn on_link_failed(&self, participant: ParticipantId, reason: String) {
        if self.is_ended() {
            return;
        }
        self.inner.ctx.events.publish(CallEvent::LinkFailed {
            call_id: self.inner.call_id,
            participant: participant.clone(),
            reason: reason.clone(),
        });

        let max_restarts = self.inner.ctx.config.max_ice_restarts;
        let action = {
            let mut core = self.lock();
            if core.departed.contains(&participant) || core.failed.contains(&participant) {
                FailureAction::Ignore
            } else {
                match core.links.get_mut(&participant) {
                    None => FailureAction::Ignore,
                    Some(slot) if !slot.ever_connected => FailureAction::Abandon,
                    Some(slot) => match slot.link.role() {
                        Some(LinkRole::Caller) if slot.link.restarts() < max_restarts => {
                            slot.description_sent = false;
                            FailureAction::Restart(slot.link.clone())
                        }
                        Some(LinkRole::Callee) if slot.grace_timer.is_some() => FailureAction::Ignore,
                        Some(LinkRole::Callee) if max_restarts > 0 => FailureAction::AwaitRestart,
                        _ => FailureAction::Abandon,
                    },
                }
            }
        };

        match action {
            FailureAction::Restart(link) => {
                metrics::record_ice_restart();
                info!(
                    call_id = %self.inner.call_id,
                    "Link to {} failed ({}), restarting ICE",
                    participant,
                    reason
                );
                match link.restart_ice().await {
                    Ok(offer) => {
                        let message = SignalingMessage::Offer {
                            call_id: self.inner.call_id,
                            from: self.inner.local.clone(),
                            kind: self.kind(),
                            sdp: offer.sdp,
                            ice_restart: true,
                        };
                        self.send_description(&participant, message).await;
                        // The answer may never come
                        self.arm_grace_timer(participant);
                    }
                    Err(e) if e.is_precondition() => {
                        warn!(call_id = %self.inner.call_id, "ICE restart to {} refused: {}", participant, e);
                        self.abandon_link(&participant).await;
                    }
                    Err(e) => {
                        debug!(call_id = %self.inner.call_id, "ICE restart to {} failed: {}", participant, e);
                        self.arm_grace_timer(participant);
                    }
                }
            }
            FailureAction::AwaitRestart => {
                info!(
                    call_id = %self.inner.call_id,
                    "Link to {} failed ({}), waiting for a restart offer",
                    participant,
                    reason
                );
                self.arm_grace_timer(participant);
            }
            FailureAction::Abandon => {
                warn!(call_id = %self.inner.call_id, "Link to {} failed: {}", participant, reason);
                self.abandon_link(&participant).await;
            }
            FailureAction::Ignore => {}
        }
    }

    /// Close a failed link for good and check whether the call survives it
    async fn abandon_link(&self, participant: &ParticipantId) {
        let link = {
            let mut core = self.lock();
            if !core.failed.insert(participant.clone()) {
                return;
            }
            core.remote_streams.remove(participant);
            core.links.get_mut(participant).map(|slot| {
                if let Some(timer) = slot.grace_timer.take() {
                    timer.abort();
                }
                slot.link.clone()
            })
        };
        if let Some(link) = link {
            link.close().await;
        }

        let lost = {
            let core = self.lock();
            let remaining: Vec<&ParticipantId> = core.remaining().collect();
            let needed = self.inner.ctx.config.required_links(remaining.len());
            let viable = remaining.iter().filter(|p| !core.failed.contains(**p)).count();
            !core.state.is_terminal() && viable < needed
        };
        if lost {
            warn!(call_id = %self.inner.call_id, "Too few links left to reach quorum");
            self.terminate(SessionState::Failed, EndReason::LinksFailed).await;
        }
    }

    /// Move forward when enough links have answered or connected
    async fn recompute(&self) {
        let (transitions, ring_timer) = {
            let mut core = self.lock();
            if self.is_ended() || core.state.is_terminal() {
                return;
            }

            let remaining: Vec<ParticipantId> = core.remaining().cloned().collect();
            let needed = self.inner.ctx.config.required_links(remaining.len());
            let mut connected = 0;
            let mut answered = false;
            for participant in &remaining {
                if core.failed.contains(participant) {
                    continue;
                }
                if let Some(slot) = core.links.get(participant) {
                    let state = slot.link.state();
                    connected += usize::from(state.is_connected());
                    answered |= matches!(
                        state,
                        PeerLinkState::AnswerSent | PeerLinkState::AnswerReceived | PeerLinkState::Connected
                    );
                }
            }

            let mut transitions = Vec::new();
            if core.state == SessionState::Outgoing && (answered || connected > 0) {
                transitions.push((SessionState::Outgoing, SessionState::Connecting));
                core.state = SessionState::Connecting;
            }
            let mut ring_timer = None;
            if core.state == SessionState::Connecting && needed > 0 && connected >= needed {
                transitions.push((SessionState::Connecting, SessionState::Active));
                core.state = SessionState::Active;
                core.times.answered_at = Some(Utc::now());
                core.times.answered = Some(Instant::now());
                ring_timer = core.ring_timer.take();
            }
            (transitions, ring_timer)
        };

        if let Some(timer) = ring_timer {
            timer.abort();
        }
        for (previous, state) in transitions {
            if state == SessionState::Active {
                info!(call_id = %self.inner.call_id, "Call is active");
            }
            self.publish_state(previous, state, None);
        }
    }

    /// Explicit forward transition, ignored if the session moved on
    fn advance(&self, from: SessionState, to: SessionState) {
        let moved = {
            let mut core = self.lock();
            if self.is_ended() || core.state != from || !from.can_transition_to(to) {
                false
            } else {
                core.state = to;
                true
            }
        };
        if moved {
            self.publish_state(from, to, None);
        }
    }

    /// Single teardown path for end, reject, failure and timeout
    async fn terminate(&self, target: SessionState, reason: EndReason) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        let (previous, target, bye_to, links, stream, timers, subscription) = {
            let mut core = self.lock();
            let previous = core.state;
            let target = if previous.can_transition_to(target) {
                target
            } else {
                SessionState::Ended
            };
            core.state = target;
            core.end_reason = Some(reason.clone());
            core.times.ended_at = Some(Utc::now());
            core.times.ended = Some(Instant::now());
            core.pending_offer = None;
            core.early_candidates.clear();
            core.remote_streams.clear();

            let bye_to: Vec<ParticipantId> = if previous == SessionState::Idle {
                Vec::new()
            } else {
                core.remaining().cloned().collect()
            };
            let links: Vec<PeerLink> = core.links.values().map(|slot| slot.link.clone()).collect();
            let mut timers: Vec<JoinHandle<()>> = core
                .links
                .values_mut()
                .filter_map(|slot| slot.grace_timer.take())
                .collect();
            timers.extend(core.ring_timer.take());

            (
                previous,
                target,
                bye_to,
                links,
                core.local_stream.take(),
                timers,
                core.subscription.take(),
            )
        };

        for timer in timers {
            timer.abort();
        }
        drop(subscription);

        match target {
            SessionState::Failed => warn!(call_id = %self.inner.call_id, "Call failed: {:?}", reason),
            _ => info!(call_id = %self.inner.call_id, "Call ended: {:?}", reason),
        }
        if previous != target {
            self.publish_state(previous, target, Some(reason.clone()));
        }

        let bye_reason = bye_reason_for(&reason);
        join_all(bye_to.iter().map(|to| {
            self.send(
                to,
                SignalingMessage::Bye {
                    call_id: self.inner.call_id,
                    from: self.inner.local.clone(),
                    reason: bye_reason,
                },
            )
        }))
        .await;

        join_all(links.iter().map(|link| link.close())).await;

        if let Some(stream) = stream {
            self.inner.ctx.media.release(&stream);
        }

        if previous.is_live() {
            metrics::record_call_finished(target == SessionState::Failed, end_label(&reason));
            self.write_history(&reason).await;
        }
    }

    async fn write_history(&self, reason: &EndReason) {
        let record = {
            let core = self.lock();
            let Some(direction) = core.direction else {
                return;
            };
            let ended_at = core.times.ended_at.unwrap_or_else(Utc::now);
            CallRecord {
                call_id: self.inner.call_id,
                direction,
                kind: core.kind,
                remote_participants: core.participants.clone(),
                outcome: CallOutcome::from_end(reason, direction, core.times.answered_at.is_some()),
                started_at: core.times.started_at.unwrap_or(ended_at),
                answered_at: core.times.answered_at,
                ended_at,
            }
        };

        if let Err(e) = self.inner.ctx.history.record(record).await {
            warn!(call_id = %self.inner.call_id, "Failed to record call history: {}", e);
        }
    }

    fn subscribe_transport(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.inner.ctx.transport.subscribe(self.inner.call_id, tx);

        let session = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match session.upgrade() {
                    Some(inner) => CallSession { inner }.handle_signaling_message(message).await,
                    None => break,
                }
            }
        });

        let mut core = self.lock();
        if !self.is_ended() {
            core.subscription = Some(subscription);
        }
    }

    fn arm_ring_timer(&self) {
        let session = Arc::downgrade(&self.inner);
        let timeout = self.inner.ctx.config.ring_timeout();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = session.upgrade() {
                CallSession { inner }.on_ring_timeout().await;
            }
        });

        let mut core = self.lock();
        if self.is_ended() {
            timer.abort();
        } else if let Some(old) = core.ring_timer.replace(timer) {
            old.abort();
        }
    }

    async fn on_ring_timeout(&self) {
        {
            let mut core = self.lock();
            // Drop our own handle so teardown does not abort this task
            core.ring_timer.take();
            if self.is_ended()
                || !matches!(
                    core.state,
                    SessionState::Outgoing | SessionState::Incoming | SessionState::Connecting
                )
            {
                return;
            }
        }

        warn!(
            call_id = %self.inner.call_id,
            "Call not active after {:?}",
            self.inner.ctx.config.ring_timeout()
        );
        metrics::record_timeout();
        self.inner.ctx.events.publish(CallEvent::CallTimedOut {
            call_id: self.inner.call_id,
        });
        self.terminate(SessionState::Failed, EndReason::CallTimedOut).await;
    }

    /// Give a restarting link `ice_restart_grace` to reconnect
    fn arm_grace_timer(&self, participant: ParticipantId) {
        let session = Arc::downgrade(&self.inner);
        let grace = self.inner.ctx.config.ice_restart_grace();
        let waiting_on = participant.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = session.upgrade() {
                CallSession { inner }.on_grace_expired(waiting_on).await;
            }
        });

        let mut core = self.lock();
        match core.links.get_mut(&participant) {
            Some(slot) if !self.is_ended() => {
                if let Some(old) = slot.grace_timer.replace(timer) {
                    old.abort();
                }
            }
            _ => timer.abort(),
        }
    }

    async fn on_grace_expired(&self, participant: ParticipantId) {
        let recovered = {
            let mut core = self.lock();
            match core.links.get_mut(&participant) {
                Some(slot) => {
                    slot.grace_timer.take();
                    slot.link.state().is_connected()
                }
                None => true,
            }
        };
        if !recovered && !self.is_ended() {
            warn!(call_id = %self.inner.call_id, "ICE restart with {} did not recover, giving up", participant);
            self.abandon_link(&participant).await;
        }
    }

    /// Send our offer or answer, then the local candidates that waited for it
    async fn send_description(&self, to: &ParticipantId, message: SignalingMessage) {
        self.send(to, message).await;

        let outbound = {
            let mut core = self.lock();
            match core.links.get_mut(to) {
                Some(slot) => {
                    slot.description_sent = true;
                    std::mem::take(&mut slot.outbound)
                }
                None => Vec::new(),
            }
        };
        for candidate in outbound {
            self.send_candidate(to, candidate).await;
        }
    }

    async fn send_candidate(&self, to: &ParticipantId, candidate: IceCandidate) {
        let message = SignalingMessage::IceCandidate {
            call_id: self.inner.call_id,
            from: self.inner.local.clone(),
            candidate: candidate.to_descriptor(),
        };
        self.send(to, message).await;
    }

    async fn send(&self, to: &ParticipantId, message: SignalingMessage) {
        let name = message.name();
        if let Err(e) = self.inner.ctx.transport.send(to, message).await {
            warn!(call_id = %self.inner.call_id, "Sending {} to {} failed: {}", name, to, e);
        }
    }

    fn publish_state(&self, previous: SessionState, state: SessionState, reason: Option<EndReason>) {
        self.inner.ctx.events.publish(CallEvent::SessionStateChanged {
            call_id: self.inner.call_id,
            previous,
            state,
            reason,
        });
    }

    fn link_handler(&self) -> Arc<dyn LinkEventHandler> {
        Arc::new(SessionLinkHandler {
            session: Arc::downgrade(&self.inner),
        })
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.lock();
        f.debug_struct("CallSession")
            .field("call_id", &self.inner.call_id)
            .field("local", &self.inner.local)
            .field("state", &core.state)
            .field("participants", &core.participants)
            .finish()
    }
}

/// Routes link events back into the session without keeping it alive
struct SessionLinkHandler {
    session: Weak<SessionInner>,
}

#[async_trait]
impl LinkEventHandler for SessionLinkHandler {
    async fn on_link_event(&self, participant: &ParticipantId, event: LinkEvent) {
        if let Some(inner) = self.session.upgrade() {
            CallSession { inner }
                .on_link_event(participant.clone(), event)
                .await;
        }
    }
}

fn bye_reason_for(reason: &EndReason) -> ByeReason {
    match reason {
        EndReason::Rejected => ByeReason::Declined,
        EndReason::CallTimedOut => ByeReason::Timeout,
        EndReason::MediaUnavailable(_) | EndReason::LinksFailed => ByeReason::Failed,
        EndReason::LocalHangup
        | EndReason::RemoteHangup
        | EndReason::RemoteDeclined
        | EndReason::RemoteBusy => ByeReason::Hangup,
    }
}

fn end_label(reason: &EndReason) -> &'static str {
    match reason {
        EndReason::LocalHangup => "local_hangup",
        EndReason::RemoteHangup => "remote_hangup",
        EndReason::Rejected => "rejected",
        EndReason::RemoteDeclined => "remote_declined",
        EndReason::RemoteBusy => "remote_busy",
        EndReason::CallTimedOut => "timed_out",
        EndReason::MediaUnavailable(_) => "media_unavailable",
        EndReason::LinksFailed => "links_failed",
    }
}

fn join_ids(ids: &[ParticipantId]) -> String {
    ids.iter().map(ParticipantId::as_str).collect::<Vec<_>>().join(", ")
}
