/// Simulated peer connection backend
///
/// Produces real SDP and candidates but moves no packets. Host candidates
/// come from the configured interfaces; every STUN server contributes a
/// server reflexive candidate and every TURN server a relay, at stable
/// addresses in the documentation ranges. A connection
/// reports ICE `Connected` once both descriptions are applied and at least
/// one remote candidate arrived. Reachability can be switched off to make
/// connectivity checks fail, and an established connection can be failed
/// on demand to exercise ICE restarts.
use crate::config::IceConfig;
use crate::domain::call::value_object::CallKind;
use crate::domain::media::StreamHandle;
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ParticipantId;
use crate::infrastructure::media::memory::MemoryStream;
use crate::infrastructure::protocols::ice::{CandidateType, IceCandidate};
use crate::infrastructure::protocols::webrtc::connection::{
    ConnectionObserver, IceConnectionState, PeerConnection, PeerConnectionFactory,
};
use crate::infrastructure::protocols::webrtc::sdp::{
    create_answer, create_offer, DtlsFingerprint, SdpType, SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

const PUBLIC_NET: [u8; 3] = [203, 0, 113];
const RELAY_NET: [u8; 3] = [198, 51, 100];

/// What a simulated agent gathers
#[derive(Debug, Clone, Default)]
struct GatherPlan {
    host_addresses: Vec<SocketAddr>,
    stun_servers: Vec<String>,
    turn_servers: Vec<String>,
}

impl GatherPlan {
    fn candidates(&self) -> Vec<IceCandidate> {
        let mut gathered = Vec::new();
        for &base in &self.host_addresses {
            gathered.push(IceCandidate::new(CandidateType::Host, base, 1));
            for server in &self.stun_servers {
                let mapped = server_address(server, base, PUBLIC_NET);
                gathered.push(IceCandidate::new(CandidateType::ServerReflexive, mapped, 1).with_related_address(base));
            }
            for server in &self.turn_servers {
                let relayed = server_address(server, base, RELAY_NET);
                gathered.push(IceCandidate::new(CandidateType::Relay, relayed, 1).with_related_address(base));
            }
        }
        gathered
    }
}

#[derive(Default)]
struct SimState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    connected: bool,
    remote_stream_sent: bool,
    kind: Option<CallKind>,
}

pub struct SimulatedConnection {
    participant: ParticipantId,
    observer: Arc<dyn ConnectionObserver>,
    plan: Arc<GatherPlan>,
    reachable: Arc<AtomicBool>,
    fingerprint: DtlsFingerprint,
    closed: AtomicBool,
    state: Mutex<SimState>,
}

impl SimulatedConnection {
    fn new(
        participant: ParticipantId,
        observer: Arc<dyn ConnectionObserver>,
        plan: Arc<GatherPlan>,
        reachable: Arc<AtomicBool>,
    ) -> Self {
        Self {
            participant,
            observer,
            plan,
            reachable,
            fingerprint: generate_fingerprint(),
            closed: AtomicBool::new(false),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CallError::LinkClosed(format!(
                "peer connection to {} is closed",
                self.participant
            )));
        }
        Ok(())
    }

    /// Gather candidates in the background, the way a real agent trickles them
    fn gather_candidates(&self, mid_count: usize) {
        let observer = self.observer.clone();
        let plan = self.plan.clone();
        let participant = self.participant.clone();

        tokio::spawn(async move {
            for gathered in plan.candidates() {
                for index in 0..mid_count.max(1) {
                    let mut candidate = gathered.clone();
                    candidate.sdp_mid = Some(index.to_string());
                    candidate.sdp_m_line_index = Some(index as u32);
                    debug!("Gathered {} for {}", candidate, participant);
                    observer.on_local_candidate(candidate).await;
                }
            }
        });
    }

    /// Run the connectivity check once both sides are known
    async fn check_connectivity(&self) {
        let report = {
            let mut state = self.state.lock();
            let ready = state.local.is_some() && state.remote.is_some() && state.remote_candidates > 0;
            if self.is_closed() || !ready || state.connected {
                return;
            }
            if self.reachable.load(Ordering::SeqCst) {
                state.connected = true;
                let first = !state.remote_stream_sent;
                state.remote_stream_sent = true;
                Some((first, state.kind.unwrap_or(CallKind::Voice)))
            } else {
                None
            }
        };

        self.observer.on_ice_state(IceConnectionState::Checking).await;
        match report {
            Some((first_connect, kind)) => {
                info!("Simulated ICE connected to {}", self.participant);
                self.observer.on_ice_state(IceConnectionState::Connected).await;
                if first_connect {
                    self.observer.on_remote_stream(MemoryStream::for_kind(kind)).await;
                }
            }
            None => {
                info!("Simulated ICE checks to {} failed", self.participant);
                self.observer.on_ice_state(IceConnectionState::Failed).await;
            }
        }
    }

    /// Drop connectivity and report ICE failure
    pub async fn fail_ice(&self) {
        if self.is_closed() {
            return;
        }
        self.state.lock().connected = false;
        self.observer.on_ice_state(IceConnectionState::Failed).await;
    }

    fn reset_connectivity(state: &mut SimState) {
        state.connected = false;
        state.remote_candidates = 0;
    }
}

#[async_trait]
impl PeerConnection for SimulatedConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.ensure_open()?;
        let kind = {
            let mut state = self.state.lock();
            if ice_restart {
                Self::reset_connectivity(&mut state);
            }
            state.kind.unwrap_or(CallKind::Voice)
        };

        let (ufrag, pwd) = generate_credentials();
        let offer = create_offer(kind, ufrag, pwd, self.fingerprint.clone());
        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let remote = self
            .state
            .lock()
            .remote
            .clone()
            .ok_or_else(|| CallError::Negotiation("create_answer without a remote offer".to_string()))?;
        if remote.sdp_type != SdpType::Offer {
            return Err(CallError::Negotiation("remote description is not an offer".to_string()));
        }

        let (ufrag, pwd) = generate_credentials();
        let answer = create_answer(&remote.parse()?, ufrag, pwd, self.fingerprint.clone());
        Ok(SessionDescription::answer(answer.to_sdp_string()))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let parsed = description.parse()?;
        self.state.lock().local = Some(description);

        self.gather_candidates(parsed.media_descriptions.len());
        self.check_connectivity().await;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let parsed = description.parse()?;
        {
            let mut state = self.state.lock();
            if state.remote.is_some() && description.sdp_type == SdpType::Offer {
                Self::reset_connectivity(&mut state);
            }
            if state.kind.is_none() || description.sdp_type == SdpType::Offer {
                state.kind = Some(parsed.call_kind());
            }
            state.remote = Some(description);
        }
        self.check_connectivity().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            if state.remote.is_none() {
                return Err(CallError::InvalidState(
                    "candidate added before the remote description".to_string(),
                ));
            }
            state.remote_candidates += 1;
        }
        debug!("Remote candidate {} from {}", candidate, self.participant);
        self.check_connectivity().await;
        Ok(())
    }

    fn add_local_stream(&self, stream: StreamHandle) {
        let kind = if stream.has_video() { CallKind::Video } else { CallKind::Voice };
        let mut state = self.state.lock();
        if state.kind.is_none() {
            state.kind = Some(kind);
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closed simulated connection to {}", self.participant);
        }
    }
}

/// Factory handing out [`SimulatedConnection`]s
pub struct SimulatedConnectionFactory {
    plan: Arc<GatherPlan>,
    reachable: Arc<AtomicBool>,
    connections: Mutex<Vec<Weak<SimulatedConnection>>>,
}

impl SimulatedConnectionFactory {
    /// Host candidates only
    pub fn new(host_addresses: Vec<SocketAddr>) -> Self {
        Self::with_plan(GatherPlan {
            host_addresses,
            ..GatherPlan::default()
        })
    }

    pub fn from_config(ice: &IceConfig) -> Self {
        Self::with_plan(GatherPlan {
            host_addresses: ice.host_addresses.clone(),
            stun_servers: ice.stun_servers.clone(),
            turn_servers: ice.turn_servers.iter().map(|turn| turn.url.clone()).collect(),
        })
    }

    fn with_plan(plan: GatherPlan) -> Self {
        Self {
            plan: Arc::new(plan),
            reachable: Arc::new(AtomicBool::new(true)),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// When false, every following connectivity check fails
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Connections handed out and not yet dropped
    pub fn tracked(&self) -> usize {
        self.connections.lock().len()
    }

    /// Live connection to `participant`, most recent first
    pub fn connection_to(&self, participant: &ParticipantId) -> Option<Arc<SimulatedConnection>> {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections
            .iter()
            .rev()
            .filter_map(|c| c.upgrade())
            .find(|c| c.participant() == participant && !c.is_closed())
    }

    /// Break connectivity to `participant`. Returns false when no live connection exists.
    pub async fn fail_ice(&self, participant: &ParticipantId) -> bool {
        match self.connection_to(participant) {
            Some(connection) => {
                connection.fail_ice().await;
                true
            }
            None => false,
        }
    }
}

impl PeerConnectionFactory for SimulatedConnectionFactory {
    fn create(
        &self,
        participant: &ParticipantId,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(SimulatedConnection::new(
            participant.clone(),
            observer,
            self.plan.clone(),
            self.reachable.clone(),
        ));
        let mut connections = self.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.push(Arc::downgrade(&connection));
        drop(connections);
        Ok(connection)
    }
}

/// Stable address a server would report for `base`
fn server_address(server: &str, base: SocketAddr, network: [u8; 3]) -> SocketAddr {
    let digest = Sha256::new()
        .chain_update(server)
        .chain_update(base.to_string())
        .finalize();
    let host = 1 + digest[0] % 254;
    let port = 49152 + u16::from_be_bytes([digest[1], digest[2]]) % 16384;
    SocketAddr::from(([network[0], network[1], network[2], host], port))
}

fn generate_credentials() -> (String, String) {
    let mut rng = rand::thread_rng();
    let ufrag: String = (&mut rng).sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    let pwd: String = (&mut rng).sample_iter(&Alphanumeric).take(24).map(char::from).collect();
    (ufrag, pwd)
}

/// SHA-256 over random bytes, formatted like a certificate fingerprint
fn generate_fingerprint() -> DtlsFingerprint {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let digest = Sha256::digest(seed);
    let value = hex::encode_upper(digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint::sha256(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServer;

    #[derive(Default)]
    struct Observer {
        candidates: Mutex<Vec<IceCandidate>>,
        states: Mutex<Vec<IceConnectionState>>,
        streams: Mutex<usize>,
    }

    #[async_trait]
    impl ConnectionObserver for Observer {
        async fn on_local_candidate(&self, candidate: IceCandidate) {
            self.candidates.lock().push(candidate);
        }

        async fn on_remote_stream(&self, _stream: StreamHandle) {
            *self.streams.lock() += 1;
        }

        async fn on_ice_state(&self, state: IceConnectionState) {
            self.states.lock().push(state);
        }
    }

    fn factory() -> SimulatedConnectionFactory {
        SimulatedConnectionFactory::new(vec!["192.0.2.10:50000".parse().unwrap()])
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = generate_fingerprint();
        assert_eq!(fingerprint.algorithm, "sha-256");
        assert_eq!(fingerprint.value.split(':').count(), 32);
    }

    #[tokio::test]
    async fn test_offer_answer_then_candidate_connects() {
        let factory = factory();
        let caller_observer = Arc::new(Observer::default());
        let callee_observer = Arc::new(Observer::default());
        let caller = factory.create(&ParticipantId::from("bob"), caller_observer.clone()).unwrap();
        let callee = factory.create(&ParticipantId::from("alice"), callee_observer.clone()).unwrap();

        caller.add_local_stream(MemoryStream::for_kind(CallKind::Video));
        let offer = caller.create_offer(false).await.unwrap();
        assert!(offer.sdp.contains("m=video"));
        caller.set_local_description(offer.clone()).await.unwrap();

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        let candidate = IceCandidate::new(CandidateType::Host, "192.0.2.20:50000".parse().unwrap(), 1);
        caller.add_ice_candidate(candidate).await.unwrap();

        assert!(caller_observer.states.lock().contains(&IceConnectionState::Connected));
        assert_eq!(*caller_observer.streams.lock(), 1);
        assert!(callee_observer.states.lock().is_empty());

        tokio::task::yield_now().await;
        assert_eq!(caller_observer.candidates.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_checks() {
        let factory = factory();
        factory.set_reachable(false);
        let observer = Arc::new(Observer::default());
        let connection = factory.create(&ParticipantId::from("bob"), observer.clone()).unwrap();

        let offer = connection.create_offer(false).await.unwrap();
        connection.set_local_description(offer.clone()).await.unwrap();
        connection
            .set_remote_description(SessionDescription::answer(offer.sdp.clone()))
            .await
            .unwrap();
        connection
            .add_ice_candidate(IceCandidate::new(CandidateType::Host, "192.0.2.20:1".parse().unwrap(), 1))
            .await
            .unwrap();

        assert_eq!(
            *observer.states.lock(),
            vec![IceConnectionState::Checking, IceConnectionState::Failed]
        );
    }

    #[tokio::test]
    async fn test_rejects_malformed_remote_sdp() {
        let factory = factory();
        let connection = factory
            .create(&ParticipantId::from("bob"), Arc::new(Observer::default()))
            .unwrap();
        let err = connection
            .set_remote_description(SessionDescription::offer("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Negotiation(_)));

        connection.close();
        connection.close();
        assert!(factory.connection_to(&ParticipantId::from("bob")).is_none());
    }

    #[tokio::test]
    async fn test_configured_servers_add_reflexive_and_relay_candidates() {
        let ice = IceConfig {
            stun_servers: vec!["stun:stun.example.org:3478".to_string()],
            turn_servers: vec![TurnServer {
                url: "turn:turn.example.org:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
            host_addresses: vec!["192.0.2.10:50000".parse().unwrap()],
        };
        let factory = SimulatedConnectionFactory::from_config(&ice);
        let observer = Arc::new(Observer::default());
        let connection = factory.create(&ParticipantId::from("bob"), observer.clone()).unwrap();

        let offer = connection.create_offer(false).await.unwrap();
        connection.set_local_description(offer).await.unwrap();
        tokio::task::yield_now().await;

        let candidates = observer.candidates.lock().clone();
        let kinds: Vec<CandidateType> = candidates.iter().map(|c| c.candidate_type).collect();
        assert_eq!(
            kinds,
            vec![CandidateType::Host, CandidateType::ServerReflexive, CandidateType::Relay]
        );

        let host = ice.host_addresses[0];
        let reflexive = &candidates[1];
        assert_eq!(reflexive.related_address, Some(host));
        assert!(reflexive.address.to_string().starts_with("203.0.113."));
        let relay = &candidates[2];
        assert_eq!(relay.related_address, Some(host));
        assert!(relay.address.to_string().starts_with("198.51.100."));
        assert!(relay.priority < reflexive.priority);

        // Same server and base, same mapping
        let again = SimulatedConnectionFactory::from_config(&ice).plan.candidates();
        assert_eq!(again[1].address, reflexive.address);
    }

    #[test]
    fn test_dropped_connections_are_pruned() {
        let factory = factory();
        for _ in 0..5 {
            let connection = factory
                .create(&ParticipantId::from("bob"), Arc::new(Observer::default()))
                .unwrap();
            drop(connection);
        }
        let kept = factory
            .create(&ParticipantId::from("carol"), Arc::new(Observer::default()))
            .unwrap();

        assert_eq!(factory.tracked(), 1);
        assert!(factory.connection_to(&ParticipantId::from("carol")).is_some());
        drop(kept);
    }
}
