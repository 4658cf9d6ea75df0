/// Peer connection backend contract
///
/// A backend wraps the platform's peer connection object (libwebrtc,
/// webrtc-rs, a simulator). It reports raw events through a
/// [`ConnectionObserver`]; the owning peer link turns them into typed link
/// events.
use crate::domain::media::StreamHandle;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ParticipantId;
use crate::infrastructure::protocols::ice::IceCandidate;
use crate::infrastructure::protocols::webrtc::sdp::SessionDescription;
use async_trait::async_trait;
use std::sync::Arc;

/// ICE connection state as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Raw callbacks from a backend
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// A local candidate was gathered and should be trickled to the remote side
    async fn on_local_candidate(&self, candidate: IceCandidate);

    /// The remote side started sending media
    async fn on_remote_stream(&self, stream: StreamHandle);

    async fn on_ice_state(&self, state: IceConnectionState);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Send the local capture stream over this connection
    fn add_local_stream(&self, stream: StreamHandle);

    /// Release native resources. Must be safe to call more than once.
    fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        participant: &ParticipantId,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>>;
}
