//! Media Engine contract
//!
//! The engine captures local audio/video and renders remote streams. The
//! core never touches devices directly; it acquires one local stream per
//! session, flips its track flags and releases it when the session ends.

use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ParticipantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn voice() -> Self {
        Self { audio: true, video: false }
    }

    pub fn video() -> Self {
        Self { audio: true, video: true }
    }
}

/// A local or remote media stream
pub trait MediaStream: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    fn has_video(&self) -> bool;

    fn audio_enabled(&self) -> bool;

    fn set_audio_enabled(&self, enabled: bool);

    fn video_enabled(&self) -> bool;

    fn set_video_enabled(&self, enabled: bool);
}

/// Shared handle to a stream
pub type StreamHandle = Arc<dyn MediaStream>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Capture a local stream. May suspend while the platform asks for permission.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<StreamHandle>;

    /// Stop every track of a stream previously returned by `acquire`
    fn release(&self, stream: &StreamHandle);

    /// Render a remote stream for `participant`
    fn attach(&self, stream: StreamHandle, participant: &ParticipantId);

    /// Flip between front and back camera on a video stream
    async fn switch_camera(&self, stream: &StreamHandle) -> Result<()>;
}
