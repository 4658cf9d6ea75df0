//! In-process media engine
//!
//! Stands in for camera/microphone capture. Streams are plain flag holders;
//! the engine counts acquisitions and releases so callers can check that
//! every captured stream is stopped exactly once.

use crate::domain::call::value_object::CallKind;
use crate::domain::media::{MediaConstraints, MediaEngine, MediaStream, StreamHandle};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ParticipantId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct MemoryStream {
    id: String,
    has_video: bool,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl MemoryStream {
    pub fn new(has_video: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            has_video,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(has_video),
        }
    }

    pub fn for_kind(kind: CallKind) -> StreamHandle {
        Arc::new(Self::new(kind.has_video()))
    }
}

impl MediaStream for MemoryStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_video(&self) -> bool {
        self.has_video
    }

    fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    fn set_video_enabled(&self, enabled: bool) {
        if self.has_video {
            self.video_enabled.store(enabled, Ordering::SeqCst);
        }
    }
}

/// Media engine backed by [`MemoryStream`]s
#[derive(Default)]
pub struct MemoryMediaEngine {
    acquired: AtomicUsize,
    released: AtomicUsize,
    camera_switches: AtomicUsize,
    deny: AtomicBool,
    /// Simulated permission prompt
    acquire_delay: Mutex<Option<Duration>>,
    live: Mutex<Vec<String>>,
    attached: Mutex<Vec<(ParticipantId, String)>>,
}

impl MemoryMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `acquire` fail as if the user refused permission
    pub fn deny_access(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn set_acquire_delay(&self, delay: Option<Duration>) {
        *self.acquire_delay.lock() = delay;
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn camera_switches(&self) -> usize {
        self.camera_switches.load(Ordering::SeqCst)
    }

    /// Streams acquired and not yet released
    pub fn live_streams(&self) -> usize {
        self.live.lock().len()
    }

    /// Participants whose remote stream has been attached, in order
    pub fn attached(&self) -> Vec<ParticipantId> {
        self.attached.lock().iter().map(|(p, _)| p.clone()).collect()
    }
}

#[async_trait]
impl MediaEngine for MemoryMediaEngine {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<StreamHandle> {
        let delay = *self.acquire_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.deny.load(Ordering::SeqCst) {
            warn!("Media access denied");
            return Err(CallError::MediaUnavailable(
                "permission to capture media was denied".to_string(),
            ));
        }

        let stream: StreamHandle = Arc::new(MemoryStream::new(constraints.video));
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.live.lock().push(stream.id().to_string());

        info!(
            "Acquired local stream {} (audio={}, video={})",
            stream.id(),
            constraints.audio,
            constraints.video
        );
        Ok(stream)
    }

    fn release(&self, stream: &StreamHandle) {
        let mut live = self.live.lock();
        match live.iter().position(|id| id == stream.id()) {
            Some(index) => {
                live.remove(index);
                self.released.fetch_add(1, Ordering::SeqCst);
                debug!("Released local stream {}", stream.id());
            }
            None => warn!("Release of unknown or already released stream {}", stream.id()),
        }
    }

    fn attach(&self, stream: StreamHandle, participant: &ParticipantId) {
        debug!("Rendering stream {} from {}", stream.id(), participant);
        self.attached
            .lock()
            .push((participant.clone(), stream.id().to_string()));
    }

    async fn switch_camera(&self, stream: &StreamHandle) -> Result<()> {
        if !stream.has_video() {
            return Err(CallError::InvalidState(
                "switch_camera on a stream without video".to_string(),
            ));
        }
        self.camera_switches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release_once() {
        let engine = MemoryMediaEngine::new();
        let stream = engine.acquire(MediaConstraints::video()).await.unwrap();
        assert!(stream.has_video());
        assert_eq!(engine.live_streams(), 1);

        engine.release(&stream);
        engine.release(&stream);
        assert_eq!(engine.acquired(), 1);
        assert_eq!(engine.released(), 1);
        assert_eq!(engine.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_denied_access() {
        let engine = MemoryMediaEngine::new();
        engine.deny_access(true);
        let err = engine.acquire(MediaConstraints::voice()).await.unwrap_err();
        assert!(matches!(err, CallError::MediaUnavailable(_)));
        assert_eq!(engine.acquired(), 0);
    }

    #[tokio::test]
    async fn test_voice_stream_has_no_camera() {
        let engine = MemoryMediaEngine::new();
        let stream = engine.acquire(MediaConstraints::voice()).await.unwrap();
        stream.set_video_enabled(true);
        assert!(!stream.video_enabled());
        assert!(engine.switch_camera(&stream).await.is_err());
    }
}
