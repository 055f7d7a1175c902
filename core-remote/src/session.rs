//! # Remote Session Handle
//!
//! Everything the local side knows about one track being played on a remote
//! node: its frame buffer, pending seek, marker, volume and failure state.
//!
//! ## Ownership
//!
//! A session is referenced by exactly one owner at a time: the session table
//! of a node processor, or the abandoned-session queue while it waits for a
//! new node. The owner link is weak so a stopped session can ask its node to
//! forget it without keeping the node alive.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{SessionFailure, Severity};
use crate::frame_buffer::{AudioFrame, BufferedFrame, ConsumeOutcome, FrameBuffer};
use crate::marker::{MarkerState, MarkerTracker, TrackMarker};

/// Highest accepted volume; 100 is unity gain.
pub const MAX_VOLUME: u16 = 1000;

const NO_SEEK: i64 = -1;

// ============================================================================
// Identity & Descriptors
// ============================================================================

/// Process-unique session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Track metadata sent to the node alongside the encoded track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub identifier: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    /// Track length in milliseconds, `None` for live streams.
    #[serde(default)]
    pub length_ms: Option<u64>,
    #[serde(default)]
    pub uri: Option<String>,
}

impl TrackDescriptor {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: None,
            author: None,
            length_ms: None,
            uri: None,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_length(mut self, length: Duration) -> Self {
        self.length_ms = Some(length.as_millis() as u64);
        self
    }
}

/// Output format the node should encode to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Duration of one encoded frame in milliseconds.
    pub frame_duration_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            codec: "opus".to_string(),
            sample_rate: 48_000,
            channels: 2,
            frame_duration_ms: 20,
        }
    }
}

impl AudioFormat {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_duration_ms))
    }
}

/// Per-session settings sent to the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub format: AudioFormat,
    /// Buffered audio kept locally; the relay default applies when `None`.
    #[serde(default)]
    pub buffer_duration_ms: Option<u64>,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.format.frame_duration_ms == 0 {
            return Err("format.frame_duration_ms must be > 0".to_string());
        }
        if self.format.channels == 0 || self.format.sample_rate == 0 {
            return Err("format must have channels and a sample rate".to_string());
        }
        if self.buffer_duration_ms == Some(0) {
            return Err("buffer_duration_ms must be > 0".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Receives user-meaningful events of one session.
#[cfg_attr(test, mockall::automock)]
pub trait SessionListener: Send + Sync {
    /// A failure was reported for the session.
    fn on_failure(&self, failure: &SessionFailure);

    /// The terminator was consumed; the track is over.
    fn on_finished(&self) {}
}

/// Current holder of a session inside a node processor.
pub(crate) trait SessionOwner: Send + Sync {
    /// The session was stopped locally and should be forgotten by the node.
    fn stop_requested(&self, id: SessionId);
}

// ============================================================================
// Session State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    /// No data received yet.
    Loading = 0,
    /// Data received and the node is producing.
    Playing = 1,
    /// Stopped locally or finished by the node.
    Finished = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Loading,
            1 => SessionState::Playing,
            _ => SessionState::Finished,
        }
    }
}

// ============================================================================
// RemoteSession
// ============================================================================

pub struct RemoteSession {
    id: SessionId,
    track: TrackDescriptor,
    encoded_track: Bytes,
    config: SessionConfig,
    buffer: FrameBuffer,
    state: AtomicU8,
    volume: AtomicU16,
    pending_seek: AtomicI64,
    last_consumed_timecode: AtomicI64,
    received_data: AtomicBool,
    marker: MarkerTracker,
    last_failure: Mutex<Option<SessionFailure>>,
    listener: Arc<dyn SessionListener>,
    owner: Mutex<Option<Weak<dyn SessionOwner>>>,
}

impl RemoteSession {
    pub fn new(
        id: SessionId,
        track: TrackDescriptor,
        encoded_track: Bytes,
        config: SessionConfig,
        buffer_duration: Duration,
        volume: u16,
        listener: Arc<dyn SessionListener>,
    ) -> Arc<Self> {
        let buffer_duration = config
            .buffer_duration_ms
            .map(Duration::from_millis)
            .unwrap_or(buffer_duration);
        let buffer = FrameBuffer::for_duration(buffer_duration, config.format.frame_duration());

        Arc::new(Self {
            id,
            track,
            encoded_track,
            config,
            buffer,
            state: AtomicU8::new(SessionState::Loading as u8),
            volume: AtomicU16::new(volume.min(MAX_VOLUME)),
            pending_seek: AtomicI64::new(NO_SEEK),
            last_consumed_timecode: AtomicI64::new(0),
            received_data: AtomicBool::new(false),
            marker: MarkerTracker::new(),
            last_failure: Mutex::new(None),
            listener,
            owner: Mutex::new(None),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn track(&self) -> &TrackDescriptor {
        &self.track
    }

    pub fn encoded_track(&self) -> &Bytes {
        &self.encoded_track
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SessionState::Finished
    }

    pub fn has_received_data(&self) -> bool {
        self.received_data.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Volume & position
    // ------------------------------------------------------------------------

    pub fn volume(&self) -> u16 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, volume: u16) {
        self.volume.store(volume.min(MAX_VOLUME), Ordering::Relaxed);
    }

    pub fn pending_seek(&self) -> Option<i64> {
        match self.pending_seek.load(Ordering::Acquire) {
            NO_SEEK => None,
            position => Some(position),
        }
    }

    /// Request a seek. The node is told on its next tick and buffered frames
    /// are discarded when the first post-seek frame arrives.
    pub fn set_position(&self, timecode: i64) {
        if self.is_finished() {
            return;
        }
        let timecode = timecode.max(0);
        self.pending_seek.store(timecode, Ordering::Release);
        self.buffer.set_clear_on_insert();
        self.marker.check_seek_timecode(timecode);
    }

    /// Clear the pending seek if `acknowledged` is still the requested one.
    pub fn acknowledge_seek(&self, acknowledged: i64) -> bool {
        self.pending_seek
            .compare_exchange(acknowledged, NO_SEEK, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pending seek if any, else the timecode of the last consumed frame.
    pub fn position(&self) -> i64 {
        self.pending_seek()
            .unwrap_or_else(|| self.last_consumed_timecode.load(Ordering::Acquire))
    }

    /// Where a new node should start producing.
    ///
    /// Buffered frames are kept when a session moves, so the new node starts
    /// right after the newest frame already received.
    pub fn resume_position(&self) -> i64 {
        if let Some(seek) = self.pending_seek() {
            return seek;
        }
        match self.buffer.last_input_timecode() {
            Some(last) => last + i64::from(self.config.format.frame_duration_ms),
            None => self.position(),
        }
    }

    /// Frames to ask the node for on the next tick.
    pub fn frames_to_request(&self) -> usize {
        if self.pending_seek().is_some() {
            self.buffer.full_capacity()
        } else {
            self.buffer.remaining_capacity()
        }
    }

    pub fn set_marker(&self, marker: Option<TrackMarker>) {
        self.marker.set(marker, self.position());
    }

    // ------------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------------

    /// Append frames received from the node.
    pub fn receive_frames(&self, frames: Vec<AudioFrame>) {
        if self.is_finished() {
            debug!(session = %self.id, dropped = frames.len(), "Frames for finished session");
            return;
        }
        self.received_data.store(true, Ordering::Release);
        let _ = self.state.compare_exchange(
            SessionState::Loading as u8,
            SessionState::Playing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        for frame in frames {
            let timecode = frame.timecode;
            match self.buffer.consume(frame) {
                Ok(ConsumeOutcome::Accepted) => {}
                Ok(ConsumeOutcome::Duplicate) => {
                    debug!(session = %self.id, timecode, "Discarded duplicate frame");
                }
                Err(e) => {
                    warn!(session = %self.id, timecode, error = %e, "Dropped frame from node");
                }
            }
        }
    }

    /// The node has no more frames for this session.
    pub(crate) fn finish_input(&self) {
        self.buffer.set_terminate_on_empty();
        self.state
            .store(SessionState::Finished as u8, Ordering::Release);
        self.detach_owner();
    }

    // ------------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------------

    /// Next frame for playback, never blocking.
    pub fn provide_frame(&self) -> Option<BufferedFrame> {
        let frame = self.buffer.provide();
        self.observe(frame.as_ref());
        frame
    }

    /// Next frame for playback, waiting at most `timeout`.
    pub fn provide_frame_timeout(&self, timeout: Duration) -> Option<BufferedFrame> {
        let frame = self.buffer.provide_timeout(timeout);
        self.observe(frame.as_ref());
        frame
    }

    fn observe(&self, frame: Option<&BufferedFrame>) {
        match frame {
            Some(BufferedFrame::Audio(audio)) => {
                self.last_consumed_timecode
                    .store(audio.timecode, Ordering::Release);
                self.marker.check_playback_timecode(audio.timecode);
            }
            Some(BufferedFrame::Terminator) => {
                self.state
                    .store(SessionState::Finished as u8, Ordering::Release);
                self.marker.trigger(MarkerState::Ended);
                self.listener.on_finished();
            }
            None => {}
        }
    }

    // ------------------------------------------------------------------------
    // Failures & stopping
    // ------------------------------------------------------------------------

    /// Record and forward a failure without stopping the session.
    pub fn report_failure(&self, failure: SessionFailure) {
        match failure.severity {
            Severity::Common => {
                debug!(session = %self.id, error = %failure, "Session failure")
            }
            Severity::Suspicious => {
                warn!(session = %self.id, error = %failure, cause = ?failure.cause, "Session failure")
            }
            Severity::Fault => {
                error!(session = %self.id, error = %failure, cause = ?failure.cause, "Session failure")
            }
        }

        self.listener.on_failure(&failure);
        *self.last_failure.lock() = Some(failure);
    }

    /// Report a failure and stop the session.
    pub fn fail(&self, failure: SessionFailure) {
        self.report_failure(failure);
        self.stop();
    }

    pub fn last_failure(&self) -> Option<SessionFailure> {
        self.last_failure.lock().clone()
    }

    /// Stop the session. The owning node is told on its next tick.
    ///
    /// Returns `false` if the session was already finished.
    pub fn stop(&self) -> bool {
        let previous = self
            .state
            .swap(SessionState::Finished as u8, Ordering::AcqRel);

        self.buffer.set_terminate_on_empty();
        self.buffer.clear();

        if SessionState::from_u8(previous) == SessionState::Finished {
            return false;
        }

        self.marker.trigger(MarkerState::Stopped);
        let owner = self.owner.lock().take();
        if let Some(owner) = owner.and_then(|weak| weak.upgrade()) {
            owner.stop_requested(self.id);
        }
        true
    }

    // ------------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------------

    pub(crate) fn attach_owner(&self, owner: Weak<dyn SessionOwner>) {
        *self.owner.lock() = Some(owner);
    }

    pub(crate) fn detach_owner(&self) {
        self.owner.lock().take();
    }
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("id", &self.id)
            .field("track", &self.track.identifier)
            .field("state", &self.state())
            .field("pending_seek", &self.pending_seek())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    pub(crate) struct NullListener;

    impl SessionListener for NullListener {
        fn on_failure(&self, _failure: &SessionFailure) {}
    }

    pub(crate) fn test_session(id: u64) -> Arc<RemoteSession> {
        test_session_with(id, Arc::new(NullListener))
    }

    pub(crate) fn test_session_with(
        id: u64,
        listener: Arc<dyn SessionListener>,
    ) -> Arc<RemoteSession> {
        RemoteSession::new(
            SessionId(id),
            TrackDescriptor::new(format!("track-{id}")),
            Bytes::from_static(b"encoded"),
            SessionConfig {
                buffer_duration_ms: Some(100),
                ..SessionConfig::default()
            },
            Duration::from_secs(3),
            100,
            listener,
        )
    }

    fn frame(timecode: i64) -> AudioFrame {
        AudioFrame::new(timecode, Bytes::from_static(b"f"))
    }

    #[derive(Default)]
    struct CountingOwner {
        stops: AtomicUsize,
    }

    impl SessionOwner for CountingOwner {
        fn stop_requested(&self, _id: SessionId) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_state_transitions() {
        let session = test_session(1);
        assert_eq!(session.state(), SessionState::Loading);

        session.receive_frames(vec![frame(0)]);
        assert_eq!(session.state(), SessionState::Playing);
        assert!(session.has_received_data());

        session.stop();
        assert_eq!(session.state(), SessionState::Finished);
    }

    #[test]
    fn test_frames_to_request_tracks_capacity() {
        let session = test_session(1);
        assert_eq!(session.buffer().full_capacity(), 5);
        assert_eq!(session.frames_to_request(), 5);

        session.receive_frames((0..5).map(|i| frame(i * 20)).collect());
        assert_eq!(session.frames_to_request(), 0);

        session.set_position(10_000);
        assert_eq!(session.frames_to_request(), 5);
    }

    #[test]
    fn test_seek_acknowledgement_ignores_stale_values() {
        let session = test_session(1);
        session.set_position(5000);
        session.set_position(9000);

        assert!(!session.acknowledge_seek(5000));
        assert_eq!(session.pending_seek(), Some(9000));

        assert!(session.acknowledge_seek(9000));
        assert_eq!(session.pending_seek(), None);
    }

    #[test]
    fn test_position_and_resume_position() {
        let session = test_session(1);
        session.receive_frames(vec![frame(0), frame(20), frame(40)]);
        session.provide_frame();
        session.provide_frame();

        assert_eq!(session.position(), 20);
        assert_eq!(session.resume_position(), 60);

        session.set_position(3000);
        assert_eq!(session.position(), 3000);
        assert_eq!(session.resume_position(), 3000);
    }

    #[test]
    fn test_stop_notifies_owner_once() {
        let session = test_session(1);
        let owner = Arc::new(CountingOwner::default());
        let weak: Weak<dyn SessionOwner> = Arc::downgrade(&owner) as Weak<dyn SessionOwner>;
        session.attach_owner(weak);

        assert!(session.stop());
        assert!(!session.stop());
        assert_eq!(owner.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_clears_buffer_and_terminates() {
        let session = test_session(1);
        session.receive_frames(vec![frame(0), frame(20)]);
        session.stop();

        assert_eq!(session.provide_frame(), Some(BufferedFrame::Terminator));
        assert!(session.provide_frame().is_none());
    }

    #[test]
    fn test_fail_reports_to_listener_and_stops() {
        let mut listener = MockSessionListener::new();
        listener
            .expect_on_failure()
            .withf(|failure| failure.message == "Could not find next node to play on")
            .times(1)
            .return_const(());

        let session = test_session_with(1, Arc::new(listener));
        session.fail(SessionFailure::common("Could not find next node to play on"));

        assert!(session.is_finished());
        assert_eq!(
            session.last_failure().map(|f| f.severity),
            Some(Severity::Common)
        );
    }

    #[test]
    fn test_terminator_finishes_session() {
        let mut listener = MockSessionListener::new();
        listener.expect_on_finished().times(1).return_const(());

        let session = test_session_with(1, Arc::new(listener));
        session.receive_frames(vec![frame(0)]);
        session.finish_input();

        assert!(matches!(session.provide_frame(), Some(BufferedFrame::Audio(_))));
        assert_eq!(session.provide_frame(), Some(BufferedFrame::Terminator));
        assert!(session.is_finished());
    }

    #[test]
    fn test_volume_is_clamped() {
        let session = test_session(1);
        session.set_volume(5000);
        assert_eq!(session.volume(), MAX_VOLUME);
    }

    #[test]
    fn test_config_round_trips_as_json() {
        let config = SessionConfig::default();
        let json = serde_json::to_vec(&config).unwrap();
        let parsed: SessionConfig = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, config);
        assert!(config.validate().is_ok());
    }
}
