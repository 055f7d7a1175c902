//! Message types carried by a tick.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Severity;
use crate::frame_buffer::AudioFrame;
use crate::session::{SessionConfig, SessionId, TrackDescriptor};

/// Kind tag written before every message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    StartRequest = 1,
    StartResponse = 2,
    StopNotice = 3,
    FrameRequest = 4,
    FrameData = 5,
    SessionException = 6,
    NodeStatistics = 7,
}

impl TryFrom<u8> for MessageTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageTag::StartRequest,
            2 => MessageTag::StartResponse,
            3 => MessageTag::StopNotice,
            4 => MessageTag::FrameRequest,
            5 => MessageTag::FrameData,
            6 => MessageTag::SessionException,
            7 => MessageTag::NodeStatistics,
            other => return Err(other),
        })
    }
}

/// Load figures a node reports about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatistics {
    pub playing_tracks: u32,
    pub total_tracks: u32,
    /// CPU usage of the node process, 0.0 to 1.0.
    pub process_cpu: f32,
    /// CPU usage of the whole machine, 0.0 to 1.0.
    pub system_cpu: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Local → node: begin producing frames for a session.
    StartRequest {
        session_id: SessionId,
        track: TrackDescriptor,
        encoded_track: Bytes,
        volume: u16,
        config: SessionConfig,
        /// Millisecond position to start from.
        resume_position: i64,
    },
    /// Node → local: outcome of a start request.
    StartResponse {
        session_id: SessionId,
        success: bool,
        failure_reason: Option<String>,
    },
    /// Either direction: the session is over.
    StopNotice { session_id: SessionId },
    /// Local → node: send up to `requested_frames` frames.
    FrameRequest {
        session_id: SessionId,
        requested_frames: u32,
        volume: u16,
        pending_seek: Option<i64>,
    },
    /// Node → local: produced frames.
    FrameData {
        session_id: SessionId,
        frames: Vec<AudioFrame>,
        /// Seek the node performed before producing these frames.
        seeked_position: Option<i64>,
        finished: bool,
    },
    /// Node → local: failure while playing.
    SessionException {
        session_id: SessionId,
        message: String,
        severity: Severity,
        cause: Option<String>,
    },
    /// Node → local: load snapshot.
    NodeStatistics(NodeStatistics),
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::StartRequest { .. } => MessageTag::StartRequest,
            Message::StartResponse { .. } => MessageTag::StartResponse,
            Message::StopNotice { .. } => MessageTag::StopNotice,
            Message::FrameRequest { .. } => MessageTag::FrameRequest,
            Message::FrameData { .. } => MessageTag::FrameData,
            Message::SessionException { .. } => MessageTag::SessionException,
            Message::NodeStatistics(_) => MessageTag::NodeStatistics,
        }
    }

    /// Session the message concerns; `None` for node statistics.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Message::StartRequest { session_id, .. }
            | Message::StartResponse { session_id, .. }
            | Message::StopNotice { session_id }
            | Message::FrameRequest { session_id, .. }
            | Message::FrameData { session_id, .. }
            | Message::SessionException { session_id, .. } => Some(*session_id),
            Message::NodeStatistics(_) => None,
        }
    }
}
