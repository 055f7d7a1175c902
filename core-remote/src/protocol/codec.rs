//! Length-framed binary codec for tick bodies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::message::{Message, MessageTag, NodeStatistics};
use crate::error::Severity;
use crate::frame_buffer::AudioFrame;
use crate::session::SessionId;

/// Largest message length representable in the 30-bit header field.
pub const MAX_MESSAGE_LEN: usize = (1 << 30) - 1;

const LENGTH_MASK: u32 = 0x3FFF_FFFF;
const NO_POSITION: i64 = -1;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("empty message (no tag byte)")]
    EmptyMessage,

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: i64 },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("{field} too long: {len} bytes")]
    TooLong { field: &'static str, len: usize },

    #[error("invalid JSON in {field}: {source}")]
    Json {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

type CodecResult<T> = std::result::Result<T, CodecError>;

// ============================================================================
// Encoding
// ============================================================================

/// Encode `messages` followed by the terminator.
pub fn encode_messages(messages: &[Message]) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64 + messages.len() * 32);
    for message in messages {
        encode_message(&mut buf, message)?;
    }
    buf.put_u32(0);
    Ok(buf.freeze())
}

fn encode_message(buf: &mut BytesMut, message: &Message) -> CodecResult<()> {
    let header_at = buf.len();
    buf.put_u32(0);
    buf.put_u8(message.tag() as u8);

    match message {
        Message::StartRequest {
            session_id,
            track,
            encoded_track,
            volume,
            config,
            resume_position,
        } => {
            buf.put_u64(session_id.0);
            put_json(buf, "track", track)?;
            put_blob(buf, "encoded_track", encoded_track)?;
            buf.put_u16(*volume);
            put_json(buf, "config", config)?;
            buf.put_i64(*resume_position);
        }
        Message::StartResponse {
            session_id,
            success,
            failure_reason,
        } => {
            buf.put_u64(session_id.0);
            buf.put_u8(u8::from(*success));
            put_str(buf, "failure_reason", failure_reason.as_deref().unwrap_or(""))?;
        }
        Message::StopNotice { session_id } => {
            buf.put_u64(session_id.0);
        }
        Message::FrameRequest {
            session_id,
            requested_frames,
            volume,
            pending_seek,
        } => {
            buf.put_u64(session_id.0);
            buf.put_u32(*requested_frames);
            buf.put_u16(*volume);
            buf.put_i64(pending_seek.unwrap_or(NO_POSITION));
        }
        Message::FrameData {
            session_id,
            frames,
            seeked_position,
            finished,
        } => {
            buf.put_u64(session_id.0);
            buf.put_u32(len_u32("frames", frames.len())?);
            for frame in frames {
                buf.put_i64(frame.timecode);
                put_blob(buf, "frame", &frame.data)?;
            }
            buf.put_i64(seeked_position.unwrap_or(NO_POSITION));
            buf.put_u8(u8::from(*finished));
        }
        Message::SessionException {
            session_id,
            message,
            severity,
            cause,
        } => {
            buf.put_u64(session_id.0);
            put_str(buf, "message", message)?;
            buf.put_u8(severity.to_wire());
            put_str(buf, "cause", cause.as_deref().unwrap_or(""))?;
        }
        Message::NodeStatistics(stats) => {
            buf.put_u32(stats.playing_tracks);
            buf.put_u32(stats.total_tracks);
            buf.put_f32(stats.process_cpu);
            buf.put_f32(stats.system_cpu);
        }
    }

    let len = buf.len() - header_at - 4;
    if len > MAX_MESSAGE_LEN {
        return Err(CodecError::TooLong {
            field: "message",
            len,
        });
    }
    buf[header_at..header_at + 4].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(())
}

fn len_u32(field: &'static str, len: usize) -> CodecResult<u32> {
    u32::try_from(len).map_err(|_| CodecError::TooLong { field, len })
}

fn put_str(buf: &mut BytesMut, field: &'static str, value: &str) -> CodecResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::TooLong {
        field,
        len: value.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_blob(buf: &mut BytesMut, field: &'static str, value: &[u8]) -> CodecResult<()> {
    buf.put_u32(len_u32(field, value.len())?);
    buf.put_slice(value);
    Ok(())
}

fn put_json<T: serde::Serialize>(
    buf: &mut BytesMut,
    field: &'static str,
    value: &T,
) -> CodecResult<()> {
    let json = serde_json::to_vec(value).map_err(|source| CodecError::Json { field, source })?;
    put_blob(buf, field, &json)
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a tick body.
///
/// Decoding stops at the terminator. Running out of input exactly at a
/// message boundary is accepted as well, so an empty body means "no
/// messages". Header flag bits and bytes trailing a known payload are
/// ignored.
pub fn decode_messages(body: &[u8]) -> CodecResult<Vec<Message>> {
    let mut input = body;
    let mut messages = Vec::new();

    while input.has_remaining() {
        let header = get_u32(&mut input)?;
        let len = (header & LENGTH_MASK) as usize;
        if len == 0 {
            break;
        }

        need(&input, len)?;
        let (mut payload, rest) = input.split_at(len);
        input = rest;
        messages.push(decode_message(&mut payload)?);
    }

    Ok(messages)
}

fn decode_message(input: &mut &[u8]) -> CodecResult<Message> {
    if !input.has_remaining() {
        return Err(CodecError::EmptyMessage);
    }
    let raw_tag = input.get_u8();
    let tag = MessageTag::try_from(raw_tag).map_err(CodecError::UnknownTag)?;

    let message = match tag {
        MessageTag::StartRequest => Message::StartRequest {
            session_id: get_session(input)?,
            track: get_json(input, "track")?,
            encoded_track: get_blob(input)?,
            volume: get_u16(input)?,
            config: get_json(input, "config")?,
            resume_position: get_i64(input)?,
        },
        MessageTag::StartResponse => Message::StartResponse {
            session_id: get_session(input)?,
            success: get_bool(input, "success")?,
            failure_reason: non_empty(get_str(input, "failure_reason")?),
        },
        MessageTag::StopNotice => Message::StopNotice {
            session_id: get_session(input)?,
        },
        MessageTag::FrameRequest => Message::FrameRequest {
            session_id: get_session(input)?,
            requested_frames: get_u32(input)?,
            volume: get_u16(input)?,
            pending_seek: get_position(input)?,
        },
        MessageTag::FrameData => {
            let session_id = get_session(input)?;
            let count = get_u32(input)? as usize;
            // Each frame needs at least a timecode and a blob length.
            need(input, count.saturating_mul(12))?;
            let mut frames = Vec::with_capacity(count);
            for _ in 0..count {
                let timecode = get_i64(input)?;
                frames.push(AudioFrame::new(timecode, get_blob(input)?));
            }
            Message::FrameData {
                session_id,
                frames,
                seeked_position: get_position(input)?,
                finished: get_bool(input, "finished")?,
            }
        }
        MessageTag::SessionException => {
            let session_id = get_session(input)?;
            let message = get_str(input, "message")?;
            let raw = get_u8(input)?;
            let severity = Severity::from_wire(raw).ok_or(CodecError::InvalidValue {
                field: "severity",
                value: i64::from(raw),
            })?;
            Message::SessionException {
                session_id,
                message,
                severity,
                cause: non_empty(get_str(input, "cause")?),
            }
        }
        MessageTag::NodeStatistics => Message::NodeStatistics(NodeStatistics {
            playing_tracks: get_u32(input)?,
            total_tracks: get_u32(input)?,
            process_cpu: get_f32(input)?,
            system_cpu: get_f32(input)?,
        }),
    };

    Ok(message)
}

fn need(input: &&[u8], needed: usize) -> CodecResult<()> {
    if input.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: input.remaining(),
        });
    }
    Ok(())
}

fn get_u8(input: &mut &[u8]) -> CodecResult<u8> {
    need(input, 1)?;
    Ok(input.get_u8())
}

fn get_u16(input: &mut &[u8]) -> CodecResult<u16> {
    need(input, 2)?;
    Ok(input.get_u16())
}

fn get_u32(input: &mut &[u8]) -> CodecResult<u32> {
    need(input, 4)?;
    Ok(input.get_u32())
}

fn get_i64(input: &mut &[u8]) -> CodecResult<i64> {
    need(input, 8)?;
    Ok(input.get_i64())
}

fn get_f32(input: &mut &[u8]) -> CodecResult<f32> {
    need(input, 4)?;
    Ok(input.get_f32())
}

fn get_session(input: &mut &[u8]) -> CodecResult<SessionId> {
    need(input, 8)?;
    Ok(SessionId(input.get_u64()))
}

fn get_bool(input: &mut &[u8], field: &'static str) -> CodecResult<bool> {
    match get_u8(input)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidValue {
            field,
            value: i64::from(other),
        }),
    }
}

fn get_position(input: &mut &[u8]) -> CodecResult<Option<i64>> {
    match get_i64(input)? {
        NO_POSITION => Ok(None),
        position if position >= 0 => Ok(Some(position)),
        other => Err(CodecError::InvalidValue {
            field: "position",
            value: other,
        }),
    }
}

fn get_str(input: &mut &[u8], field: &'static str) -> CodecResult<String> {
    let len = get_u16(input)? as usize;
    need(input, len)?;
    let slice: &[u8] = input;
    let (raw, rest) = slice.split_at(len);
    *input = rest;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
}

fn get_blob(input: &mut &[u8]) -> CodecResult<Bytes> {
    let len = get_u32(input)? as usize;
    need(input, len)?;
    Ok(input.copy_to_bytes(len))
}

fn get_json<T: serde::de::DeserializeOwned>(
    input: &mut &[u8],
    field: &'static str,
) -> CodecResult<T> {
    let raw = get_blob(input)?;
    serde_json::from_slice(&raw).map_err(|source| CodecError::Json { field, source })
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionConfig, TrackDescriptor};

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::StartRequest {
                session_id: SessionId(1),
                track: TrackDescriptor::new("yt:abc").with_uri("https://example.com/abc"),
                encoded_track: Bytes::from_static(b"\x01\x02\x03"),
                volume: 100,
                config: SessionConfig::default(),
                resume_position: 0,
            },
            Message::FrameRequest {
                session_id: SessionId(1),
                requested_frames: 150,
                volume: 80,
                pending_seek: Some(42_000),
            },
            Message::FrameData {
                session_id: SessionId(1),
                frames: vec![
                    AudioFrame::new(42_000, Bytes::from_static(b"aa")),
                    AudioFrame::new(42_020, Bytes::from_static(b"bb")),
                ],
                seeked_position: Some(42_000),
                finished: false,
            },
            Message::SessionException {
                session_id: SessionId(1),
                message: "Something broke".to_string(),
                severity: Severity::Fault,
                cause: None,
            },
            Message::StartResponse {
                session_id: SessionId(2),
                success: false,
                failure_reason: Some("Unsupported codec".to_string()),
            },
            Message::StopNotice {
                session_id: SessionId(3),
            },
            Message::NodeStatistics(NodeStatistics {
                playing_tracks: 12,
                total_tracks: 20,
                process_cpu: 0.25,
                system_cpu: 0.5,
            }),
        ]
    }

    #[test]
    fn test_every_message_kind_survives_encoding() {
        let messages = sample_messages();
        let encoded = encode_messages(&messages).unwrap();
        assert_eq!(decode_messages(&encoded).unwrap(), messages);
    }

    #[test]
    fn test_header_layout() {
        let encoded = encode_messages(&[Message::StopNotice {
            session_id: SessionId(7),
        }])
        .unwrap();

        // header(4) + tag(1) + session(8) + terminator(4)
        assert_eq!(encoded.len(), 17);
        assert_eq!(&encoded[..4], &9u32.to_be_bytes());
        assert_eq!(encoded[4], MessageTag::StopNotice as u8);
        assert_eq!(&encoded[13..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_empty_body_and_bare_terminator() {
        assert!(decode_messages(&[]).unwrap().is_empty());
        assert!(decode_messages(&[0, 0, 0, 0]).unwrap().is_empty());
    }

    #[test]
    fn test_bytes_after_terminator_ignored() {
        let mut body = encode_messages(&[]).unwrap().to_vec();
        body.extend_from_slice(b"garbage");
        assert!(decode_messages(&body).unwrap().is_empty());
    }

    #[test]
    fn test_flag_bits_ignored() {
        let mut body = encode_messages(&[Message::StopNotice {
            session_id: SessionId(7),
        }])
        .unwrap()
        .to_vec();
        body[0] |= 0xC0;

        let decoded = decode_messages(&body).unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let body = [0, 0, 0, 1, 99, 0, 0, 0, 0];
        assert!(matches!(
            decode_messages(&body),
            Err(CodecError::UnknownTag(99))
        ));
    }

    #[test]
    fn test_truncated_message_rejected() {
        let encoded = encode_messages(&sample_messages()).unwrap();
        // Drop the terminator and the last byte of the final message.
        let cut = &encoded[..encoded.len() - 5];
        assert!(matches!(
            decode_messages(cut),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_trailing_payload_bytes_ignored() {
        // StopNotice with two extra bytes inside the declared length.
        let mut body = vec![0, 0, 0, 11, MessageTag::StopNotice as u8];
        body.extend_from_slice(&5u64.to_be_bytes());
        body.extend_from_slice(&[0xAB, 0xCD]);
        body.extend_from_slice(&[0, 0, 0, 0]);

        assert_eq!(
            decode_messages(&body).unwrap(),
            vec![Message::StopNotice {
                session_id: SessionId(5)
            }]
        );
    }

    #[test]
    fn test_invalid_severity_rejected() {
        let mut encoded = encode_messages(&[Message::SessionException {
            session_id: SessionId(1),
            message: String::new(),
            severity: Severity::Common,
            cause: None,
        }])
        .unwrap()
        .to_vec();
        // header(4) + tag(1) + session(8) + empty message length(2)
        encoded[15] = 7;

        assert!(matches!(
            decode_messages(&encoded),
            Err(CodecError::InvalidValue {
                field: "severity",
                ..
            })
        ));
    }

    #[test]
    fn test_overlong_string_rejected() {
        let message = Message::SessionException {
            session_id: SessionId(1),
            message: "x".repeat(70_000),
            severity: Severity::Common,
            cause: None,
        };
        assert!(matches!(
            encode_messages(&[message]),
            Err(CodecError::TooLong {
                field: "message",
                ..
            })
        ));
    }
}
