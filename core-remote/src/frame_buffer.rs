//! # Frame Buffer
//!
//! Bounded queue of encoded audio frames between a node's poll loop
//! (producer) and the real-time consumer of one session.
//!
//! ## Design
//!
//! - **Capacity**: derived from a buffered duration and the frame duration
//! - **Backpressure**: the producer asks the node for at most
//!   [`remaining_capacity`](FrameBuffer::remaining_capacity) frames, so
//!   [`consume`](FrameBuffer::consume) failing with `Full` means a
//!   misbehaving node
//! - **Consumer**: [`provide`](FrameBuffer::provide) never blocks
//! - **Seeks**: [`set_clear_on_insert`](FrameBuffer::set_clear_on_insert)
//!   drops stale frames on the next producer write
//! - **Duplicates**: frames not newer than the last accepted timecode are
//!   discarded, so a session moved to another node never replays audio
//!
//! ## Usage
//!
//! ```rust
//! use bytes::Bytes;
//! use core_remote::frame_buffer::{AudioFrame, BufferedFrame, FrameBuffer};
//!
//! let buffer = FrameBuffer::new(2);
//! buffer.consume(AudioFrame::new(0, Bytes::from_static(b"a"))).unwrap();
//! buffer.set_terminate_on_empty();
//!
//! assert!(matches!(buffer.provide(), Some(BufferedFrame::Audio(_))));
//! assert!(matches!(buffer.provide(), Some(BufferedFrame::Terminator)));
//! assert!(buffer.provide().is_none());
//! ```

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// One encoded audio frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Position of the frame in the track, in milliseconds.
    pub timecode: i64,
    pub data: Bytes,
}

impl AudioFrame {
    pub fn new(timecode: i64, data: Bytes) -> Self {
        Self { timecode, data }
    }
}

/// What the consumer gets out of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferedFrame {
    Audio(AudioFrame),
    /// No more frames will follow.
    Terminator,
}

/// Result of a successful [`FrameBuffer::consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Accepted,
    /// Timecode was not newer than the last accepted frame.
    Duplicate,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameBufferError {
    #[error("Frame buffer is full ({capacity} frames)")]
    Full { capacity: usize },

    #[error("Frame buffer no longer accepts frames")]
    Terminated,
}

struct BufferState {
    frames: VecDeque<AudioFrame>,
    last_input_timecode: Option<i64>,
    terminator_sent: bool,
}

/// Single-producer single-consumer frame queue.
pub struct FrameBuffer {
    state: Mutex<BufferState>,
    available: Condvar,
    capacity: usize,
    clear_on_insert: AtomicBool,
    terminate_on_empty: AtomicBool,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BufferState {
                frames: VecDeque::with_capacity(capacity),
                last_input_timecode: None,
                terminator_sent: false,
            }),
            available: Condvar::new(),
            capacity,
            clear_on_insert: AtomicBool::new(false),
            terminate_on_empty: AtomicBool::new(false),
        }
    }

    /// Create a buffer holding `buffer_duration` worth of frames.
    pub fn for_duration(buffer_duration: Duration, frame_duration: Duration) -> Self {
        let frame_ms = frame_duration.as_millis().max(1);
        let frames = buffer_duration.as_millis().div_ceil(frame_ms);
        Self::new(usize::try_from(frames).unwrap_or(usize::MAX))
    }

    /// Append a frame from the producer side.
    pub fn consume(&self, frame: AudioFrame) -> Result<ConsumeOutcome, FrameBufferError> {
        if self.terminate_on_empty.load(Ordering::Acquire) {
            return Err(FrameBufferError::Terminated);
        }

        let mut state = self.state.lock();

        if self.clear_on_insert.swap(false, Ordering::AcqRel) {
            state.frames.clear();
            state.last_input_timecode = None;
        } else if matches!(state.last_input_timecode, Some(last) if frame.timecode <= last) {
            return Ok(ConsumeOutcome::Duplicate);
        }

        if state.frames.len() >= self.capacity {
            return Err(FrameBufferError::Full {
                capacity: self.capacity,
            });
        }

        state.last_input_timecode = Some(frame.timecode);
        state.frames.push_back(frame);
        drop(state);

        self.available.notify_one();
        Ok(ConsumeOutcome::Accepted)
    }

    /// Take the next frame without blocking.
    ///
    /// Once drained after [`set_terminate_on_empty`](Self::set_terminate_on_empty),
    /// yields [`BufferedFrame::Terminator`] exactly once.
    pub fn provide(&self) -> Option<BufferedFrame> {
        let mut state = self.state.lock();
        self.take_next(&mut state)
    }

    /// Like [`provide`](Self::provide), waiting up to `timeout` for a frame.
    pub fn provide_timeout(&self, timeout: Duration) -> Option<BufferedFrame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if let Some(frame) = self.take_next(&mut state) {
                return Some(frame);
            }
            if state.terminator_sent {
                return None;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return self.take_next(&mut state);
            }
        }
    }

    fn take_next(&self, state: &mut BufferState) -> Option<BufferedFrame> {
        if let Some(frame) = state.frames.pop_front() {
            return Some(BufferedFrame::Audio(frame));
        }

        if self.terminate_on_empty.load(Ordering::Acquire) && !state.terminator_sent {
            state.terminator_sent = true;
            return Some(BufferedFrame::Terminator);
        }

        None
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.state.lock().frames.len())
    }

    pub fn full_capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// No more frames will be accepted; the consumer gets a terminator after
    /// draining what is buffered.
    pub fn set_terminate_on_empty(&self) {
        self.terminate_on_empty.store(true, Ordering::Release);
        let _state = self.state.lock();
        self.available.notify_all();
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate_on_empty.load(Ordering::Acquire)
    }

    /// Discard buffered frames on the next producer write.
    pub fn set_clear_on_insert(&self) {
        self.clear_on_insert.store(true, Ordering::Release);
    }

    pub fn has_pending_clear(&self) -> bool {
        self.clear_on_insert.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.state.lock().frames.clear();
    }

    /// Timecode of the newest accepted frame.
    pub fn last_input_timecode(&self) -> Option<i64> {
        self.state.lock().last_input_timecode
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("terminating", &self.is_terminating())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn frame(timecode: i64) -> AudioFrame {
        AudioFrame::new(timecode, Bytes::from(vec![0u8; 4]))
    }

    #[test]
    fn test_capacity_from_duration() {
        let buffer =
            FrameBuffer::for_duration(Duration::from_millis(3000), Duration::from_millis(20));
        assert_eq!(buffer.full_capacity(), 150);

        let tiny = FrameBuffer::for_duration(Duration::from_millis(10), Duration::from_millis(20));
        assert_eq!(tiny.full_capacity(), 1);
    }

    #[test]
    fn test_backpressure_when_full() {
        let buffer = FrameBuffer::new(2);
        buffer.consume(frame(0)).unwrap();
        buffer.consume(frame(20)).unwrap();

        assert_eq!(buffer.remaining_capacity(), 0);
        assert_eq!(
            buffer.consume(frame(40)),
            Err(FrameBufferError::Full { capacity: 2 })
        );

        buffer.provide();
        assert_eq!(buffer.remaining_capacity(), 1);
    }

    #[test]
    fn test_provide_is_fifo_and_non_blocking() {
        let buffer = FrameBuffer::new(4);
        assert!(buffer.provide().is_none());

        buffer.consume(frame(0)).unwrap();
        buffer.consume(frame(20)).unwrap();

        assert_eq!(buffer.provide(), Some(BufferedFrame::Audio(frame(0))));
        assert_eq!(buffer.provide(), Some(BufferedFrame::Audio(frame(20))));
        assert!(buffer.provide().is_none());
    }

    #[test]
    fn test_terminator_after_drain() {
        let buffer = FrameBuffer::new(4);
        buffer.consume(frame(0)).unwrap();
        buffer.set_terminate_on_empty();

        assert_eq!(buffer.consume(frame(20)), Err(FrameBufferError::Terminated));
        assert!(matches!(buffer.provide(), Some(BufferedFrame::Audio(_))));
        assert_eq!(buffer.provide(), Some(BufferedFrame::Terminator));
        assert!(buffer.provide().is_none());
    }

    #[test]
    fn test_duplicate_timecodes_discarded() {
        let buffer = FrameBuffer::new(4);
        assert_eq!(buffer.consume(frame(40)), Ok(ConsumeOutcome::Accepted));
        assert_eq!(buffer.consume(frame(40)), Ok(ConsumeOutcome::Duplicate));
        assert_eq!(buffer.consume(frame(20)), Ok(ConsumeOutcome::Duplicate));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.last_input_timecode(), Some(40));
    }

    #[test]
    fn test_clear_on_insert_accepts_older_timecodes() {
        let buffer = FrameBuffer::new(4);
        buffer.consume(frame(1000)).unwrap();
        buffer.consume(frame(1020)).unwrap();

        buffer.set_clear_on_insert();
        assert!(buffer.has_pending_clear());
        assert_eq!(buffer.consume(frame(200)), Ok(ConsumeOutcome::Accepted));

        assert!(!buffer.has_pending_clear());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.provide(), Some(BufferedFrame::Audio(frame(200))));
    }

    #[test]
    fn test_clear_keeps_last_timecode() {
        let buffer = FrameBuffer::new(4);
        buffer.consume(frame(0)).unwrap();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.last_input_timecode(), Some(0));
    }

    #[test]
    fn test_provide_timeout_wakes_on_frame() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let producer = Arc::clone(&buffer);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.consume(frame(0)).unwrap();
        });

        let received = buffer.provide_timeout(Duration::from_secs(5));
        assert_eq!(received, Some(BufferedFrame::Audio(frame(0))));
        handle.join().unwrap();
    }

    #[test]
    fn test_provide_timeout_expires() {
        let buffer = FrameBuffer::new(4);
        let started = Instant::now();
        assert!(buffer.provide_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
