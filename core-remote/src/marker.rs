//! # Position Markers
//!
//! A session may carry one marker: a timecode plus a handler told what
//! happened to it.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Why a marker handler was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerState {
    /// Playback passed the marker timecode.
    Reached,
    /// A seek or the initial position skipped over the marker.
    Bypassed,
    /// Another marker replaced this one.
    Overwritten,
    /// The marker was cleared.
    Removed,
    /// The session was stopped before reaching the marker.
    Stopped,
    /// The track ended before reaching the marker.
    Ended,
}

pub trait MarkerHandler: Send + Sync {
    fn handle(&self, state: MarkerState);
}

impl<F> MarkerHandler for F
where
    F: Fn(MarkerState) + Send + Sync,
{
    fn handle(&self, state: MarkerState) {
        self(state)
    }
}

#[derive(Clone)]
pub struct TrackMarker {
    pub timecode: i64,
    handler: Arc<dyn MarkerHandler>,
}

impl TrackMarker {
    pub fn new(timecode: i64, handler: Arc<dyn MarkerHandler>) -> Self {
        Self { timecode, handler }
    }

    fn fire(&self, state: MarkerState) {
        self.handler.handle(state);
    }
}

impl fmt::Debug for TrackMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackMarker")
            .field("timecode", &self.timecode)
            .finish()
    }
}

/// Holds the current marker; every handler fires at most once.
#[derive(Debug, Default)]
pub struct MarkerTracker {
    current: Mutex<Option<TrackMarker>>,
}

impl MarkerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the marker. `position` is the current playback position; a
    /// new marker already behind it is bypassed immediately.
    pub fn set(&self, marker: Option<TrackMarker>, position: i64) {
        let previous = {
            let mut current = self.current.lock();
            std::mem::replace(&mut *current, marker.clone())
        };

        if let Some(previous) = previous {
            let state = if marker.is_some() {
                MarkerState::Overwritten
            } else {
                MarkerState::Removed
            };
            previous.fire(state);
        }

        if let Some(marker) = marker {
            if position >= marker.timecode {
                self.trigger_if(MarkerState::Bypassed, |m| m.timecode == marker.timecode);
            }
        }
    }

    pub fn get(&self) -> Option<TrackMarker> {
        self.current.lock().clone()
    }

    /// Playback produced a frame at `timecode`.
    pub fn check_playback_timecode(&self, timecode: i64) {
        self.trigger_if(MarkerState::Reached, |m| timecode >= m.timecode);
    }

    /// A seek moved the position to `timecode`.
    pub fn check_seek_timecode(&self, timecode: i64) {
        self.trigger_if(MarkerState::Bypassed, |m| timecode >= m.timecode);
    }

    /// Fire the current marker with `state` regardless of its timecode.
    pub fn trigger(&self, state: MarkerState) {
        self.trigger_if(state, |_| true);
    }

    fn trigger_if(&self, state: MarkerState, predicate: impl Fn(&TrackMarker) -> bool) {
        let taken = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(marker) if predicate(marker) => current.take(),
                _ => None,
            }
        };

        // Handlers run outside the lock so they may set a new marker.
        if let Some(marker) = taken {
            marker.fire(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_marker(timecode: i64) -> (TrackMarker, Arc<Mutex<Vec<MarkerState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let marker = TrackMarker::new(
            timecode,
            Arc::new(move |state: MarkerState| sink.lock().push(state)),
        );
        (marker, seen)
    }

    #[test]
    fn test_marker_reached_once() {
        let tracker = MarkerTracker::new();
        let (marker, seen) = recording_marker(1000);
        tracker.set(Some(marker), 0);

        tracker.check_playback_timecode(980);
        tracker.check_playback_timecode(1000);
        tracker.check_playback_timecode(1020);

        assert_eq!(*seen.lock(), vec![MarkerState::Reached]);
        assert!(tracker.get().is_none());
    }

    #[test]
    fn test_marker_bypassed_by_seek() {
        let tracker = MarkerTracker::new();
        let (marker, seen) = recording_marker(1000);
        tracker.set(Some(marker), 0);

        tracker.check_seek_timecode(500);
        assert!(seen.lock().is_empty());

        tracker.check_seek_timecode(5000);
        assert_eq!(*seen.lock(), vec![MarkerState::Bypassed]);
    }

    #[test]
    fn test_marker_behind_position_bypassed_immediately() {
        let tracker = MarkerTracker::new();
        let (marker, seen) = recording_marker(1000);
        tracker.set(Some(marker), 2000);
        assert_eq!(*seen.lock(), vec![MarkerState::Bypassed]);
    }

    #[test]
    fn test_marker_overwritten_and_removed() {
        let tracker = MarkerTracker::new();
        let (first, first_seen) = recording_marker(1000);
        let (second, second_seen) = recording_marker(2000);

        tracker.set(Some(first), 0);
        tracker.set(Some(second), 0);
        tracker.set(None, 0);

        assert_eq!(*first_seen.lock(), vec![MarkerState::Overwritten]);
        assert_eq!(*second_seen.lock(), vec![MarkerState::Removed]);
    }

    #[test]
    fn test_trigger_stopped() {
        let tracker = MarkerTracker::new();
        let (marker, seen) = recording_marker(1000);
        tracker.set(Some(marker), 0);

        tracker.trigger(MarkerState::Stopped);
        tracker.trigger(MarkerState::Ended);

        assert_eq!(*seen.lock(), vec![MarkerState::Stopped]);
    }
}
