//! # Remote Node Relay
//!
//! Distributes audio sessions across a pool of remote playback nodes and
//! relays their encoded frames back to local consumers.
//!
//! ## Overview
//!
//! This module handles:
//! - Per-session handles with a bounded frame buffer ([`RemoteSession`])
//! - One poll loop per node carrying control and frame traffic over HTTP
//! - Load scoring to pick the least busy node for new sessions
//! - Health checks that move sessions off dead nodes and re-adopt them
//!   elsewhere without replaying audio

pub mod abandoned;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod frame_buffer;
pub mod marker;
pub mod node;
pub mod protocol;
pub mod session;

pub use abandoned::{AbandonedSessionManager, AdoptionLoad, SessionAdopter};
pub use config::RemoteConfig;
pub use coordinator::{NodeCoordinator, NodeCoordinatorBuilder, SessionLocation, SweepReport};
pub use error::{RemoteError, Result, SessionFailure, Severity};
pub use frame_buffer::{AudioFrame, BufferedFrame, FrameBuffer};
pub use marker::{MarkerHandler, MarkerState, TrackMarker};
pub use node::{NodeProcessor, NodeSnapshot, NodeState, PenaltyDetails};
pub use session::{
    AudioFormat, RemoteSession, SessionConfig, SessionId, SessionListener, SessionState,
    TrackDescriptor,
};

use core_runtime::events::{CoreEvent, EventBus};

/// Emit on the bus; having no subscribers is not an error.
pub(crate) fn publish(events: &EventBus, event: CoreEvent) {
    let _ = events.emit(event);
}
