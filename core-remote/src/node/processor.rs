//! # Node Processor
//!
//! Drives one remote node: its poll loop, outgoing control queue, session
//! table, load statistics and reconnect backoff.
//!
//! ## Poll loop
//!
//! ```text
//!            success                 failure / bad status
//! Pending ───────────▶ Online ───────────────────────────▶ Offline
//!    ▲                                                        │
//!    └────────────── backoff sleep (1s / 3s / 10s) ◀──────────┘
//!
//! any state ── remove() ──▶ Removed (terminal)
//! ```
//!
//! Each tick sends queued control messages plus one `FrameRequest` per
//! assigned session, then applies the messages in the response. Control
//! messages of a request that never reached the node are queued again. At
//! most one poll loop runs per node; starting a second one is a no-op.

use arc_swap::ArcSwapOption;
use bridge_traits::http::{HttpClient, HttpRequest};
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventBus, NodeEvent, SessionEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::history::{TickHistory, TickRecord, TickStatus};
use super::penalty::{self, PenaltyDetails, MAX_PENALTY};
use crate::abandoned::{AbandonedSessionManager, AdoptionLoad, SessionAdopter};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result, SessionFailure};
use crate::protocol::{
    decode_messages, encode_messages, Message, NodeStatistics, PROTOCOL_HEADER, PROTOCOL_VERSION,
};
use crate::publish;
use crate::session::{RemoteSession, SessionId, SessionOwner};

// ============================================================================
// Shared Resources
// ============================================================================

/// Everything a node processor needs from its surroundings, built once by
/// the coordinator and shared by every processor.
pub struct NodeResources {
    pub http: Arc<dyn HttpClient>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<RemoteConfig>,
    pub abandoned: Arc<AbandonedSessionManager>,
    pub events: EventBus,
}

impl fmt::Debug for NodeResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeResources")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish()
    }
}

// ============================================================================
// State & Snapshots
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum NodeState {
    /// Connecting; no successful tick since the last failure.
    Pending = 0,
    Online = 1,
    Offline = 2,
    /// Deconfigured; the processor never runs again.
    Removed = 3,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeState::Pending,
            1 => NodeState::Online,
            2 => NodeState::Offline,
            _ => NodeState::Removed,
        }
    }
}

/// Point-in-time view of a node for dashboards and tests.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub address: String,
    pub state: NodeState,
    pub penalty: u32,
    pub details: Option<PenaltyDetails>,
    pub statistics: Option<NodeStatistics>,
    pub session_count: usize,
    pub latency: Duration,
    pub failed_attempts: u32,
    pub last_alive: Option<DateTime<Utc>>,
}

enum TickOutcome {
    Applied,
    /// The node left the polling states while the request was in flight.
    Discarded,
}

/// Why the poller stopped ticking.
enum PollerExit {
    /// Cancelled or removed; no reconnect.
    Stopped,
    Failed(Option<RemoteError>),
}

struct LoopGuard<'a>(&'a AtomicBool);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// NodeProcessor
// ============================================================================

pub struct NodeProcessor {
    address: String,
    resources: Arc<NodeResources>,
    self_ref: Weak<NodeProcessor>,
    state: AtomicU8,
    outgoing: Mutex<VecDeque<Message>>,
    sessions: Mutex<HashMap<SessionId, Arc<RemoteSession>>>,
    statistics: ArcSwapOption<NodeStatistics>,
    latency_nanos: AtomicU64,
    history: Mutex<TickHistory>,
    health_lock: Mutex<()>,
    last_alive_ms: AtomicI64,
    failed_attempts: AtomicU32,
    loop_active: AtomicBool,
    cancel: CancellationToken,
}

impl NodeProcessor {
    pub fn new(
        address: impl Into<String>,
        resources: Arc<NodeResources>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let history = TickHistory::new(resources.config.tick.history_size);
        let created_ms = resources.clock.unix_timestamp_millis();

        Arc::new_cyclic(|self_ref| Self {
            address: address.into(),
            resources,
            self_ref: self_ref.clone(),
            state: AtomicU8::new(NodeState::Pending as u8),
            outgoing: Mutex::new(VecDeque::new()),
            sessions: Mutex::new(HashMap::new()),
            statistics: ArcSwapOption::empty(),
            latency_nanos: AtomicU64::new(0),
            history: Mutex::new(history),
            health_lock: Mutex::new(()),
            last_alive_ms: AtomicI64::new(created_ms),
            failed_attempts: AtomicU32::new(0),
            loop_active: AtomicBool::new(false),
            cancel,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn statistics(&self) -> Option<NodeStatistics> {
        self.statistics.load_full().map(|stats| *stats)
    }

    /// Smoothed tick latency.
    pub fn latency(&self) -> Duration {
        Duration::from_nanos(self.latency_nanos.load(Ordering::Relaxed))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn contains_session(&self, id: SessionId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    pub fn tick_history(&self) -> Vec<TickRecord> {
        self.history.lock().snapshot()
    }

    /// Penalty breakdown; `None` unless the node is online with statistics.
    pub fn penalty_details(&self) -> Option<PenaltyDetails> {
        if self.state() != NodeState::Online {
            return None;
        }
        let stats = self.statistics.load_full()?;
        Some(PenaltyDetails::compute(
            &stats,
            self.latency(),
            &self.config().penalty,
        ))
    }

    /// Load score; [`MAX_PENALTY`] means "do not place work here".
    pub fn penalty(&self) -> u32 {
        self.penalty_details()
            .map_or(MAX_PENALTY, |details| details.total())
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let details = self.penalty_details();
        let last_alive_ms = self.last_alive_ms.load(Ordering::Acquire);
        NodeSnapshot {
            address: self.address.clone(),
            state: self.state(),
            penalty: details.map_or(MAX_PENALTY, |d| d.total()),
            details,
            statistics: self.statistics(),
            session_count: self.session_count(),
            latency: self.latency(),
            failed_attempts: self.failed_attempts.load(Ordering::Acquire),
            last_alive: DateTime::<Utc>::from_timestamp_millis(last_alive_ms),
        }
    }

    fn config(&self) -> &RemoteConfig {
        &self.resources.config
    }

    fn clock(&self) -> &dyn Clock {
        self.resources.clock.as_ref()
    }

    fn tick_url(&self) -> String {
        let path = &self.config().tick.path;
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            format!("{}{}", self.address.trim_end_matches('/'), path)
        } else {
            format!("http://{}{}", self.address, path)
        }
    }

    /// Atomically move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[NodeState], to: NodeState) -> Option<NodeState> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                from.contains(&NodeState::from_u8(raw))
                    .then_some(to as u8)
            })
            .ok()
            .map(NodeState::from_u8)
    }

    #[cfg(test)]
    pub(crate) fn force_state_for_test(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Session assignment
    // ------------------------------------------------------------------------

    /// Take ownership of `session` and ask the node to start it.
    ///
    /// A session that already received frames resumes right after the newest
    /// one, keeping its buffered audio.
    pub fn assign(&self, session: Arc<RemoteSession>) {
        let owner: Weak<dyn SessionOwner> = self.self_ref.clone();
        session.attach_owner(owner);

        let id = session.id();
        let resume_position = session.resume_position();
        debug!(node = %self.address, session = %id, resume_position, "Assigning session");

        // Queue the start before the table entry so a frame request never
        // precedes it on the wire.
        self.outgoing.lock().push_back(Message::StartRequest {
            session_id: id,
            track: session.track().clone(),
            encoded_track: session.encoded_track().clone(),
            volume: session.volume(),
            config: session.config().clone(),
            resume_position,
        });
        self.sessions.lock().insert(id, Arc::clone(&session));

        // Stopped while being assigned.
        if session.is_finished() {
            self.sessions.lock().remove(&id);
        }
    }

    fn session(&self, id: SessionId) -> Option<Arc<RemoteSession>> {
        self.sessions.lock().get(&id).cloned()
    }

    fn take_session(&self, id: SessionId) -> Option<Arc<RemoteSession>> {
        self.sessions.lock().remove(&id)
    }

    // ------------------------------------------------------------------------
    // Poll loop
    // ------------------------------------------------------------------------

    /// Spawn the long-lived task that polls the node and reconnects with
    /// backoff until the processor is removed or cancelled.
    ///
    /// The returned task finishes immediately if a loop is already running.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.supervise().await })
    }

    async fn supervise(self: Arc<Self>) {
        if self.loop_active.swap(true, Ordering::AcqRel) {
            warn!(node = %self.address, "Poll loop already running, not starting another");
            return;
        }
        let _active = LoopGuard(&self.loop_active);

        loop {
            if self.is_stopped() {
                break;
            }

            let failure = match self.run_poller().await {
                PollerExit::Stopped => break,
                PollerExit::Failed(failure) => failure,
            };

            if self.is_stopped() {
                break;
            }

            let attempts = self.failed_attempts.fetch_add(1, Ordering::AcqRel) + 1;
            self.mark_offline(attempts, failure.as_ref());
            self.check_health(false);

            let delay = self.config().backoff.delay_for(attempts);
            debug!(node = %self.address, attempts, ?delay, "Scheduling reconnect");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(node = %self.address, "Poll loop stopped");
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.state() == NodeState::Removed
    }

    /// Tick until the first failure.
    #[instrument(skip(self), fields(node = %self.address))]
    async fn run_poller(&self) -> PollerExit {
        self.transition(&[NodeState::Offline], NodeState::Pending);

        loop {
            if self.is_stopped() {
                return PollerExit::Stopped;
            }

            let started = Instant::now();
            match self.tick().await {
                Ok(TickOutcome::Applied) => {}
                Ok(TickOutcome::Discarded) if self.is_stopped() => return PollerExit::Stopped,
                Ok(TickOutcome::Discarded) => {
                    debug!("Discarded tick response, node was marked offline");
                    return PollerExit::Failed(None);
                }
                Err(e) => return PollerExit::Failed(Some(e)),
            }

            let pause = self.config().tick.sleep_after(started.elapsed());
            tokio::select! {
                _ = self.cancel.cancelled() => return PollerExit::Stopped,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn tick(&self) -> Result<TickOutcome> {
        let outbound = self.build_outbound();
        let body = encode_messages(&outbound)?;
        let request_size = body.len();

        let request = HttpRequest::post(self.tick_url())
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION.to_string())
            .header("Content-Type", "application/octet-stream")
            .timeout(self.config().tick.request_timeout)
            .body(body);

        let started_at = self.clock().now();
        let started = Instant::now();
        let result = self.resources.http.execute(request).await;
        let elapsed = started.elapsed();
        let finished_at = self.clock().now();

        let record = |status: TickStatus, response_size: usize| TickRecord {
            started_at,
            finished_at,
            status,
            request_size,
            response_size,
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.history
                    .lock()
                    .push(record(TickStatus::TransportError, 0));
                self.requeue_control(outbound);
                return Err(e.into());
            }
        };

        if !response.is_success() {
            self.history
                .lock()
                .push(record(TickStatus::HttpError(response.status), response.body.len()));
            self.requeue_control(outbound);
            return Err(RemoteError::NodeUnavailable {
                address: self.address.clone(),
                status: response.status,
            });
        }

        let messages = decode_messages(&response.body)?;

        match self.transition(&[NodeState::Pending], NodeState::Online) {
            Some(_) => {
                info!(node = %self.address, "Node came online");
                publish(
                    &self.resources.events,
                    CoreEvent::Node(NodeEvent::CameOnline {
                        address: self.address.clone(),
                    }),
                );
            }
            None if self.state() == NodeState::Online => {}
            None => {
                self.history
                    .lock()
                    .push(record(TickStatus::Discarded, response.body.len()));
                return Ok(TickOutcome::Discarded);
            }
        }

        self.last_alive_ms
            .store(finished_at.timestamp_millis(), Ordering::Release);
        self.failed_attempts.store(0, Ordering::Release);

        for message in messages {
            self.handle_message(message);
        }

        self.record_latency(elapsed);
        self.history
            .lock()
            .push(record(TickStatus::Success(response.status), response.body.len()));

        Ok(TickOutcome::Applied)
    }

    /// Drain queued control messages and add one frame request per session.
    pub(crate) fn build_outbound(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.outgoing.lock().drain(..).collect();
        let sessions: Vec<Arc<RemoteSession>> = self.sessions.lock().values().cloned().collect();

        for session in sessions {
            if session.is_finished() {
                continue;
            }
            messages.push(Message::FrameRequest {
                session_id: session.id(),
                requested_frames: u32::try_from(session.frames_to_request()).unwrap_or(u32::MAX),
                volume: session.volume(),
                pending_seek: session.pending_seek(),
            });
        }

        messages
    }

    /// Put the control messages of an undelivered request back at the front
    /// of the queue, in their original order.
    ///
    /// Start requests are dropped for sessions no longer assigned here or
    /// already queued again by a later assignment. Stop notices always go.
    fn requeue_control(&self, sent: Vec<Message>) {
        let _guard = self.health_lock.lock();
        let assigned: HashSet<SessionId> = self.sessions.lock().keys().copied().collect();

        let mut outgoing = self.outgoing.lock();
        let queued_starts: HashSet<SessionId> = outgoing
            .iter()
            .filter_map(|message| match message {
                Message::StartRequest { session_id, .. } => Some(*session_id),
                _ => None,
            })
            .collect();

        let retry: Vec<Message> = sent
            .into_iter()
            .filter(|message| match message {
                Message::StartRequest { session_id, .. } => {
                    assigned.contains(session_id) && !queued_starts.contains(session_id)
                }
                Message::StopNotice { .. } => true,
                _ => false,
            })
            .collect();

        if retry.is_empty() {
            return;
        }
        debug!(node = %self.address, messages = retry.len(), "Requeueing undelivered control messages");
        for message in retry.into_iter().rev() {
            outgoing.push_front(message);
        }
    }

    fn record_latency(&self, sample: Duration) {
        let smoothed = penalty::smooth_latency(self.latency(), sample, &self.config().penalty);
        let nanos = u64::try_from(smoothed.as_nanos()).unwrap_or(u64::MAX);
        self.latency_nanos.store(nanos, Ordering::Relaxed);
    }

    fn mark_offline(&self, attempts: u32, failure: Option<&RemoteError>) {
        let Some(previous) = self.transition(&[NodeState::Pending, NodeState::Online], NodeState::Offline)
        else {
            return;
        };

        let reason = failure.map(|e| e.to_string()).unwrap_or_default();
        if previous == NodeState::Online {
            warn!(node = %self.address, error = %reason, "Node went offline");
            publish(
                &self.resources.events,
                CoreEvent::Node(NodeEvent::WentOffline {
                    address: self.address.clone(),
                    failed_attempts: attempts,
                }),
            );
        } else {
            debug!(node = %self.address, attempts, error = %reason, "Connection attempt failed");
        }
    }

    // ------------------------------------------------------------------------
    // Response handling
    // ------------------------------------------------------------------------

    pub(crate) fn handle_message(&self, message: Message) {
        match message {
            Message::StartResponse {
                session_id,
                success,
                failure_reason,
            } => {
                if success {
                    return;
                }
                let Some(session) = self.take_session(session_id) else {
                    debug!(node = %self.address, session = %session_id, "Start failure for unknown session");
                    return;
                };
                session.detach_owner();

                let reason = failure_reason.unwrap_or_else(|| "no reason given".to_string());
                warn!(node = %self.address, session = %session_id, %reason, "Node failed to start session");
                let failure = SessionFailure::suspicious("Remote node failed to start track")
                    .with_cause(reason);
                publish(
                    &self.resources.events,
                    CoreEvent::Session(SessionEvent::Failed {
                        session_id: session_id.0,
                        message: failure.message.clone(),
                        severity: failure.severity.to_string(),
                    }),
                );
                session.fail(failure);
            }
            Message::FrameData {
                session_id,
                frames,
                seeked_position,
                finished,
            } => {
                let Some(session) = self.session(session_id) else {
                    debug!(node = %self.address, session = %session_id, "Frames for unknown session");
                    return;
                };

                match (session.pending_seek(), seeked_position) {
                    (Some(pending), Some(acked)) if pending == acked => {
                        session.acknowledge_seek(acked);
                        session.receive_frames(frames);
                    }
                    (Some(pending), _) => {
                        // Produced before the node saw the latest seek.
                        debug!(session = %session_id, pending, ?seeked_position, dropped = frames.len(), "Discarding pre-seek frames");
                        if finished {
                            session.buffer().clear();
                        }
                    }
                    (None, _) => session.receive_frames(frames),
                }

                if finished {
                    self.finish_session(session_id);
                }
            }
            Message::StopNotice { session_id } => {
                self.finish_session(session_id);
            }
            Message::SessionException {
                session_id,
                message,
                severity,
                cause,
            } => {
                let Some(session) = self.session(session_id) else {
                    debug!(node = %self.address, session = %session_id, "Exception for unknown session");
                    return;
                };
                let mut failure = SessionFailure::new(message, severity);
                failure.cause = cause;
                session.report_failure(failure);
            }
            Message::NodeStatistics(stats) => {
                self.statistics.store(Some(Arc::new(stats)));
            }
            Message::StartRequest { session_id, .. } | Message::FrameRequest { session_id, .. } => {
                debug!(node = %self.address, session = %session_id, "Ignoring request-only message from node");
            }
        }
    }

    fn finish_session(&self, id: SessionId) {
        let Some(session) = self.take_session(id) else {
            return;
        };
        debug!(node = %self.address, session = %id, "Node finished session");
        session.finish_input();
        publish(
            &self.resources.events,
            CoreEvent::Session(SessionEvent::Finished { session_id: id.0 }),
        );
    }

    // ------------------------------------------------------------------------
    // Health & lifecycle
    // ------------------------------------------------------------------------

    /// Move every session to the abandoned queue if the node has been silent
    /// past the kill threshold (or unconditionally with `force`).
    ///
    /// Returns the number of sessions abandoned. Idempotent: a node without
    /// sessions is left untouched.
    pub fn check_health(&self, force: bool) -> usize {
        let _guard = self.health_lock.lock();

        if self.sessions.lock().is_empty() {
            return 0;
        }

        if !force {
            let silent_ms = self.clock().unix_timestamp_millis()
                - self.last_alive_ms.load(Ordering::Acquire);
            let threshold_ms =
                i64::try_from(self.config().health.kill_threshold.as_millis()).unwrap_or(i64::MAX);
            if silent_ms < threshold_ms {
                return 0;
            }
        }

        self.transition(&[NodeState::Pending, NodeState::Online], NodeState::Offline);

        let evicted: Vec<Arc<RemoteSession>> =
            self.sessions.lock().drain().map(|(_, session)| session).collect();
        let evicted_ids: HashSet<SessionId> = evicted.iter().map(|s| s.id()).collect();
        self.outgoing
            .lock()
            .retain(|message| !message.session_id().is_some_and(|id| evicted_ids.contains(&id)));

        let mut abandoned = 0;
        for session in evicted {
            session.detach_owner();
            if session.is_finished() {
                continue;
            }

            publish(
                &self.resources.events,
                CoreEvent::Session(SessionEvent::Abandoned {
                    session_id: session.id().0,
                    node: self.address.clone(),
                }),
            );
            if self.resources.abandoned.add(session) {
                abandoned += 1;
            }
        }

        warn!(node = %self.address, abandoned, force, "Evicted sessions from node");
        abandoned
    }

    /// Deconfigure the node: stop polling and abandon its sessions.
    pub fn remove(&self) {
        let previous = NodeState::from_u8(
            self.state
                .swap(NodeState::Removed as u8, Ordering::AcqRel),
        );
        if previous == NodeState::Removed {
            return;
        }

        self.cancel.cancel();
        info!(node = %self.address, "Node removed from pool");
        publish(
            &self.resources.events,
            CoreEvent::Node(NodeEvent::Removed {
                address: self.address.clone(),
            }),
        );
        self.check_health(true);
    }

    /// Stop polling and stop every assigned session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let sessions: Vec<Arc<RemoteSession>> =
            self.sessions.lock().drain().map(|(_, session)| session).collect();
        for session in sessions {
            session.detach_owner();
            session.stop();
        }
        self.outgoing.lock().clear();
    }
}

impl SessionOwner for NodeProcessor {
    fn stop_requested(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
        self.outgoing
            .lock()
            .push_back(Message::StopNotice { session_id: id });
    }
}

impl SessionAdopter for NodeProcessor {
    fn address(&self) -> &str {
        &self.address
    }

    fn adoption_load(&self) -> Option<AdoptionLoad> {
        let details = self.penalty_details()?;
        let stats = self.statistics()?;
        Some(AdoptionLoad {
            penalty: details.total(),
            playing_tracks: stats.playing_tracks,
        })
    }

    fn adopt(&self, session: Arc<RemoteSession>) {
        self.assign(session);
    }
}

impl fmt::Debug for NodeProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeProcessor")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("sessions", &self.session_count())
            .finish()
    }
}
