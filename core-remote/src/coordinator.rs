//! # Node Coordinator
//!
//! Owns the node pool and is the entry point for starting and controlling
//! remote sessions.
//!
//! ## Overview
//!
//! - New sessions go to the online node with the lowest penalty
//! - Each node is polled by its own [`NodeProcessor`] task
//! - A low-frequency sweep task runs health checks on every node and moves
//!   abandoned sessions to healthy nodes
//!
//! ## Usage
//!
//! ```ignore
//! use core_remote::{NodeCoordinator, SessionConfig, TrackDescriptor};
//!
//! let coordinator = NodeCoordinator::builder()
//!     .nodes(["10.0.0.4:8080", "10.0.0.5:8080"])
//!     .build()?;
//! coordinator.start();
//!
//! let session = coordinator.start_session(
//!     TrackDescriptor::new("track-42"),
//!     encoded_track,
//!     SessionConfig::default(),
//!     listener,
//! )?;
//!
//! while let Some(frame) = coordinator.pull_frame(&session) {
//!     // hand frame to the audio sink
//! }
//! ```

use bridge_traits::http::HttpClient;
use bridge_traits::time::{Clock, SystemClock};
use bytes::Bytes;
use core_runtime::events::{CoreEvent, EventBus, SessionEvent};
use core_runtime::logging::redact_url;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::abandoned::AbandonedSessionManager;
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::frame_buffer::BufferedFrame;
use crate::node::{NodeProcessor, NodeResources, NodeSnapshot, TickRecord, MAX_PENALTY};
use crate::publish;
use crate::session::{RemoteSession, SessionConfig, SessionId, SessionListener, TrackDescriptor};

/// Where a session currently lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "node", rename_all = "snake_case")]
pub enum SessionLocation {
    /// Assigned to the node with this address.
    Node(String),
    /// Waiting in the abandoned queue.
    Abandoned,
    /// Finished, or not known to the coordinator.
    Unassigned,
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evicted: usize,
    pub adopted: usize,
    pub expired: usize,
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Default)]
pub struct NodeCoordinatorBuilder {
    nodes: Vec<String>,
    http: Option<Arc<dyn HttpClient>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<EventBus>,
    config: RemoteConfig,
}

impl NodeCoordinatorBuilder {
    pub fn node(mut self, address: impl Into<String>) -> Self {
        self.nodes.push(address.into());
        self
    }

    pub fn nodes<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: RemoteConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and create the coordinator. Nothing runs
    /// until [`NodeCoordinator::start`].
    pub fn build(self) -> Result<Arc<NodeCoordinator>> {
        self.config.validate()?;

        let http = match self.http {
            Some(http) => http,
            None => default_http_client(&self.config)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_default();
        let config = Arc::new(self.config);

        let abandoned = Arc::new(AbandonedSessionManager::new(
            config.abandonment.clone(),
            Arc::clone(&clock),
            events.clone(),
        ));
        let resources = Arc::new(NodeResources {
            http,
            clock,
            config,
            abandoned,
            events,
        });

        let coordinator = Arc::new(NodeCoordinator {
            nodes: RwLock::new(Vec::new()),
            resources,
            next_session_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        });
        coordinator.set_nodes(self.nodes);

        Ok(coordinator)
    }
}

#[cfg(feature = "desktop-shims")]
fn default_http_client(config: &RemoteConfig) -> Result<Arc<dyn HttpClient>> {
    let client = bridge_desktop::ReqwestHttpClient::with_timeouts(
        config.tick.request_timeout,
        config.tick.connect_timeout,
    )?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn default_http_client(_config: &RemoteConfig) -> Result<Arc<dyn HttpClient>> {
    Err(RemoteError::InvalidConfig(
        "no HTTP client supplied and the desktop-shims feature is disabled".to_string(),
    ))
}

// ============================================================================
// NodeCoordinator
// ============================================================================

pub struct NodeCoordinator {
    nodes: RwLock<Vec<Arc<NodeProcessor>>>,
    resources: Arc<NodeResources>,
    next_session_id: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl NodeCoordinator {
    pub fn builder() -> NodeCoordinatorBuilder {
        NodeCoordinatorBuilder::default()
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.resources.config
    }

    pub fn events(&self) -> &EventBus {
        &self.resources.events
    }

    /// Spawn every node's poll loop and the sweep task. Must be called from
    /// within a tokio runtime; later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let nodes = self.nodes.read().clone();
        let mut tasks = self.tasks.lock();
        for node in &nodes {
            tasks.push(node.start());
        }
        tasks.push(self.spawn_sweeper());

        info!(nodes = nodes.len(), "Node coordinator started");
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.config().health.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.sweep_once();
            }
            debug!("Sweep task stopped");
        })
    }

    /// Run one health/adoption/expiry pass over the pool.
    pub fn sweep_once(&self) -> SweepReport {
        let nodes = self.nodes.read().clone();
        let abandoned = &self.resources.abandoned;

        let report = SweepReport {
            evicted: nodes.iter().map(|node| node.check_health(false)).sum(),
            adopted: abandoned.distribute(&nodes),
            expired: abandoned.drain_expired(),
        };

        if report != SweepReport::default() {
            debug!(?report, waiting = abandoned.len(), "Sweep finished");
        }
        report
    }

    // ------------------------------------------------------------------------
    // Node pool
    // ------------------------------------------------------------------------

    /// Replace the node pool. New addresses get a processor (started if the
    /// coordinator is running); dropped ones are removed and their sessions
    /// abandoned.
    #[instrument(skip_all)]
    pub fn set_nodes<I, S>(&self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut wanted: Vec<String> = Vec::new();
        for address in addresses.into_iter().map(Into::into) {
            if !wanted.contains(&address) {
                wanted.push(address);
            }
        }

        let (removed, added) = {
            let mut nodes = self.nodes.write();
            let (kept, removed): (Vec<_>, Vec<_>) = nodes
                .drain(..)
                .partition(|node| wanted.iter().any(|a| a == node.address()));
            *nodes = kept;

            let mut added = Vec::new();
            for address in wanted {
                if nodes.iter().any(|node| node.address() == address) {
                    continue;
                }
                let node = NodeProcessor::new(
                    address,
                    Arc::clone(&self.resources),
                    self.cancel.child_token(),
                );
                nodes.push(Arc::clone(&node));
                added.push(node);
            }
            (removed, added)
        };

        for node in &removed {
            node.remove();
        }

        if !added.is_empty() || !removed.is_empty() {
            info!(added = added.len(), removed = removed.len(), "Node pool updated");
        }

        if self.started.load(Ordering::Acquire) {
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| !task.is_finished());
            for node in &added {
                tasks.push(node.start());
            }
        }
    }

    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.nodes.read().iter().map(|node| node.snapshot()).collect()
    }

    pub fn tick_history(&self, address: &str) -> Option<Vec<TickRecord>> {
        self.find_node(address).map(|node| node.tick_history())
    }

    fn find_node(&self, address: &str) -> Option<Arc<NodeProcessor>> {
        self.nodes
            .read()
            .iter()
            .find(|node| node.address() == address)
            .cloned()
    }

    /// Online node with the lowest penalty; ties go to the earlier node.
    fn select_node(&self) -> Option<Arc<NodeProcessor>> {
        self.nodes
            .read()
            .iter()
            .map(|node| (node.penalty(), node))
            .filter(|(penalty, _)| *penalty < MAX_PENALTY)
            .min_by_key(|(penalty, _)| *penalty)
            .map(|(_, node)| Arc::clone(node))
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Start a session on the least loaded node.
    ///
    /// # Errors
    ///
    /// - [`RemoteError::InvalidConfig`] for an unusable session config
    /// - [`RemoteError::NoNodesAvailable`] when no node is online
    #[instrument(skip(self, track, encoded_track, config, listener), fields(track = %track.identifier))]
    pub fn start_session(
        &self,
        track: TrackDescriptor,
        encoded_track: Bytes,
        config: SessionConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Arc<RemoteSession>> {
        config.validate().map_err(RemoteError::InvalidConfig)?;

        let Some(node) = self.select_node() else {
            warn!("No node available for new session");
            return Err(RemoteError::NoNodesAvailable);
        };

        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let buffer = &self.config().buffer;
        let session = RemoteSession::new(
            id,
            track,
            encoded_track,
            config,
            buffer.default_duration,
            buffer.default_volume,
            listener,
        );

        info!(
            session = %id,
            node = node.address(),
            uri = %session.track().uri.as_deref().map(redact_url).unwrap_or_default(),
            "Starting session"
        );
        node.assign(Arc::clone(&session));
        publish(
            &self.resources.events,
            CoreEvent::Session(SessionEvent::Started {
                session_id: id.0,
                node: node.address().to_string(),
            }),
        );

        Ok(session)
    }

    /// Returns `false` if the session had already finished.
    #[instrument(skip(self, session), fields(session = %session.id()))]
    pub fn stop_session(&self, session: &RemoteSession) -> bool {
        session.stop()
    }

    #[instrument(skip(self, session), fields(session = %session.id()))]
    pub fn set_position(&self, session: &RemoteSession, timecode: i64) {
        session.set_position(timecode);
    }

    pub fn set_volume(&self, session: &RemoteSession, volume: u16) {
        session.set_volume(volume);
    }

    /// Next frame for the consumer; never blocks.
    pub fn pull_frame(&self, session: &RemoteSession) -> Option<BufferedFrame> {
        session.provide_frame()
    }

    pub fn pull_frame_timeout(
        &self,
        session: &RemoteSession,
        timeout: Duration,
    ) -> Option<BufferedFrame> {
        session.provide_frame_timeout(timeout)
    }

    pub fn locate_session(&self, id: SessionId) -> SessionLocation {
        if let Some(node) = self
            .nodes
            .read()
            .iter()
            .find(|node| node.contains_session(id))
        {
            return SessionLocation::Node(node.address().to_string());
        }
        if self.resources.abandoned.contains(id) {
            return SessionLocation::Abandoned;
        }
        SessionLocation::Unassigned
    }

    pub fn abandoned_count(&self) -> usize {
        self.resources.abandoned.len()
    }

    /// Stop every poll loop and the sweep task, then stop all sessions.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let nodes = self.nodes.read().clone();
        for node in &nodes {
            node.shutdown();
        }
        self.resources.abandoned.stop_all();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!(error = %e, "Task ended abnormally during shutdown");
                }
            }
        }

        info!("Node coordinator shut down");
    }
}

impl std::fmt::Debug for NodeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCoordinator")
            .field("nodes", &self.nodes.read().len())
            .field("abandoned", &self.resources.abandoned.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}
