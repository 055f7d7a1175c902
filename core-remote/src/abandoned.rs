//! # Abandoned Sessions
//!
//! Sessions evicted from an unresponsive node wait here until a healthy node
//! adopts them or they expire.
//!
//! ## Adoption
//!
//! Each sweep computes the eligible adopters (online, with statistics, below
//! the critical penalty) and gives each a small quota,
//! `max(min_quota, playing_tracks / quota_divisor)`, so a node that just
//! recovered is not flooded. Entries go to the adopter with the lowest
//! adopted-to-quota ratio. Entries that cannot be placed stay queued for the
//! next sweep.

use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventBus, SessionEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AbandonmentConfig;
use crate::error::SessionFailure;
use crate::publish;
use crate::session::{RemoteSession, SessionId};

const EXPIRED_MESSAGE: &str = "Could not find next node to play on";
const QUEUE_FULL_MESSAGE: &str = "Too many sessions waiting for a node";

/// Load figures an adopter is judged by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdoptionLoad {
    pub penalty: u32,
    pub playing_tracks: u32,
}

/// A node that can take over abandoned sessions.
pub trait SessionAdopter: Send + Sync {
    fn address(&self) -> &str;

    /// `None` when the node cannot adopt at all (not online, no statistics).
    fn adoption_load(&self) -> Option<AdoptionLoad>;

    /// Take ownership of the session and start it on the node.
    fn adopt(&self, session: Arc<RemoteSession>);
}

struct AbandonedEntry {
    session: Arc<RemoteSession>,
    abandoned_at: DateTime<Utc>,
}

struct Candidate<'a, A: ?Sized> {
    node: &'a A,
    quota: u32,
    adopted: u32,
}

impl<A: ?Sized> Candidate<'_, A> {
    fn has_room(&self) -> bool {
        self.adopted < self.quota
    }
}

pub struct AbandonedSessionManager {
    queue: Mutex<VecDeque<AbandonedEntry>>,
    config: AbandonmentConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl AbandonedSessionManager {
    pub fn new(config: AbandonmentConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            config,
            clock,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.queue.lock().iter().any(|entry| entry.session.id() == id)
    }

    /// Queue a session for adoption.
    ///
    /// When the queue is full the session fails immediately and `false` is
    /// returned.
    pub fn add(&self, session: Arc<RemoteSession>) -> bool {
        let rejected = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.capacity {
                Some(session)
            } else {
                queue.push_back(AbandonedEntry {
                    session,
                    abandoned_at: self.clock.now(),
                });
                None
            }
        };

        match rejected {
            None => true,
            Some(session) => {
                warn!(session = %session.id(), capacity = self.config.capacity, "Abandoned queue full");
                self.fail(&session, SessionFailure::common(QUEUE_FULL_MESSAGE));
                false
            }
        }
    }

    /// Hand queued sessions to eligible adopters. Returns the number adopted.
    pub fn distribute<A>(&self, nodes: &[Arc<A>]) -> usize
    where
        A: SessionAdopter + ?Sized,
    {
        if self.is_empty() {
            return 0;
        }

        let mut candidates: Vec<Candidate<'_, A>> = nodes
            .iter()
            .filter_map(|node| {
                let load = node.adoption_load()?;
                (load.penalty < self.config.critical_penalty).then(|| Candidate {
                    node: node.as_ref(),
                    quota: self.config.quota_for(load.playing_tracks),
                    adopted: 0,
                })
            })
            .collect();

        if candidates.is_empty() {
            debug!(queued = self.len(), "No node can adopt abandoned sessions");
            return 0;
        }

        let total_quota: u32 = candidates.iter().map(|c| c.quota).sum();
        let now = self.clock.now();
        let mut handed = 0u32;

        while handed < total_quota {
            let Some(entry) = self.queue.lock().pop_front() else {
                break;
            };

            if entry.session.is_finished() {
                debug!(session = %entry.session.id(), "Dropping finished abandoned session");
                continue;
            }
            if self.is_expired(&entry, now) {
                self.expire(entry);
                continue;
            }

            let target = candidates
                .iter_mut()
                .filter(|c| c.has_room())
                .min_by(|a, b| {
                    // a.adopted / a.quota vs b.adopted / b.quota
                    (u64::from(a.adopted) * u64::from(b.quota))
                        .cmp(&(u64::from(b.adopted) * u64::from(a.quota)))
                });
            let Some(target) = target else {
                self.queue.lock().push_front(entry);
                break;
            };

            target.adopted += 1;
            handed += 1;

            let session_id = entry.session.id();
            info!(session = %session_id, node = target.node.address(), "Session adopted");
            publish(
                &self.events,
                CoreEvent::Session(SessionEvent::Adopted {
                    session_id: session_id.0,
                    node: target.node.address().to_string(),
                }),
            );
            target.node.adopt(entry.session);
        }

        handed as usize
    }

    /// Fail every entry older than the expiry threshold.
    pub fn drain_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<AbandonedEntry> = {
            let mut queue = self.queue.lock();
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = queue
                .drain(..)
                .partition(|entry| self.is_expired(entry, now));
            *queue = kept;
            expired.into()
        };

        let count = expired.len();
        for entry in expired {
            self.expire(entry);
        }
        count
    }

    /// Stop everything still waiting.
    pub fn stop_all(&self) {
        let entries: Vec<AbandonedEntry> = self.queue.lock().drain(..).collect();
        for entry in entries {
            entry.session.stop();
        }
    }

    fn is_expired(&self, entry: &AbandonedEntry, now: DateTime<Utc>) -> bool {
        (now - entry.abandoned_at)
            .to_std()
            .is_ok_and(|age| age > self.config.expiry)
    }

    fn expire(&self, entry: AbandonedEntry) {
        if entry.session.is_finished() {
            return;
        }
        warn!(session = %entry.session.id(), "Abandoned session expired");
        self.fail(&entry.session, SessionFailure::common(EXPIRED_MESSAGE));
    }

    fn fail(&self, session: &RemoteSession, failure: SessionFailure) {
        publish(
            &self.events,
            CoreEvent::Session(SessionEvent::Failed {
                session_id: session.id().0,
                message: failure.message.clone(),
                severity: failure.severity.to_string(),
            }),
        );
        session.fail(failure);
    }
}

impl std::fmt::Debug for AbandonedSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbandonedSessionManager")
            .field("queued", &self.len())
            .field("capacity", &self.config.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;
    use crate::session::tests::{test_session, test_session_with};
    use crate::session::MockSessionListener;
    use bridge_traits::time::ManualClock;
    use std::time::Duration;

    struct FakeAdopter {
        address: String,
        load: Option<AdoptionLoad>,
        adopted: Mutex<Vec<SessionId>>,
    }

    impl FakeAdopter {
        fn new(address: &str, penalty: u32, playing_tracks: u32) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                load: Some(AdoptionLoad {
                    penalty,
                    playing_tracks,
                }),
                adopted: Mutex::new(Vec::new()),
            })
        }

        fn offline(address: &str) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                load: None,
                adopted: Mutex::new(Vec::new()),
            })
        }

        fn adopted(&self) -> usize {
            self.adopted.lock().len()
        }
    }

    impl SessionAdopter for FakeAdopter {
        fn address(&self) -> &str {
            &self.address
        }

        fn adoption_load(&self) -> Option<AdoptionLoad> {
            self.load
        }

        fn adopt(&self, session: Arc<RemoteSession>) {
            self.adopted.lock().push(session.id());
        }
    }

    fn manager(clock: Arc<ManualClock>, capacity: usize) -> AbandonedSessionManager {
        AbandonedSessionManager::new(
            AbandonmentConfig {
                capacity,
                ..AbandonmentConfig::default()
            },
            clock,
            EventBus::new(64),
        )
    }

    #[test]
    fn test_quota_limits_one_sweep() {
        let manager = manager(Arc::new(ManualClock::starting_now()), 2000);
        for id in 0..50 {
            assert!(manager.add(test_session(id)));
        }

        let node = FakeAdopter::new("b:1", 20, 150);
        assert_eq!(manager.distribute(&[Arc::clone(&node)]), 10);
        assert_eq!(node.adopted(), 10);
        assert_eq!(manager.len(), 40);

        // Next sweep continues in queue order.
        manager.distribute(&[Arc::clone(&node)]);
        assert_eq!(node.adopted.lock()[10], SessionId(10));
    }

    #[test]
    fn test_minimum_quota_for_idle_node() {
        let manager = manager(Arc::new(ManualClock::starting_now()), 2000);
        for id in 0..8 {
            manager.add(test_session(id));
        }

        let node = FakeAdopter::new("b:1", 0, 0);
        assert_eq!(manager.distribute(&[node]), 5);
        assert_eq!(manager.len(), 3);
    }

    #[test]
    fn test_critical_and_offline_nodes_never_adopt() {
        let manager = manager(Arc::new(ManualClock::starting_now()), 2000);
        manager.add(test_session(1));

        let busy = FakeAdopter::new("a:1", 750, 0);
        let down = FakeAdopter::offline("b:1");
        assert_eq!(manager.distribute(&[busy, down]), 0);
        assert!(manager.contains(SessionId(1)));
    }

    #[test]
    fn test_spread_by_quota_ratio() {
        let manager = manager(Arc::new(ManualClock::starting_now()), 2000);
        for id in 0..12 {
            manager.add(test_session(id));
        }

        // Quotas 5 and 10.
        let small = FakeAdopter::new("a:1", 10, 30);
        let large = FakeAdopter::new("b:1", 10, 150);
        assert_eq!(
            manager.distribute(&[Arc::clone(&small), Arc::clone(&large)]),
            12
        );
        assert_eq!(small.adopted() + large.adopted(), 12);
        assert!(large.adopted() >= 7, "large adopted {}", large.adopted());
        assert!(small.adopted() <= 5);
    }

    #[test]
    fn test_full_queue_fails_session() {
        let manager = manager(Arc::new(ManualClock::starting_now()), 1);
        let mut listener = MockSessionListener::new();
        listener
            .expect_on_failure()
            .withf(|failure| failure.severity == Severity::Common)
            .times(1)
            .return_const(());

        assert!(manager.add(test_session(1)));
        let overflow = test_session_with(2, Arc::new(listener));
        assert!(!manager.add(Arc::clone(&overflow)));
        assert!(overflow.is_finished());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_expired_entry_fails_on_distribute() {
        let clock = Arc::new(ManualClock::starting_now());
        let manager = manager(Arc::clone(&clock), 2000);
        let session = test_session(1);
        manager.add(Arc::clone(&session));

        clock.advance(Duration::from_millis(10_000));
        let node = FakeAdopter::new("b:1", 0, 0);
        manager.add(test_session(2));
        clock.advance(Duration::from_millis(1));

        assert_eq!(manager.distribute(&[Arc::clone(&node)]), 1);
        assert!(session.is_finished());
        assert_eq!(session.last_failure().unwrap().message, EXPIRED_MESSAGE);
        assert_eq!(*node.adopted.lock(), vec![SessionId(2)]);
    }

    #[test]
    fn test_drain_expired_without_adopters() {
        let clock = Arc::new(ManualClock::starting_now());
        let manager = manager(Arc::clone(&clock), 2000);
        let old = test_session(1);
        manager.add(Arc::clone(&old));
        clock.advance(Duration::from_secs(6));
        let young = test_session(2);
        manager.add(Arc::clone(&young));

        clock.advance(Duration::from_millis(4_001));
        assert_eq!(manager.drain_expired(), 1);
        assert!(old.is_finished());
        assert!(!young.is_finished());
        assert!(manager.contains(SessionId(2)));
    }

    #[test]
    fn test_finished_entries_are_dropped_silently() {
        let manager = manager(Arc::new(ManualClock::starting_now()), 2000);
        let session = test_session(1);
        manager.add(Arc::clone(&session));
        session.stop();

        let node = FakeAdopter::new("b:1", 0, 0);
        assert_eq!(manager.distribute(&[Arc::clone(&node)]), 0);
        assert!(manager.is_empty());
        assert!(session.last_failure().is_none());
    }
}
