//! Cross-engine governance snapshot (§2 supplemented from
//! `governance_system.py`; spec.md §7 "heartbeat" names the behavior without
//! a struct shape — this grounds it).
//!
//! Each periodic engine records its own cycle health here; `main.rs`'s
//! heartbeat loop aggregates and logs the whole map on its own interval.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineHealth {
    Healthy,
    Degraded,
    Halted,
}

impl EngineHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineHealth::Healthy => "healthy",
            EngineHealth::Degraded => "degraded",
            EngineHealth::Halted => "halted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GovernanceSnapshot {
    pub engine: String,
    pub last_successful_cycle: Option<chrono::DateTime<chrono::Utc>>,
    pub consecutive_failures: u32,
    pub health: EngineHealth,
}

/// Degraded after 3 consecutive failed cycles, halted after 10 — chosen to
/// mirror the Doctrine Keeper's own promotion/retirement cadence (§4.9)
/// rather than invent unrelated constants.
const DEGRADED_AFTER: u32 = 3;
const HALTED_AFTER: u32 = 10;

/// What `main.rs`'s heartbeat loop fans out each tick (§7). Late subscribers
/// simply miss earlier ticks; the channel only buffers the last
/// `HEARTBEAT_CHANNEL_CAPACITY` events.
#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    pub strand_count: usize,
    pub price_recency_seconds: Option<i64>,
    pub engines: Vec<GovernanceSnapshot>,
}

const HEARTBEAT_CHANNEL_CAPACITY: usize = 16;

pub struct GovernanceRegistry {
    snapshots: RwLock<HashMap<String, GovernanceSnapshot>>,
    heartbeat: broadcast::Sender<Arc<HeartbeatEvent>>,
}

impl Default for GovernanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GovernanceRegistry {
    pub fn new() -> Self {
        let (heartbeat, _) = broadcast::channel(HEARTBEAT_CHANNEL_CAPACITY);
        Self { snapshots: RwLock::new(HashMap::new()), heartbeat }
    }

    /// Subscribe to heartbeat fan-out; each tick of `main.rs`'s heartbeat
    /// loop publishes one event regardless of whether any receiver exists.
    pub fn subscribe_heartbeat(&self) -> broadcast::Receiver<Arc<HeartbeatEvent>> {
        self.heartbeat.subscribe()
    }

    /// Publishes a heartbeat tick. A `SendError` here just means no one is
    /// currently subscribed, which is the common case; it isn't an error.
    pub fn publish_heartbeat(&self, event: HeartbeatEvent) {
        let _ = self.heartbeat.send(Arc::new(event));
    }

    pub fn record_success(&self, engine: &str) {
        let mut snapshots = self.snapshots.write();
        let entry = snapshots.entry(engine.to_string()).or_insert_with(|| GovernanceSnapshot {
            engine: engine.to_string(),
            last_successful_cycle: None,
            consecutive_failures: 0,
            health: EngineHealth::Healthy,
        });
        entry.last_successful_cycle = Some(chrono::Utc::now());
        entry.consecutive_failures = 0;
        entry.health = EngineHealth::Healthy;
    }

    pub fn record_failure(&self, engine: &str) {
        let mut snapshots = self.snapshots.write();
        let entry = snapshots.entry(engine.to_string()).or_insert_with(|| GovernanceSnapshot {
            engine: engine.to_string(),
            last_successful_cycle: None,
            consecutive_failures: 0,
            health: EngineHealth::Healthy,
        });
        entry.consecutive_failures += 1;
        entry.health = if entry.consecutive_failures >= HALTED_AFTER {
            EngineHealth::Halted
        } else if entry.consecutive_failures >= DEGRADED_AFTER {
            EngineHealth::Degraded
        } else {
            EngineHealth::Healthy
        };
    }

    pub fn snapshot_all(&self) -> Vec<GovernanceSnapshot> {
        self.snapshots.read().values().cloned().collect()
    }

    pub fn is_halted(&self, engine: &str) -> bool {
        self.snapshots
            .read()
            .get(engine)
            .map(|s| s.health == EngineHealth::Halted)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrades_then_halts_after_repeated_failures() {
        let registry = GovernanceRegistry::new();
        for _ in 0..3 {
            registry.record_failure("collector");
        }
        assert_eq!(registry.snapshot_all()[0].health, EngineHealth::Degraded);
        for _ in 0..7 {
            registry.record_failure("collector");
        }
        assert!(registry.is_halted("collector"));
    }

    #[test]
    fn success_resets_failure_streak() {
        let registry = GovernanceRegistry::new();
        registry.record_failure("reconciler");
        registry.record_failure("reconciler");
        registry.record_success("reconciler");
        let snap = registry.snapshot_all();
        assert_eq!(snap[0].consecutive_failures, 0);
        assert_eq!(snap[0].health, EngineHealth::Healthy);
    }

    #[tokio::test]
    async fn heartbeat_publish_reaches_subscriber() {
        let registry = GovernanceRegistry::new();
        let mut rx = registry.subscribe_heartbeat();
        registry.publish_heartbeat(HeartbeatEvent {
            strand_count: 42,
            price_recency_seconds: Some(5),
            engines: registry.snapshot_all(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.strand_count, 42);
        assert_eq!(event.price_recency_seconds, Some(5));
    }

    #[test]
    fn publish_without_subscriber_is_not_an_error() {
        let registry = GovernanceRegistry::new();
        registry.publish_heartbeat(HeartbeatEvent {
            strand_count: 0,
            price_recency_seconds: None,
            engines: vec![],
        });
    }
}
