//! Registry of outstanding message-bus requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First sleep while draining; doubles up to `MAX_WAIT_STEP`.
const INITIAL_WAIT_STEP: Duration = Duration::from_millis(50);
const MAX_WAIT_STEP: Duration = Duration::from_secs(1);

/// One request waiting for its reply.
#[derive(Debug, Clone)]
pub struct CorrelationRecord {
    pub correlation_id: String,
    /// What issued the request, usually the input file.
    pub origin: String,
    pub started_at: DateTime<Utc>,
    start: Instant,
    /// Partial results noted against this request.
    pub dependencies: Vec<serde_json::Value>,
}

impl CorrelationRecord {
    pub fn age(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Outstanding requests, keyed by correlation id.
///
/// The lock is never held across an `.await`.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    records: Mutex<HashMap<String, CorrelationRecord>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CorrelationRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request under a fresh id.
    pub fn new_id(&self, origin: impl Into<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.register(id.clone(), origin);
        id
    }

    /// Register a request under a caller-chosen id.
    pub fn register(&self, correlation_id: impl Into<String>, origin: impl Into<String>) {
        let correlation_id = correlation_id.into();
        let record = CorrelationRecord {
            correlation_id: correlation_id.clone(),
            origin: origin.into(),
            started_at: Utc::now(),
            start: Instant::now(),
            dependencies: Vec::new(),
        };
        if self.lock().insert(correlation_id.clone(), record).is_some() {
            warn!(correlation_id, "Correlation id registered twice");
        }
    }

    /// Attach a partial result. Returns false for unknown ids.
    pub fn note_dependency(&self, correlation_id: &str, value: serde_json::Value) -> bool {
        match self.lock().get_mut(correlation_id) {
            Some(record) => {
                record.dependencies.push(value);
                true
            }
            None => {
                debug!(correlation_id, "Dependency for unknown correlation id");
                false
            }
        }
    }

    pub fn get(&self, correlation_id: &str) -> Option<CorrelationRecord> {
        self.lock().get(correlation_id).cloned()
    }

    pub fn remove(&self, correlation_id: &str) -> Option<CorrelationRecord> {
        let removed = self.lock().remove(correlation_id);
        if removed.is_none() {
            debug!(correlation_id, "Removing unknown correlation id");
        }
        removed
    }

    /// Drop records older than `max_lifetime`; their replies are presumed lost.
    pub fn remove_stale(&self, max_lifetime: Duration) -> Vec<CorrelationRecord> {
        let mut records = self.lock();
        let stale: Vec<String> = records
            .values()
            .filter(|r| r.age() > max_lifetime)
            .map(|r| r.correlation_id.clone())
            .collect();
        let removed: Vec<CorrelationRecord> =
            stale.iter().filter_map(|id| records.remove(id)).collect();
        drop(records);
        for r in &removed {
            warn!(
                correlation_id = %r.correlation_id,
                origin = %r.origin,
                age = ?r.age(),
                "Dropping stale correlation record"
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll until empty, sleeping 50 ms, 100 ms, ... up to 1 s between checks.
    /// Returns whether the registry drained within `timeout`.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut step = INITIAL_WAIT_STEP;
        let mut polls = 0u32;
        loop {
            let outstanding = self.len();
            if outstanding == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(outstanding, "Correlation records still outstanding");
                return false;
            }
            if polls % 20 == 0 {
                debug!(outstanding, "Waiting for replies");
            }
            polls += 1;
            tokio::time::sleep(step.min(deadline - now)).await;
            step = (step * 2).min(MAX_WAIT_STEP);
        }
    }

    /// Periodically run `remove_stale` until the returned flag is set.
    pub fn spawn_stale_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_lifetime: Duration,
    ) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let registry = Arc::clone(self);

        let handle = tokio::spawn(async move {
            info!(interval = ?interval, lifetime = ?max_lifetime, "Correlation sweeper started");
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    debug!("Correlation sweeper shutting down");
                    return;
                }
                registry.remove_stale(max_lifetime);
            }
        });

        (handle, shutdown_flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tracks_records_and_dependencies() {
        let registry = CorrelationRegistry::new();
        let a = registry.new_id("topic/slides.py");
        let b = registry.new_id("img/a.pu");
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        assert!(registry.note_dependency(&a, json!({"output": "a.html"})));
        assert!(!registry.note_dependency("missing", json!(1)));
        assert_eq!(registry.get(&a).unwrap().dependencies.len(), 1);

        assert_eq!(registry.remove(&a).unwrap().origin, "topic/slides.py");
        assert!(registry.remove(&a).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn separate_registries_do_not_share_state() {
        let one = CorrelationRegistry::new();
        let two = CorrelationRegistry::new();
        one.new_id("x");
        assert!(two.is_empty());
    }

    #[tokio::test]
    async fn stale_records_are_swept() {
        let registry = CorrelationRegistry::new();
        registry.new_id("old");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = registry.new_id("fresh");

        let removed = registry.remove_stale(Duration::from_millis(20));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].origin, "old");
        assert!(registry.get(&fresh).is_some());
    }

    #[tokio::test]
    async fn wait_reports_drain_or_timeout() {
        let registry = Arc::new(CorrelationRegistry::new());
        let id = registry.new_id("a");
        assert!(!registry.wait_for_completion(Duration::from_millis(60)).await);

        let r = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            r.remove(&id);
        });
        assert!(registry.wait_for_completion(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn sweeper_removes_lost_requests() {
        let registry = Arc::new(CorrelationRegistry::new());
        registry.new_id("lost");
        let (handle, stop) =
            registry.spawn_stale_sweeper(Duration::from_millis(10), Duration::from_millis(5));
        assert!(registry.wait_for_completion(Duration::from_secs(2)).await);
        stop.store(true, Ordering::Relaxed);
        handle.await.unwrap();
    }
}
