//! Cache invalidation coordination
//!
//! State-changing events invalidate derived read caches keyed by swap, user,
//! and swap-pair compatibility. Invalidation is best-effort: failures are
//! logged and counted, never surfaced to the caller that raised the event.
//! Cache staleness is preferred over blocking the swap path.

use crate::error::EngineResult;
use crate::metrics;

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Derived cache keys
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Swap(String),
    User(String),
    /// Pairwise compatibility between two swaps; order-insensitive
    Compatibility(String, String),
}

impl CacheKey {
    /// Normalize the pair so (a, b) and (b, a) hit the same entry
    pub fn compatibility(a: &str, b: &str) -> Self {
        if a <= b {
            CacheKey::Compatibility(a.to_string(), b.to_string())
        } else {
            CacheKey::Compatibility(b.to_string(), a.to_string())
        }
    }

    fn cache_name(&self) -> &'static str {
        match self {
            CacheKey::Swap(_) => "swap",
            CacheKey::User(_) => "user",
            CacheKey::Compatibility(_, _) => "compatibility",
        }
    }
}

/// Domain events that invalidate derived caches
#[derive(Debug, Clone)]
pub enum DomainEvent {
    SwapUpdated {
        swap_id: String,
        user_ids: Vec<String>,
        related_swap_ids: Vec<String>,
    },
    UserUpdated {
        user_id: String,
    },
    ProposalCreated {
        proposal_id: String,
        proposer_account_id: String,
        acceptor_account_id: String,
    },
    BookingUpdated {
        booking_id: String,
        owner_account_id: String,
    },
}

impl DomainEvent {
    /// Coalescing key: events sharing a (type, entity id) collapse to one
    fn coalescing_key(&self) -> (&'static str, String) {
        match self {
            DomainEvent::SwapUpdated { swap_id, .. } => ("swap_updated", swap_id.clone()),
            DomainEvent::UserUpdated { user_id } => ("user_updated", user_id.clone()),
            DomainEvent::ProposalCreated { proposal_id, .. } => {
                ("proposal_created", proposal_id.clone())
            }
            DomainEvent::BookingUpdated { booking_id, .. } => {
                ("booking_updated", booking_id.clone())
            }
        }
    }

    /// Cache keys this event invalidates
    fn derived_keys(&self) -> Vec<CacheKey> {
        match self {
            DomainEvent::SwapUpdated {
                swap_id,
                user_ids,
                related_swap_ids,
            } => {
                let mut keys = vec![CacheKey::Swap(swap_id.clone())];
                keys.extend(user_ids.iter().map(|u| CacheKey::User(u.clone())));
                keys.extend(
                    related_swap_ids
                        .iter()
                        .map(|other| CacheKey::compatibility(swap_id, other)),
                );
                keys
            }
            DomainEvent::UserUpdated { user_id } => vec![CacheKey::User(user_id.clone())],
            DomainEvent::ProposalCreated {
                proposal_id,
                proposer_account_id,
                acceptor_account_id,
            } => vec![
                CacheKey::Swap(proposal_id.clone()),
                CacheKey::User(proposer_account_id.clone()),
                CacheKey::User(acceptor_account_id.clone()),
            ],
            DomainEvent::BookingUpdated {
                owner_account_id, ..
            } => vec![CacheKey::User(owner_account_id.clone())],
        }
    }
}

/// Cache store consumed by the coordinator
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn invalidate(&self, key: &CacheKey) -> EngineResult<()>;
}

/// Backend for deployments without a read cache; records metrics only
pub struct NullCacheBackend;

#[async_trait]
impl CacheBackend for NullCacheBackend {
    async fn invalidate(&self, key: &CacheKey) -> EngineResult<()> {
        debug!(?key, "cache invalidation (null backend)");
        Ok(())
    }
}

/// Invalidation timing
#[derive(Debug, Clone, Copy)]
pub enum InvalidationMode {
    /// Apply synchronously as events arrive
    Immediate,
    /// Coalesce events within the delay window, then apply once per key
    Batched { delay: Duration },
}

/// Coordinates cache invalidation for domain events
pub struct CacheInvalidationCoordinator {
    backend: Arc<dyn CacheBackend>,
    mode: InvalidationMode,
    pending: Arc<Mutex<HashMap<(&'static str, String), DomainEvent>>>,
    flush_scheduled: Arc<AtomicBool>,
}

impl CacheInvalidationCoordinator {
    pub fn new(backend: Arc<dyn CacheBackend>, mode: InvalidationMode) -> Self {
        Self {
            backend,
            mode,
            pending: Arc::new(Mutex::new(HashMap::new())),
            flush_scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish a domain event. Never fails: invalidation problems are
    /// logged, not raised.
    pub async fn publish(&self, event: DomainEvent) {
        match self.mode {
            InvalidationMode::Immediate => {
                let keys: HashSet<CacheKey> = event.derived_keys().into_iter().collect();
                Self::fan_out(&self.backend, keys).await;
            }
            InvalidationMode::Batched { delay } => {
                {
                    let mut pending = self.pending.lock().await;
                    pending.insert(event.coalescing_key(), event);
                }

                if !self.flush_scheduled.swap(true, Ordering::SeqCst) {
                    let backend = self.backend.clone();
                    let pending = self.pending.clone();
                    let flush_scheduled = self.flush_scheduled.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        Self::drain(&backend, &pending, &flush_scheduled).await;
                    });
                }
            }
        }
    }

    /// Drain all pending batches synchronously (shutdown, tests)
    pub async fn flush(&self) {
        Self::drain(&self.backend, &self.pending, &self.flush_scheduled).await;
    }

    async fn drain(
        backend: &Arc<dyn CacheBackend>,
        pending: &Arc<Mutex<HashMap<(&'static str, String), DomainEvent>>>,
        flush_scheduled: &Arc<AtomicBool>,
    ) {
        let events: Vec<DomainEvent> = {
            let mut pending = pending.lock().await;
            flush_scheduled.store(false, Ordering::SeqCst);
            pending.drain().map(|(_, event)| event).collect()
        };

        if events.is_empty() {
            return;
        }

        // One invalidation per distinct derived key
        let keys: HashSet<CacheKey> = events
            .iter()
            .flat_map(|event| event.derived_keys())
            .collect();

        debug!(
            event_count = events.len(),
            key_count = keys.len(),
            "flushing coalesced cache invalidations"
        );
        Self::fan_out(backend, keys).await;
    }

    /// Invalidate every key, collecting per-item outcomes; a failed sibling
    /// never aborts the rest.
    async fn fan_out(backend: &Arc<dyn CacheBackend>, keys: HashSet<CacheKey>) {
        let futures = keys.into_iter().map(|key| {
            let backend = backend.clone();
            async move {
                let result = backend.invalidate(&key).await;
                (key, result)
            }
        });

        for (key, result) in join_all(futures).await {
            match result {
                Ok(()) => metrics::record_cache_invalidation(key.cache_name()),
                Err(err) => {
                    metrics::record_cache_invalidation_failure();
                    warn!(?key, error = %err, "cache invalidation failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SwapError;

    struct RecordingBackend {
        keys: Mutex<Vec<CacheKey>>,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                keys: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CacheBackend for RecordingBackend {
        async fn invalidate(&self, key: &CacheKey) -> EngineResult<()> {
            self.keys.lock().await.push(key.clone());
            Ok(())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        async fn invalidate(&self, _key: &CacheKey) -> EngineResult<()> {
            Err(SwapError::Network {
                message: "cache down".to_string(),
            })
        }
    }

    fn swap_event(swap_id: &str) -> DomainEvent {
        DomainEvent::SwapUpdated {
            swap_id: swap_id.to_string(),
            user_ids: vec!["0.0.100".to_string()],
            related_swap_ids: vec!["s9".to_string()],
        }
    }

    #[test]
    fn test_compatibility_key_is_order_insensitive() {
        assert_eq!(
            CacheKey::compatibility("s1", "s9"),
            CacheKey::compatibility("s9", "s1")
        );
    }

    #[tokio::test]
    async fn test_immediate_mode_invalidates_synchronously() {
        let backend = Arc::new(RecordingBackend::new());
        let coordinator = CacheInvalidationCoordinator::new(
            backend.clone(),
            InvalidationMode::Immediate,
        );

        coordinator.publish(swap_event("s1")).await;

        let keys = backend.keys.lock().await;
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&CacheKey::Swap("s1".to_string())));
        assert!(keys.contains(&CacheKey::User("0.0.100".to_string())));
        assert!(keys.contains(&CacheKey::compatibility("s1", "s9")));
    }

    #[tokio::test]
    async fn test_batched_mode_coalesces_same_entity() {
        let backend = Arc::new(RecordingBackend::new());
        let coordinator = CacheInvalidationCoordinator::new(
            backend.clone(),
            InvalidationMode::Batched {
                delay: Duration::from_secs(60),
            },
        );

        coordinator.publish(swap_event("s1")).await;
        coordinator.publish(swap_event("s1")).await;
        coordinator.publish(swap_event("s1")).await;

        // Nothing applied before the window elapses or a manual flush
        assert!(backend.keys.lock().await.is_empty());

        coordinator.flush().await;
        assert_eq!(backend.keys.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_batched_mode_distinct_entities_all_invalidate() {
        let backend = Arc::new(RecordingBackend::new());
        let coordinator = CacheInvalidationCoordinator::new(
            backend.clone(),
            InvalidationMode::Batched {
                delay: Duration::from_secs(60),
            },
        );

        coordinator.publish(swap_event("s1")).await;
        coordinator
            .publish(DomainEvent::UserUpdated {
                user_id: "0.0.200".to_string(),
            })
            .await;

        coordinator.flush().await;

        let keys = backend.keys.lock().await;
        assert!(keys.contains(&CacheKey::User("0.0.200".to_string())));
        assert_eq!(keys.len(), 4);
    }

    #[tokio::test]
    async fn test_flush_after_flush_is_noop() {
        let backend = Arc::new(RecordingBackend::new());
        let coordinator = CacheInvalidationCoordinator::new(
            backend.clone(),
            InvalidationMode::Batched {
                delay: Duration::from_secs(60),
            },
        );

        coordinator.publish(swap_event("s1")).await;
        coordinator.flush().await;
        coordinator.flush().await;

        assert_eq!(backend.keys.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_backend_failure_is_swallowed() {
        let coordinator = CacheInvalidationCoordinator::new(
            Arc::new(FailingBackend),
            InvalidationMode::Immediate,
        );

        // Must not panic or propagate
        coordinator.publish(swap_event("s1")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_window_applies_after_delay() {
        let backend = Arc::new(RecordingBackend::new());
        let coordinator = CacheInvalidationCoordinator::new(
            backend.clone(),
            InvalidationMode::Batched {
                delay: Duration::from_millis(50),
            },
        );

        coordinator.publish(swap_event("s1")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Allow the spawned drain task to run
        tokio::task::yield_now().await;

        assert_eq!(backend.keys.lock().await.len(), 3);
    }
}
