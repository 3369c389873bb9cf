//! End-to-end swap flow tests against the in-memory store and a scripted
//! ledger fake.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use bookswap_engine::alerts::AlertDispatcher;
use bookswap_engine::cache::{CacheInvalidationCoordinator, InvalidationMode, NullCacheBackend};
use bookswap_engine::classify::{ClassifiedError, ErrorKind};
use bookswap_engine::config::EngineConfig;
use bookswap_engine::error::EngineResult;
use bookswap_engine::ledger::{LedgerGateway, LedgerReceipt, SwapParams};
use bookswap_engine::orchestrator::{SwapExecutionRequest, SwapOrchestrator, SwapStep};
use bookswap_engine::store::{InMemoryStore, ProposalStatus, TransactionalStore};
use bookswap_engine::SwapError;

/// Ledger fake whose failure behavior is fixed at construction
struct ScriptedLedger {
    seq: AtomicU64,
    execute_error: Option<SwapError>,
    verify_error: Option<SwapError>,
    cancel_error: Option<SwapError>,
    /// When set, accept_swap blocks until notified
    accept_gate: Option<Arc<Notify>>,
}

impl ScriptedLedger {
    fn ok() -> Self {
        Self {
            seq: AtomicU64::new(0),
            execute_error: None,
            verify_error: None,
            cancel_error: None,
            accept_gate: None,
        }
    }

    fn failing_execute(err: SwapError) -> Self {
        Self {
            execute_error: Some(err),
            ..Self::ok()
        }
    }

    fn failing_verify(err: SwapError) -> Self {
        Self {
            verify_error: Some(err),
            ..Self::ok()
        }
    }

    fn with_accept_gate(gate: Arc<Notify>) -> Self {
        Self {
            accept_gate: Some(gate),
            ..Self::ok()
        }
    }

    fn receipt(&self) -> LedgerReceipt {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        LedgerReceipt {
            transaction_id: format!("0.0.7@1700000000.{seq:09}"),
            consensus_timestamp: format!("1700000000.{seq:09}"),
        }
    }
}

#[async_trait]
impl LedgerGateway for ScriptedLedger {
    async fn propose_swap(&self, _params: &SwapParams) -> EngineResult<LedgerReceipt> {
        Ok(self.receipt())
    }

    async fn accept_swap(&self, _proposal_id: &str) -> EngineResult<LedgerReceipt> {
        if let Some(gate) = &self.accept_gate {
            gate.notified().await;
        }
        Ok(self.receipt())
    }

    async fn execute_swap(&self, _proposal_id: &str) -> EngineResult<LedgerReceipt> {
        match &self.execute_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.receipt()),
        }
    }

    async fn verify_swap(&self, _proposal_id: &str) -> EngineResult<LedgerReceipt> {
        match &self.verify_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.receipt()),
        }
    }

    async fn cancel_swap(&self, _proposal_id: &str) -> EngineResult<LedgerReceipt> {
        match &self.cancel_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.receipt()),
        }
    }
}

/// Alert sink recording the kind of every critical notification
struct CountingAlerts {
    kinds: Mutex<Vec<ErrorKind>>,
}

impl CountingAlerts {
    fn new() -> Self {
        Self {
            kinds: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AlertDispatcher for CountingAlerts {
    async fn notify_critical(&self, error: &ClassifiedError) {
        self.kinds.lock().await.push(error.kind);
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        step_timeout_ms: 5_000,
        max_step_retries: 1,
        retry_delay_ms: 1,
        verify_max_retries: 1,
        verify_backoff_ms: 1,
        rollback_max_attempts: 2,
        rollback_backoff_ms: 1,
        ..EngineConfig::default()
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    alerts: Arc<CountingAlerts>,
    orchestrator: SwapOrchestrator,
}

async fn harness(ledger: ScriptedLedger) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    store.add_booking("b1", "0.0.100").await;
    store.add_booking("b2", "0.0.200").await;
    store.credit_account("0.0.100", 1_000).await;

    let alerts = Arc::new(CountingAlerts::new());
    let cache = Arc::new(CacheInvalidationCoordinator::new(
        Arc::new(NullCacheBackend),
        InvalidationMode::Immediate,
    ));

    let orchestrator = SwapOrchestrator::new(
        store.clone() as Arc<dyn TransactionalStore>,
        Arc::new(ledger),
        alerts.clone(),
        cache,
        test_config(),
    );

    Harness {
        store,
        alerts,
        orchestrator,
    }
}

fn request(swap_id: &str) -> SwapExecutionRequest {
    SwapExecutionRequest {
        swap_id: swap_id.to_string(),
        source_booking_id: "b1".to_string(),
        target_booking_id: "b2".to_string(),
        proposer_account_id: "0.0.100".to_string(),
        acceptor_account_id: "0.0.200".to_string(),
        additional_payment: None,
        expiration_time: Utc::now() + ChronoDuration::hours(1),
    }
}

async fn owner(store: &InMemoryStore, booking_id: &str) -> String {
    store
        .get_booking(booking_id)
        .await
        .unwrap()
        .unwrap()
        .owner_account_id
}

async fn locked(store: &InMemoryStore, booking_id: &str) -> bool {
    store.get_booking(booking_id).await.unwrap().unwrap().locked
}

async fn wait_for_step(orchestrator: &SwapOrchestrator, swap_id: &str, step: SwapStep) {
    for _ in 0..500 {
        if let Some(execution) = orchestrator.get_swap_execution_status(swap_id) {
            if execution.current_step == step {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("swap {swap_id} never reached {step}");
}

#[tokio::test]
async fn test_happy_path_swaps_owners_and_charges_payment() {
    let h = harness(ScriptedLedger::ok()).await;
    let mut req = request("s1");
    req.additional_payment = Some(300);

    let result = h.orchestrator.execute_atomic_swap(req).await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert!(result.transaction_id.is_some());
    assert!(result.consensus_timestamp.is_some());
    assert!(result.rollback_transaction_id.is_none());

    // Ownership exchanged, locks released
    assert_eq!(owner(&h.store, "b1").await, "0.0.200");
    assert_eq!(owner(&h.store, "b2").await, "0.0.100");
    assert!(!locked(&h.store, "b1").await);
    assert!(!locked(&h.store, "b2").await);

    // Payment plus the 100 fee charged and kept
    assert_eq!(h.store.account_balance("0.0.100").await.unwrap(), 600);

    let execution = h.orchestrator.get_swap_execution_status("s1").unwrap();
    assert_eq!(execution.current_step, SwapStep::Completed);
    // propose, accept, execute
    assert_eq!(execution.transaction_ids.len(), 3);
    assert!(h.alerts.kinds.lock().await.is_empty());
}

#[tokio::test]
async fn test_locked_target_rejected_without_mutation() {
    let h = harness(ScriptedLedger::ok()).await;
    h.store.lock_booking("b2", "other-swap").await.unwrap();

    let result = h.orchestrator.execute_atomic_swap(request("s1")).await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("booking locked"));
    assert!(result.rollback_transaction_id.is_none());

    // Nothing changed: owners intact, source never locked
    assert_eq!(owner(&h.store, "b1").await, "0.0.100");
    assert_eq!(owner(&h.store, "b2").await, "0.0.200");
    assert!(!locked(&h.store, "b1").await);

    let execution = h.orchestrator.get_swap_execution_status("s1").unwrap();
    assert_eq!(execution.current_step, SwapStep::Cancelled);
}

#[tokio::test]
async fn test_execute_failure_rolls_back_and_refunds() {
    let h = harness(ScriptedLedger::failing_execute(SwapError::Timeout {
        operation: "execute_swap".to_string(),
    }))
    .await;
    let mut req = request("s1");
    req.additional_payment = Some(300);

    let result = h.orchestrator.execute_atomic_swap(req).await;

    assert!(!result.success);
    assert!(result.rollback_transaction_id.is_some());

    // Everything undone
    assert_eq!(owner(&h.store, "b1").await, "0.0.100");
    assert_eq!(owner(&h.store, "b2").await, "0.0.200");
    assert!(!locked(&h.store, "b1").await);
    assert!(!locked(&h.store, "b2").await);
    assert_eq!(h.store.account_balance("0.0.100").await.unwrap(), 1_000);

    let proposal = h
        .store
        .find_open_proposal("b1", "b2", "0.0.100")
        .await
        .unwrap();
    assert!(proposal.is_none(), "proposal should be cancelled, not open");

    let execution = h.orchestrator.get_swap_execution_status("s1").unwrap();
    assert_eq!(execution.current_step, SwapStep::RolledBack);
    assert!(execution.rollback_required);
}

#[tokio::test]
async fn test_rollback_exhaustion_flags_stuck_and_alerts_once() {
    let ledger = ScriptedLedger {
        execute_error: Some(SwapError::Network {
            message: "ledger unreachable".to_string(),
        }),
        cancel_error: Some(SwapError::Network {
            message: "ledger unreachable".to_string(),
        }),
        ..ScriptedLedger::ok()
    };
    let h = harness(ledger).await;

    let result = h.orchestrator.execute_atomic_swap(request("s1")).await;

    assert!(!result.success);
    assert!(result.rollback_transaction_id.is_none());

    let execution = h.orchestrator.get_swap_execution_status("s1").unwrap();
    assert!(execution.stuck);
    assert_eq!(execution.current_step, SwapStep::RollingBack);

    let kinds = h.alerts.kinds.lock().await;
    assert_eq!(kinds.as_slice(), &[ErrorKind::RollbackError]);
}

#[tokio::test]
async fn test_verify_rejection_triggers_full_rollback() {
    let h = harness(ScriptedLedger::failing_verify(SwapError::LedgerRejected {
        operation: "verify_swap".to_string(),
        message: "execution not finalized".to_string(),
    }))
    .await;

    let result = h.orchestrator.execute_atomic_swap(request("s1")).await;

    assert!(!result.success);
    assert!(result.rollback_transaction_id.is_some());

    // Ownership was never mirrored: the store only reflects verified swaps
    assert_eq!(owner(&h.store, "b1").await, "0.0.100");
    assert_eq!(owner(&h.store, "b2").await, "0.0.200");
    assert!(!locked(&h.store, "b1").await);
    assert!(!locked(&h.store, "b2").await);

    let execution = h.orchestrator.get_swap_execution_status("s1").unwrap();
    assert_eq!(execution.current_step, SwapStep::RolledBack);
}

#[tokio::test]
async fn test_verify_transient_exhaustion_leaves_swap_stuck() {
    let h = harness(ScriptedLedger::failing_verify(SwapError::Network {
        message: "mirror node unreachable".to_string(),
    }))
    .await;

    let result = h.orchestrator.execute_atomic_swap(request("s1")).await;

    assert!(!result.success);
    // The execution may have finalized on the ledger: no rollback
    assert!(result.rollback_transaction_id.is_none());

    let execution = h.orchestrator.get_swap_execution_status("s1").unwrap();
    assert!(execution.stuck);
    assert!(!execution.rollback_required);

    // Locks are held for manual resolution
    assert!(locked(&h.store, "b1").await);
    assert!(locked(&h.store, "b2").await);
    assert_eq!(owner(&h.store, "b1").await, "0.0.100");

    let kinds = h.alerts.kinds.lock().await;
    assert_eq!(kinds.as_slice(), &[ErrorKind::DataIntegrityError]);
}

#[tokio::test]
async fn test_proposal_reuse_is_idempotent() {
    let h = harness(ScriptedLedger::ok()).await;
    let req = request("s1");

    let first = h.orchestrator.ensure_swap_proposal(&req).await.unwrap();
    let second = h.orchestrator.ensure_swap_proposal(&req).await.unwrap();

    assert_eq!(first.proposal_id, second.proposal_id);
    assert_eq!(first.status, ProposalStatus::Proposed);
}

#[tokio::test]
async fn test_duplicate_swap_id_rejected_while_active() {
    let gate = Arc::new(Notify::new());
    let h = Arc::new(harness(ScriptedLedger::with_accept_gate(gate.clone())).await);

    let first = tokio::spawn({
        let h = h.clone();
        async move { h.orchestrator.execute_atomic_swap(request("s1")).await }
    });
    wait_for_step(&h.orchestrator, "s1", SwapStep::Accepting).await;

    // Same swap id while the first is mid-flight
    let duplicate = h.orchestrator.execute_atomic_swap(request("s1")).await;
    assert!(!duplicate.success);

    gate.notify_one();
    let result = first.await.unwrap();
    assert!(result.success);
    assert_eq!(owner(&h.store, "b1").await, "0.0.200");
}

#[tokio::test]
async fn test_cancellation_rolls_back_in_flight_swap() {
    let gate = Arc::new(Notify::new());
    let h = Arc::new(harness(ScriptedLedger::with_accept_gate(gate.clone())).await);

    let driver = tokio::spawn({
        let h = h.clone();
        async move { h.orchestrator.execute_atomic_swap(request("s1")).await }
    });
    wait_for_step(&h.orchestrator, "s1", SwapStep::Accepting).await;

    let cancelled = h.orchestrator.cancel_swap_execution("s1").await;
    assert!(cancelled);

    gate.notify_one();
    let result = driver.await.unwrap();
    assert!(!result.success);

    // Compensation released everything; no ownership change
    assert!(!locked(&h.store, "b1").await);
    assert!(!locked(&h.store, "b2").await);
    assert_eq!(owner(&h.store, "b1").await, "0.0.100");

    let execution = h.orchestrator.get_swap_execution_status("s1").unwrap();
    assert_eq!(execution.current_step, SwapStep::RolledBack);

    // Cancelling a settled execution reports failure
    assert!(!h.orchestrator.cancel_swap_execution("s1").await);
}

#[tokio::test]
async fn test_concurrent_swaps_for_same_booking_one_wins() {
    let gate = Arc::new(Notify::new());
    let h = Arc::new(harness(ScriptedLedger::with_accept_gate(gate.clone())).await);
    h.store.add_booking("b3", "0.0.300").await;
    h.store.credit_account("0.0.300", 1_000).await;

    // First swap holds the b2 lock while blocked at the accept step
    let first = tokio::spawn({
        let h = h.clone();
        async move { h.orchestrator.execute_atomic_swap(request("s1")).await }
    });
    wait_for_step(&h.orchestrator, "s1", SwapStep::Accepting).await;

    let mut competing = request("s2");
    competing.source_booking_id = "b3".to_string();
    competing.proposer_account_id = "0.0.300".to_string();

    let second = h.orchestrator.execute_atomic_swap(competing).await;
    assert!(!second.success);
    assert_eq!(second.error.as_deref(), Some("booking locked"));
    // The loser's own booking was never touched
    assert!(!locked(&h.store, "b3").await);
    assert_eq!(owner(&h.store, "b3").await, "0.0.300");

    gate.notify_one();
    let first = first.await.unwrap();
    assert!(first.success);
    assert_eq!(owner(&h.store, "b2").await, "0.0.100");
    assert!(!locked(&h.store, "b1").await);
    assert!(!locked(&h.store, "b2").await);
}

#[tokio::test]
async fn test_settled_executions_are_cleaned_up() {
    let h = harness(ScriptedLedger::ok()).await;

    let result = h.orchestrator.execute_atomic_swap(request("s1")).await;
    assert!(result.success);
    assert!(h.orchestrator.get_swap_execution_status("s1").is_some());

    let removed = h.orchestrator.cleanup_expired_executions(0);
    assert_eq!(removed, 1);
    assert!(h.orchestrator.get_swap_execution_status("s1").is_none());
    assert!(h.orchestrator.get_active_swaps().is_empty());
}
