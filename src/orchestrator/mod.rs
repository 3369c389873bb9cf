//! Atomic-swap orchestration
//!
//! Drives the forward saga (validate, propose, accept, execute, verify) for
//! each swap request, persisting ledger transaction ids into the execution
//! context after every step, and hands partially completed executions to the
//! compensation manager on failure. Many swaps run concurrently; mutual
//! exclusion is per booking via the store's check-and-set lock.

pub mod execution;

pub use execution::{ExecutionRegistry, SwapExecution, SwapStep};

use crate::alerts::AlertDispatcher;
use crate::cache::{CacheInvalidationCoordinator, DomainEvent};
use crate::classify::ErrorClassifier;
use crate::compensation::{CompensationManager, RollbackContext};
use crate::config::EngineConfig;
use crate::error::{EngineResult, SwapError};
use crate::ledger::{LedgerGateway, LedgerReceipt, SwapParams};
use crate::metrics;
use crate::store::{PaymentRecord, ProposalStatus, SwapProposal, TransactionalStore};
use crate::validator::{self, ValidationSnapshot};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Client request to exchange ownership of two bookings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapExecutionRequest {
    pub swap_id: String,
    pub source_booking_id: String,
    pub target_booking_id: String,
    pub proposer_account_id: String,
    pub acceptor_account_id: String,
    /// Minor currency units; must not be negative
    pub additional_payment: Option<i64>,
    pub expiration_time: DateTime<Utc>,
}

/// Outcome returned for every swap execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapExecutionResult {
    pub success: bool,
    pub swap_id: String,
    pub transaction_id: Option<String>,
    pub consensus_timestamp: Option<String>,
    pub error: Option<String>,
    pub rollback_transaction_id: Option<String>,
}

impl SwapExecutionResult {
    fn completed(swap_id: &str, receipt: &LedgerReceipt) -> Self {
        Self {
            success: true,
            swap_id: swap_id.to_string(),
            transaction_id: Some(receipt.transaction_id.clone()),
            consensus_timestamp: Some(receipt.consensus_timestamp.clone()),
            error: None,
            rollback_transaction_id: None,
        }
    }

    fn failed(swap_id: &str, error: String, rollback_transaction_id: Option<String>) -> Self {
        Self {
            success: false,
            swap_id: swap_id.to_string(),
            transaction_id: None,
            consensus_timestamp: None,
            error: Some(error),
            rollback_transaction_id,
        }
    }
}

/// Ledger operations issued through the retry wrapper
enum LedgerCall<'a> {
    Propose(&'a SwapParams),
    Accept(&'a str),
    Execute(&'a str),
}

impl LedgerCall<'_> {
    fn operation(&self) -> &'static str {
        match self {
            LedgerCall::Propose(_) => "propose_swap",
            LedgerCall::Accept(_) => "accept_swap",
            LedgerCall::Execute(_) => "execute_swap",
        }
    }
}

/// Orchestrates atomic booking swaps across the ledger and the store
pub struct SwapOrchestrator {
    store: Arc<dyn TransactionalStore>,
    ledger: Arc<dyn LedgerGateway>,
    alerts: Arc<dyn AlertDispatcher>,
    classifier: Arc<ErrorClassifier>,
    compensation: CompensationManager,
    cache: Arc<CacheInvalidationCoordinator>,
    registry: Arc<ExecutionRegistry>,
    /// Rollback inputs per in-flight swap, kept current as steps complete
    contexts: DashMap<String, RollbackContext>,
    config: EngineConfig,
}

impl SwapOrchestrator {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        ledger: Arc<dyn LedgerGateway>,
        alerts: Arc<dyn AlertDispatcher>,
        cache: Arc<CacheInvalidationCoordinator>,
        config: EngineConfig,
    ) -> Self {
        let classifier = Arc::new(ErrorClassifier::new());
        let compensation = CompensationManager::new(
            store.clone(),
            ledger.clone(),
            alerts.clone(),
            classifier.clone(),
            config.rollback_max_attempts,
            config.rollback_backoff_ms,
        );

        Self {
            store,
            ledger,
            alerts,
            classifier,
            compensation,
            cache,
            registry: Arc::new(ExecutionRegistry::new()),
            contexts: DashMap::new(),
            config,
        }
    }

    /// Execute a two-party booking swap end to end
    ///
    /// Validation failures return without mutating anything. Once the
    /// proposing step begins, any failure triggers compensation; the result
    /// then carries the rollback transaction id.
    pub async fn execute_atomic_swap(&self, request: SwapExecutionRequest) -> SwapExecutionResult {
        metrics::record_swap_started();

        if let Err(err) = self.registry.insert_new(&request.swap_id) {
            let classified = self.classifier.classify(&err, &request.swap_id);
            warn!(swap_id = %request.swap_id, "duplicate swap execution rejected");
            return SwapExecutionResult::failed(&request.swap_id, classified.user_message, None);
        }
        metrics::record_active_swaps(self.registry.active().len());

        self.contexts.insert(
            request.swap_id.clone(),
            RollbackContext {
                swap_id: request.swap_id.clone(),
                proposal_id: None,
                source_booking_id: request.source_booking_id.clone(),
                target_booking_id: request.target_booking_id.clone(),
                locked_source: false,
                locked_target: false,
                payment_id: None,
            },
        );

        let result = self.drive(&request).await;
        self.classifier.clear(&request.swap_id);
        metrics::record_active_swaps(self.registry.active().len());
        result
    }

    async fn drive(&self, request: &SwapExecutionRequest) -> SwapExecutionResult {
        let swap_id = request.swap_id.as_str();

        // --- VALIDATING: read-only, no mutation on failure ---------------
        let snapshot = match self.gather_snapshot(request).await {
            Ok(snapshot) => snapshot,
            Err(err) => return self.reject(request, err).await,
        };

        let outcome = validator::validate(request, &snapshot, self.config.platform_fee);
        if let Some(violation) = outcome.first() {
            for violation in &outcome.violations {
                metrics::record_validation_failure(&violation.rule.to_string());
            }
            let err = if violation.rule.is_permission() {
                SwapError::Permission {
                    account_id: request.proposer_account_id.clone(),
                    message: violation.message.clone(),
                }
            } else if violation.rule.is_lock_conflict() {
                SwapError::AlreadyLocked {
                    booking_id: request.target_booking_id.clone(),
                }
            } else {
                SwapError::Validation {
                    rule: violation.rule.to_string(),
                    message: violation.message.clone(),
                }
            };
            return self.reject(request, err).await;
        }

        // --- PROPOSING ----------------------------------------------------
        if let Some(result) = self.check_cancelled(swap_id) {
            return result;
        }
        if let Err(err) = self.registry.advance(swap_id, SwapStep::Proposing) {
            return self.reject(request, err).await;
        }

        if let Err(err) = self.store.lock_booking(&request.source_booking_id, swap_id).await {
            return self.abort(request, err).await;
        }
        self.update_context(swap_id, |ctx| ctx.locked_source = true);

        if let Err(err) = self.store.lock_booking(&request.target_booking_id, swap_id).await {
            return self.abort(request, err).await;
        }
        self.update_context(swap_id, |ctx| ctx.locked_target = true);

        let proposal = match self.ensure_swap_proposal(request).await {
            Ok(proposal) => proposal,
            Err(err) => return self.abort(request, err).await,
        };
        self.update_context(swap_id, |ctx| {
            ctx.proposal_id = Some(proposal.proposal_id.clone())
        });

        let params = SwapParams {
            proposal_id: proposal.proposal_id.clone(),
            source_booking_id: request.source_booking_id.clone(),
            target_booking_id: request.target_booking_id.clone(),
            proposer_account_id: request.proposer_account_id.clone(),
            acceptor_account_id: request.acceptor_account_id.clone(),
            additional_payment: request.additional_payment,
            expiration_time: request.expiration_time,
        };

        match self.call_ledger(LedgerCall::Propose(&params)).await {
            Ok(receipt) => {
                let _ = self.registry.record_transaction(swap_id, &receipt.transaction_id);
            }
            Err(err) => return self.abort(request, err).await,
        }

        // --- ACCEPTING ----------------------------------------------------
        if let Some(result) = self.check_cancelled(swap_id) {
            return result;
        }
        if let Err(err) = self.registry.advance(swap_id, SwapStep::Accepting) {
            return self.abort(request, err).await;
        }

        match self.call_ledger(LedgerCall::Accept(&proposal.proposal_id)).await {
            Ok(receipt) => {
                let _ = self.registry.record_transaction(swap_id, &receipt.transaction_id);
            }
            Err(err) => return self.abort(request, err).await,
        }
        if let Some(result) = self.check_cancelled(swap_id) {
            return result;
        }
        if let Err(err) = self
            .store
            .set_proposal_status(&proposal.proposal_id, ProposalStatus::Locked)
            .await
        {
            return self.abort(request, err).await;
        }

        // --- EXECUTING ----------------------------------------------------
        if let Some(result) = self.check_cancelled(swap_id) {
            return result;
        }
        if let Err(err) = self.registry.advance(swap_id, SwapStep::Executing) {
            return self.abort(request, err).await;
        }

        let payment_due = request.additional_payment.unwrap_or(0);
        if payment_due > 0 {
            let payment = PaymentRecord {
                payment_id: Uuid::new_v4().to_string(),
                proposal_id: proposal.proposal_id.clone(),
                payer_account_id: request.proposer_account_id.clone(),
                amount: payment_due + self.config.platform_fee,
                refunded: false,
            };
            if let Err(err) = self.store.record_payment(&payment).await {
                return self.abort(request, err).await;
            }
            self.update_context(swap_id, |ctx| {
                ctx.payment_id = Some(payment.payment_id.clone())
            });
        }

        let execute_receipt = match self.call_ledger(LedgerCall::Execute(&proposal.proposal_id)).await
        {
            Ok(receipt) => {
                let _ = self.registry.record_transaction(swap_id, &receipt.transaction_id);
                receipt
            }
            Err(err) => return self.abort(request, err).await,
        };

        // --- VERIFYING ----------------------------------------------------
        if let Err(err) = self.registry.advance(swap_id, SwapStep::Verifying) {
            return self.abort(request, err).await;
        }

        match self.verify_with_backoff(&proposal.proposal_id).await {
            Ok(_) => {}
            Err(err @ SwapError::LedgerRejected { .. }) => {
                // The ledger positively reports non-finalization: safe to undo
                return self.abort(request, err).await;
            }
            Err(err) => {
                // Transient failures exhausted: the execution may have
                // finalized, so rolling back could undo a completed swap.
                // Flag for manual resolution instead.
                return self.mark_unconfirmed(request, err).await;
            }
        }

        // --- COMPLETED: mirror finalized state into the store -------------
        if let Err(err) = self
            .finalize(request, &proposal.proposal_id)
            .await
        {
            return self.mark_unconfirmed(request, err).await;
        }

        if let Err(err) = self.registry.advance(swap_id, SwapStep::Completed) {
            error!(swap_id, error = %err, "failed to record completion");
        }
        self.contexts.remove(swap_id);
        metrics::record_swap_completed();
        info!(
            swap_id,
            transaction_id = %execute_receipt.transaction_id,
            "swap completed"
        );

        self.publish_swap_events(request, true).await;
        SwapExecutionResult::completed(swap_id, &execute_receipt)
    }

    /// Mirror the finalized ownership transfer and release both locks
    async fn finalize(&self, request: &SwapExecutionRequest, proposal_id: &str) -> EngineResult<()> {
        self.store
            .swap_booking_owners(&request.source_booking_id, &request.target_booking_id)
            .await?;
        self.store
            .set_proposal_status(proposal_id, ProposalStatus::Executed)
            .await?;
        self.store.unlock_booking(&request.source_booking_id).await?;
        self.store.unlock_booking(&request.target_booking_id).await?;
        Ok(())
    }

    /// Reuse an open proposal for this triple or create a fresh one
    ///
    /// The idempotency guard against retried or duplicate client requests:
    /// two calls with identical (source, target, proposer) yield the same
    /// proposal id and never create two ledger-side proposals.
    pub async fn ensure_swap_proposal(
        &self,
        request: &SwapExecutionRequest,
    ) -> EngineResult<SwapProposal> {
        if let Some(existing) = self
            .store
            .find_open_proposal(
                &request.source_booking_id,
                &request.target_booking_id,
                &request.proposer_account_id,
            )
            .await?
        {
            debug!(
                swap_id = %request.swap_id,
                proposal_id = %existing.proposal_id,
                "reusing open proposal"
            );
            return Ok(existing);
        }

        let proposal = SwapProposal {
            proposal_id: Uuid::new_v4().to_string(),
            source_booking_id: request.source_booking_id.clone(),
            target_booking_id: request.target_booking_id.clone(),
            proposer_account_id: request.proposer_account_id.clone(),
            acceptor_account_id: request.acceptor_account_id.clone(),
            additional_payment: request.additional_payment,
            expiration_time: request.expiration_time,
            status: ProposalStatus::Proposed,
            created_at: Utc::now(),
        };
        self.store.upsert_proposal(&proposal).await?;

        self.cache
            .publish(DomainEvent::ProposalCreated {
                proposal_id: proposal.proposal_id.clone(),
                proposer_account_id: request.proposer_account_id.clone(),
                acceptor_account_id: request.acceptor_account_id.clone(),
            })
            .await;

        Ok(proposal)
    }

    /// Read-only snapshot of all non-terminal executions
    pub fn get_active_swaps(&self) -> Vec<SwapExecution> {
        self.registry.active()
    }

    /// Current execution context for a swap, if tracked
    pub fn get_swap_execution_status(&self, swap_id: &str) -> Option<SwapExecution> {
        self.registry.get(swap_id)
    }

    /// Cancel a non-terminal execution and roll back what completed so far
    ///
    /// Cooperative: an in-flight ledger call is not aborted, but the forward
    /// driver stops at the next step boundary. Compensation steps are
    /// idempotent, so overlap between this path and the driver is safe.
    pub async fn cancel_swap_execution(&self, swap_id: &str) -> bool {
        let Some(execution) = self.registry.get(swap_id) else {
            return false;
        };
        if execution.current_step.is_terminal() {
            return false;
        }

        info!(swap_id, step = %execution.current_step, "cancelling swap execution");
        let _ = self.registry.request_cancel(swap_id);
        let _ = self.registry.require_rollback(swap_id);
        let _ = self.registry.advance(swap_id, SwapStep::RollingBack);

        let ctx = match self.contexts.get(swap_id) {
            Some(ctx) => ctx.clone(),
            None => return false,
        };

        match self.compensation.rollback(&ctx).await {
            Ok(_) => {
                let _ = self.registry.advance(swap_id, SwapStep::RolledBack);
                self.contexts.remove(swap_id);
                metrics::record_swap_rolled_back();
                true
            }
            Err(err) => {
                let classified = self.classifier.classify(&err, swap_id);
                let _ = self.registry.set_error(swap_id, classified);
                let _ = self.registry.mark_stuck(swap_id);
                metrics::record_swap_stuck();
                false
            }
        }
    }

    /// Remove settled executions older than `max_age_ms`; returns the count
    pub fn cleanup_expired_executions(&self, max_age_ms: u64) -> usize {
        let removed = self
            .registry
            .cleanup(ChronoDuration::milliseconds(max_age_ms as i64));

        // Drop rollback contexts for executions that no longer exist
        self.contexts
            .retain(|swap_id, _| self.registry.get(swap_id).is_some());

        if removed > 0 {
            metrics::record_executions_cleaned(removed);
            info!(removed, "cleaned up settled swap executions");
        }
        removed
    }

    // --- failure paths ----------------------------------------------------

    /// Validation-stage rejection: nothing was mutated
    async fn reject(&self, request: &SwapExecutionRequest, err: SwapError) -> SwapExecutionResult {
        let swap_id = request.swap_id.as_str();
        let classified = self.classifier.classify(&err, swap_id);
        warn!(
            swap_id,
            kind = %classified.kind,
            error = %err,
            "swap rejected during validation"
        );

        let _ = self.registry.set_error(swap_id, classified.clone());
        let _ = self.registry.advance(swap_id, SwapStep::Cancelled);
        self.contexts.remove(swap_id);

        SwapExecutionResult::failed(swap_id, classified.user_message, None)
    }

    /// Post-proposing failure: compensate everything that completed
    async fn abort(&self, request: &SwapExecutionRequest, err: SwapError) -> SwapExecutionResult {
        let swap_id = request.swap_id.as_str();
        let step = self
            .registry
            .get(swap_id)
            .map(|e| e.current_step.to_string())
            .unwrap_or_default();
        metrics::record_step_failure(&step);

        let classified = self.classifier.classify(&err, swap_id);
        warn!(
            swap_id,
            step = %step,
            kind = %classified.kind,
            error = %err,
            "swap step failed, rolling back"
        );
        let _ = self.registry.set_error(swap_id, classified.clone());
        let _ = self.registry.require_rollback(swap_id);
        let _ = self.registry.advance(swap_id, SwapStep::RollingBack);

        let ctx = match self.contexts.get(swap_id) {
            Some(ctx) => ctx.clone(),
            None => {
                return SwapExecutionResult::failed(swap_id, classified.user_message, None);
            }
        };

        match self.compensation.rollback(&ctx).await {
            Ok(report) => {
                if let Some(tx) = &report.rollback_transaction_id {
                    let _ = self.registry.record_transaction(swap_id, tx);
                }
                let _ = self.registry.advance(swap_id, SwapStep::RolledBack);
                self.contexts.remove(swap_id);
                metrics::record_swap_rolled_back();
                self.publish_swap_events(request, false).await;

                SwapExecutionResult::failed(
                    swap_id,
                    classified.user_message,
                    report.rollback_transaction_id,
                )
            }
            Err(rollback_err) => {
                // Compensation already classified and alerted
                let rollback_classified = self.classifier.classify(&rollback_err, swap_id);
                let _ = self.registry.set_error(swap_id, rollback_classified.clone());
                let _ = self.registry.mark_stuck(swap_id);
                metrics::record_swap_stuck();

                SwapExecutionResult::failed(swap_id, rollback_classified.user_message, None)
            }
        }
    }

    /// Outcome unknown after ledger-side execution: never roll back, flag
    /// for manual resolution and alert.
    async fn mark_unconfirmed(
        &self,
        request: &SwapExecutionRequest,
        err: SwapError,
    ) -> SwapExecutionResult {
        let swap_id = request.swap_id.as_str();
        let integrity = SwapError::DataIntegrity {
            message: format!("swap {} outcome unconfirmed: {}", swap_id, err),
        };
        let classified = self.classifier.classify(&integrity, swap_id);
        error!(
            swap_id,
            error = %err,
            "swap outcome unconfirmed after execution; manual resolution required"
        );

        let _ = self.registry.set_error(swap_id, classified.clone());
        let _ = self.registry.mark_stuck(swap_id);
        metrics::record_swap_stuck();
        self.alerts.notify_critical(&classified).await;

        SwapExecutionResult::failed(swap_id, classified.user_message, None)
    }

    /// A cancel request stops forward progress; the cancelling caller owns
    /// compensation.
    fn check_cancelled(&self, swap_id: &str) -> Option<SwapExecutionResult> {
        if self.registry.is_cancel_requested(swap_id) {
            info!(swap_id, "cancellation requested, stopping forward progress");
            return Some(SwapExecutionResult::failed(
                swap_id,
                "swap execution cancelled".to_string(),
                None,
            ));
        }
        None
    }

    fn update_context<F: FnOnce(&mut RollbackContext)>(&self, swap_id: &str, f: F) {
        if let Some(mut ctx) = self.contexts.get_mut(swap_id) {
            f(&mut ctx);
        }
    }

    async fn gather_snapshot(
        &self,
        request: &SwapExecutionRequest,
    ) -> EngineResult<ValidationSnapshot> {
        let source_booking = self.store.get_booking(&request.source_booking_id).await?;
        let target_booking = self.store.get_booking(&request.target_booking_id).await?;
        let proposer_balance = self
            .store
            .account_balance(&request.proposer_account_id)
            .await?;
        let existing_proposal = self
            .store
            .find_open_proposal(
                &request.source_booking_id,
                &request.target_booking_id,
                &request.proposer_account_id,
            )
            .await?;

        Ok(ValidationSnapshot {
            source_booking,
            target_booking,
            proposer_balance,
            existing_proposal,
            now: Utc::now(),
        })
    }

    /// Issue a ledger call with a timeout and bounded retry on transient
    /// failures
    async fn call_ledger(&self, call: LedgerCall<'_>) -> EngineResult<LedgerReceipt> {
        let operation = call.operation();
        let step_timeout = Duration::from_millis(self.config.step_timeout_ms);
        let max_attempts = self.config.max_step_retries.max(1);
        let mut last_error = SwapError::Internal(format!("{} never attempted", operation));

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let call_future = async {
                match &call {
                    LedgerCall::Propose(params) => self.ledger.propose_swap(params).await,
                    LedgerCall::Accept(proposal_id) => self.ledger.accept_swap(proposal_id).await,
                    LedgerCall::Execute(proposal_id) => self.ledger.execute_swap(proposal_id).await,
                }
            };

            let outcome = match timeout(step_timeout, call_future).await {
                Ok(result) => result,
                Err(_) => Err(SwapError::Timeout {
                    operation: operation.to_string(),
                }),
            };
            let latency = started.elapsed().as_secs_f64();

            match outcome {
                Ok(receipt) => {
                    metrics::record_ledger_call(operation, "ok", latency);
                    return Ok(receipt);
                }
                Err(err) => {
                    metrics::record_ledger_call(operation, "error", latency);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %err,
                        "retryable ledger call failure"
                    );
                    last_error = err;
                }
            }

            if attempt < max_attempts {
                sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }

        Err(last_error)
    }

    /// Verify finalization with bounded backoff on transient read failures
    async fn verify_with_backoff(&self, proposal_id: &str) -> EngineResult<LedgerReceipt> {
        let step_timeout = Duration::from_millis(self.config.step_timeout_ms);
        let mut attempt = 0u32;

        loop {
            let started = Instant::now();
            let outcome = match timeout(step_timeout, self.ledger.verify_swap(proposal_id)).await {
                Ok(result) => result,
                Err(_) => Err(SwapError::Timeout {
                    operation: "verify_swap".to_string(),
                }),
            };
            let latency = started.elapsed().as_secs_f64();

            match outcome {
                Ok(receipt) => {
                    metrics::record_ledger_call("verify_swap", "ok", latency);
                    return Ok(receipt);
                }
                Err(err) if err.is_retryable() && attempt < self.config.verify_max_retries => {
                    attempt += 1;
                    metrics::record_ledger_call("verify_swap", "error", latency);
                    warn!(
                        proposal_id,
                        attempt,
                        error = %err,
                        "transient verification failure, backing off"
                    );
                    sleep(Duration::from_millis(
                        self.config.verify_backoff_ms * attempt as u64,
                    ))
                    .await;
                }
                Err(err) => {
                    metrics::record_ledger_call("verify_swap", "error", latency);
                    return Err(err);
                }
            }
        }
    }

    /// `swapped` says whether the ownership exchange went through, so the
    /// booking events carry the current owners
    async fn publish_swap_events(&self, request: &SwapExecutionRequest, swapped: bool) {
        let (source_owner, target_owner) = if swapped {
            (&request.acceptor_account_id, &request.proposer_account_id)
        } else {
            (&request.proposer_account_id, &request.acceptor_account_id)
        };

        self.cache
            .publish(DomainEvent::SwapUpdated {
                swap_id: request.swap_id.clone(),
                user_ids: vec![
                    request.proposer_account_id.clone(),
                    request.acceptor_account_id.clone(),
                ],
                related_swap_ids: vec![],
            })
            .await;
        self.cache
            .publish(DomainEvent::BookingUpdated {
                booking_id: request.source_booking_id.clone(),
                owner_account_id: source_owner.clone(),
            })
            .await;
        self.cache
            .publish(DomainEvent::BookingUpdated {
                booking_id: request.target_booking_id.clone(),
                owner_account_id: target_owner.clone(),
            })
            .await;
    }
}
