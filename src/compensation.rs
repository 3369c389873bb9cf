//! Compensation (rollback) protocol
//!
//! Undoes partially completed saga steps in fixed reverse dependency order:
//! cancel proposal, unlock source booking, unlock target booking, refund
//! payment if charged. Every step is idempotent and retried with backoff up
//! to a configured bound; exhausting a step's retries flags the swap stuck,
//! classifies the condition critical, and notifies the alert path exactly
//! once.

use crate::alerts::AlertDispatcher;
use crate::classify::ErrorClassifier;
use crate::error::{EngineResult, SwapError};
use crate::ledger::LedgerGateway;
use crate::metrics;
use crate::store::{ProposalStatus, TransactionalStore};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Compensating actions, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackKind {
    CancelProposal,
    UnlockSourceBooking,
    UnlockTargetBooking,
    RefundPayment,
}

impl fmt::Display for RollbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RollbackKind::CancelProposal => "cancel_proposal",
            RollbackKind::UnlockSourceBooking => "unlock_source_booking",
            RollbackKind::UnlockTargetBooking => "unlock_target_booking",
            RollbackKind::RefundPayment => "refund_payment",
        };
        f.write_str(name)
    }
}

/// One compensating action with its retry bookkeeping
#[derive(Debug, Clone)]
pub struct RollbackStep {
    pub kind: RollbackKind,
    pub idempotency_key: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// What the forward saga actually touched, derived by the orchestrator
#[derive(Debug, Clone)]
pub struct RollbackContext {
    pub swap_id: String,
    pub proposal_id: Option<String>,
    pub source_booking_id: String,
    pub target_booking_id: String,
    /// Which booking locks this execution holds
    pub locked_source: bool,
    pub locked_target: bool,
    pub payment_id: Option<String>,
}

/// Outcome of a completed rollback
#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub steps: Vec<RollbackStep>,
    /// Transaction id of the ledger-side cancellation, if one was issued
    pub rollback_transaction_id: Option<String>,
}

/// Executes the reverse-order rollback protocol
pub struct CompensationManager {
    store: Arc<dyn TransactionalStore>,
    ledger: Arc<dyn LedgerGateway>,
    alerts: Arc<dyn AlertDispatcher>,
    classifier: Arc<ErrorClassifier>,
    max_attempts: u32,
    backoff: Duration,
}

impl CompensationManager {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        ledger: Arc<dyn LedgerGateway>,
        alerts: Arc<dyn AlertDispatcher>,
        classifier: Arc<ErrorClassifier>,
        max_attempts: u32,
        backoff_ms: u64,
    ) -> Self {
        Self {
            store,
            ledger,
            alerts,
            classifier,
            max_attempts,
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    /// Build the compensation plan from the steps that actually completed
    pub fn build_plan(ctx: &RollbackContext) -> Vec<RollbackStep> {
        let mut plan = Vec::new();
        let key = |kind: RollbackKind| format!("{}:{}", ctx.swap_id, kind);

        if ctx.proposal_id.is_some() {
            plan.push(RollbackStep {
                kind: RollbackKind::CancelProposal,
                idempotency_key: key(RollbackKind::CancelProposal),
                attempts: 0,
                last_error: None,
            });
        }
        if ctx.locked_source {
            plan.push(RollbackStep {
                kind: RollbackKind::UnlockSourceBooking,
                idempotency_key: key(RollbackKind::UnlockSourceBooking),
                attempts: 0,
                last_error: None,
            });
        }
        if ctx.locked_target {
            plan.push(RollbackStep {
                kind: RollbackKind::UnlockTargetBooking,
                idempotency_key: key(RollbackKind::UnlockTargetBooking),
                attempts: 0,
                last_error: None,
            });
        }
        if ctx.payment_id.is_some() {
            plan.push(RollbackStep {
                kind: RollbackKind::RefundPayment,
                idempotency_key: key(RollbackKind::RefundPayment),
                attempts: 0,
                last_error: None,
            });
        }
        plan
    }

    /// Run the rollback protocol for a failed execution
    pub async fn rollback(&self, ctx: &RollbackContext) -> EngineResult<RollbackReport> {
        let mut steps = Self::build_plan(ctx);
        let mut rollback_transaction_id = None;

        info!(
            swap_id = %ctx.swap_id,
            step_count = steps.len(),
            "starting compensation"
        );

        for step in steps.iter_mut() {
            match self.run_step_with_retry(ctx, step).await {
                Ok(transaction_id) => {
                    metrics::record_rollback_step(&step.kind.to_string(), "ok");
                    if step.kind == RollbackKind::CancelProposal {
                        rollback_transaction_id = transaction_id;
                    }
                }
                Err(err) => {
                    metrics::record_rollback_step(&step.kind.to_string(), "exhausted");

                    let rollback_err = SwapError::Rollback {
                        swap_id: ctx.swap_id.clone(),
                        step: step.kind.to_string(),
                        message: err.to_string(),
                    };
                    let classified = self.classifier.classify(&rollback_err, &ctx.swap_id);
                    self.alerts.notify_critical(&classified).await;

                    return Err(rollback_err);
                }
            }
        }

        info!(swap_id = %ctx.swap_id, "compensation complete");
        Ok(RollbackReport {
            steps,
            rollback_transaction_id,
        })
    }

    /// Retry one idempotent step up to the configured bound
    async fn run_step_with_retry(
        &self,
        ctx: &RollbackContext,
        step: &mut RollbackStep,
    ) -> EngineResult<Option<String>> {
        let mut last_error = SwapError::Internal("rollback step never attempted".to_string());

        while step.attempts < self.max_attempts {
            step.attempts += 1;

            match self.run_step(ctx, step.kind).await {
                Ok(transaction_id) => return Ok(transaction_id),
                Err(err) => {
                    warn!(
                        swap_id = %ctx.swap_id,
                        kind = %step.kind,
                        attempt = step.attempts,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "rollback step failed"
                    );
                    step.last_error = Some(err.to_string());
                    last_error = err;
                }
            }

            if step.attempts < self.max_attempts {
                sleep(self.backoff * step.attempts).await;
            }
        }

        Err(last_error)
    }

    async fn run_step(
        &self,
        ctx: &RollbackContext,
        kind: RollbackKind,
    ) -> EngineResult<Option<String>> {
        match kind {
            RollbackKind::CancelProposal => {
                let proposal_id = ctx.proposal_id.as_deref().ok_or_else(|| {
                    SwapError::Internal("cancel step without proposal id".to_string())
                })?;
                let receipt = self.ledger.cancel_swap(proposal_id).await?;
                self.store
                    .set_proposal_status(proposal_id, ProposalStatus::Cancelled)
                    .await?;
                Ok(Some(receipt.transaction_id))
            }
            RollbackKind::UnlockSourceBooking => {
                self.store.unlock_booking(&ctx.source_booking_id).await?;
                Ok(None)
            }
            RollbackKind::UnlockTargetBooking => {
                self.store.unlock_booking(&ctx.target_booking_id).await?;
                Ok(None)
            }
            RollbackKind::RefundPayment => {
                let payment_id = ctx.payment_id.as_deref().ok_or_else(|| {
                    SwapError::Internal("refund step without payment id".to_string())
                })?;
                self.store.refund_payment(payment_id).await?;
                Ok(None)
            }
        }
    }
}
