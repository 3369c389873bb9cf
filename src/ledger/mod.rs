//! Ledger gateway abstraction
//!
//! The external ledger provides transactional finality for ownership
//! transfer. Wire protocol and signing live behind this trait; the engine
//! only sees receipts or classified failures.

pub mod sandbox;

use crate::error::EngineResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sandbox::SandboxLedger;

/// Parameters for a ledger-side swap proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapParams {
    pub proposal_id: String,
    pub source_booking_id: String,
    pub target_booking_id: String,
    pub proposer_account_id: String,
    pub acceptor_account_id: String,
    pub additional_payment: Option<i64>,
    pub expiration_time: DateTime<Utc>,
}

/// Receipt returned by every successful ledger mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub transaction_id: String,
    pub consensus_timestamp: String,
}

/// Ledger operations consumed by the orchestrator
///
/// All five calls are network operations and may fail with
/// `Network`/`Timeout` (transient, retryable) or `LedgerRejected`
/// (non-retryable). `cancel_swap` is idempotent on the ledger side.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn propose_swap(&self, params: &SwapParams) -> EngineResult<LedgerReceipt>;

    async fn accept_swap(&self, proposal_id: &str) -> EngineResult<LedgerReceipt>;

    async fn execute_swap(&self, proposal_id: &str) -> EngineResult<LedgerReceipt>;

    /// Confirm the executed swap finalized. `LedgerRejected` means the
    /// ledger positively reports the execution did not finalize.
    async fn verify_swap(&self, proposal_id: &str) -> EngineResult<LedgerReceipt>;

    async fn cancel_swap(&self, proposal_id: &str) -> EngineResult<LedgerReceipt>;
}
