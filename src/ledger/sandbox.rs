//! Deterministic in-process ledger
//!
//! Enforces the same per-proposal state transitions a real ledger contract
//! would (propose -> accept -> execute, cancel from any non-executed state)
//! and issues `account@seconds.nanos` style transaction ids. Used for local
//! runs and integration tests.

use super::{LedgerGateway, LedgerReceipt, SwapParams};
use crate::error::{EngineResult, SwapError};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContractState {
    Proposed,
    Accepted,
    Executed,
    Cancelled,
}

#[derive(Debug, Clone)]
struct ContractRecord {
    state: ContractState,
    executed_receipt: Option<LedgerReceipt>,
}

/// In-process ledger holding per-proposal contract state
pub struct SandboxLedger {
    operator_account_id: String,
    contracts: RwLock<HashMap<String, ContractRecord>>,
    sequence: AtomicU64,
}

impl SandboxLedger {
    pub fn new(operator_account_id: &str) -> Self {
        Self {
            operator_account_id: operator_account_id.to_string(),
            contracts: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    fn next_receipt(&self) -> LedgerReceipt {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let consensus_timestamp = format!("{}.{:09}", now.timestamp(), now.timestamp_subsec_nanos());
        LedgerReceipt {
            transaction_id: format!(
                "{}@{}.{:09}",
                self.operator_account_id,
                now.timestamp(),
                seq
            ),
            consensus_timestamp,
        }
    }

    fn rejected(operation: &str, message: &str) -> SwapError {
        SwapError::LedgerRejected {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl LedgerGateway for SandboxLedger {
    async fn propose_swap(&self, params: &SwapParams) -> EngineResult<LedgerReceipt> {
        let mut contracts = self.contracts.write().await;
        // Re-proposing an open or cancelled proposal is allowed; retried
        // requests replay against a known state. Executed is final.
        if let Some(ContractState::Executed) = contracts.get(&params.proposal_id).map(|c| c.state) {
            return Err(Self::rejected("propose_swap", "proposal already executed"));
        }

        contracts.insert(
            params.proposal_id.clone(),
            ContractRecord {
                state: ContractState::Proposed,
                executed_receipt: None,
            },
        );
        debug!(proposal_id = %params.proposal_id, "ledger proposal created");
        Ok(self.next_receipt())
    }

    async fn accept_swap(&self, proposal_id: &str) -> EngineResult<LedgerReceipt> {
        let mut contracts = self.contracts.write().await;
        let record = contracts
            .get_mut(proposal_id)
            .ok_or_else(|| Self::rejected("accept_swap", "unknown proposal"))?;

        match record.state {
            ContractState::Proposed => {
                record.state = ContractState::Accepted;
                Ok(self.next_receipt())
            }
            // Idempotent on retry
            ContractState::Accepted => Ok(self.next_receipt()),
            ContractState::Executed => Err(Self::rejected("accept_swap", "already executed")),
            ContractState::Cancelled => Err(Self::rejected("accept_swap", "proposal cancelled")),
        }
    }

    async fn execute_swap(&self, proposal_id: &str) -> EngineResult<LedgerReceipt> {
        let mut contracts = self.contracts.write().await;
        let record = contracts
            .get_mut(proposal_id)
            .ok_or_else(|| Self::rejected("execute_swap", "unknown proposal"))?;

        match record.state {
            ContractState::Accepted => {
                let receipt = self.next_receipt();
                record.state = ContractState::Executed;
                record.executed_receipt = Some(receipt.clone());
                debug!(proposal_id, transaction_id = %receipt.transaction_id, "swap executed");
                Ok(receipt)
            }
            // Replayed execute returns the original receipt
            ContractState::Executed => Ok(record
                .executed_receipt
                .clone()
                .unwrap_or_else(|| self.next_receipt())),
            ContractState::Proposed => Err(Self::rejected("execute_swap", "not yet accepted")),
            ContractState::Cancelled => Err(Self::rejected("execute_swap", "proposal cancelled")),
        }
    }

    async fn verify_swap(&self, proposal_id: &str) -> EngineResult<LedgerReceipt> {
        let contracts = self.contracts.read().await;
        let record = contracts
            .get(proposal_id)
            .ok_or_else(|| Self::rejected("verify_swap", "unknown proposal"))?;

        match (&record.state, &record.executed_receipt) {
            (ContractState::Executed, Some(receipt)) => Ok(receipt.clone()),
            _ => Err(Self::rejected("verify_swap", "execution not finalized")),
        }
    }

    async fn cancel_swap(&self, proposal_id: &str) -> EngineResult<LedgerReceipt> {
        let mut contracts = self.contracts.write().await;
        match contracts.get_mut(proposal_id) {
            Some(record) => match record.state {
                ContractState::Executed => {
                    Err(Self::rejected("cancel_swap", "cannot cancel executed swap"))
                }
                _ => {
                    record.state = ContractState::Cancelled;
                    Ok(self.next_receipt())
                }
            },
            // Cancel of an unknown proposal is a no-op success; compensation
            // may replay it.
            None => Ok(self.next_receipt()),
        }
    }
}
