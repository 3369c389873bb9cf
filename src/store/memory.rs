//! In-memory transactional store
//!
//! Backs local runs and the integration tests. Lock acquisition is a real
//! check-and-set under a single write lock, so two concurrent executions
//! can never both lock the same booking.

use super::{Booking, PaymentRecord, ProposalStatus, SwapProposal, TransactionalStore};
use crate::error::{EngineResult, SwapError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory store state
pub struct InMemoryStore {
    bookings: RwLock<HashMap<String, Booking>>,
    proposals: RwLock<HashMap<String, SwapProposal>>,
    payments: RwLock<HashMap<String, PaymentRecord>>,
    accounts: RwLock<HashMap<String, i64>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            bookings: RwLock::new(HashMap::new()),
            proposals: RwLock::new(HashMap::new()),
            payments: RwLock::new(HashMap::new()),
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a booking owned by `owner_account_id`
    pub async fn add_booking(&self, booking_id: &str, owner_account_id: &str) {
        self.bookings.write().await.insert(
            booking_id.to_string(),
            Booking {
                booking_id: booking_id.to_string(),
                owner_account_id: owner_account_id.to_string(),
                locked: false,
                locked_by: None,
            },
        );
    }

    /// Seed an account balance in minor currency units
    pub async fn credit_account(&self, account_id: &str, amount: i64) {
        let mut accounts = self.accounts.write().await;
        *accounts.entry(account_id.to_string()).or_insert(0) += amount;
    }

    /// Fetch a proposal by id (test/inspection helper)
    pub async fn get_proposal(&self, proposal_id: &str) -> Option<SwapProposal> {
        self.proposals.read().await.get(proposal_id).cloned()
    }

    /// Fetch a payment by id (test/inspection helper)
    pub async fn get_payment(&self, payment_id: &str) -> Option<PaymentRecord> {
        self.payments.read().await.get(payment_id).cloned()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn get_booking(&self, booking_id: &str) -> EngineResult<Option<Booking>> {
        Ok(self.bookings.read().await.get(booking_id).cloned())
    }

    async fn lock_booking(&self, booking_id: &str, swap_id: &str) -> EngineResult<()> {
        let mut bookings = self.bookings.write().await;
        let booking = bookings
            .get_mut(booking_id)
            .ok_or_else(|| SwapError::BookingNotFound {
                booking_id: booking_id.to_string(),
            })?;

        if booking.locked {
            // Re-acquiring our own lock is a no-op, any other holder conflicts
            if booking.locked_by.as_deref() == Some(swap_id) {
                return Ok(());
            }
            return Err(SwapError::AlreadyLocked {
                booking_id: booking_id.to_string(),
            });
        }

        booking.locked = true;
        booking.locked_by = Some(swap_id.to_string());
        debug!(booking_id, swap_id, "booking locked");
        Ok(())
    }

    async fn unlock_booking(&self, booking_id: &str) -> EngineResult<()> {
        let mut bookings = self.bookings.write().await;
        if let Some(booking) = bookings.get_mut(booking_id) {
            booking.locked = false;
            booking.locked_by = None;
            debug!(booking_id, "booking unlocked");
        }
        Ok(())
    }

    async fn swap_booking_owners(
        &self,
        source_booking_id: &str,
        target_booking_id: &str,
    ) -> EngineResult<()> {
        let mut bookings = self.bookings.write().await;

        let source_owner = bookings
            .get(source_booking_id)
            .map(|b| b.owner_account_id.clone())
            .ok_or_else(|| SwapError::BookingNotFound {
                booking_id: source_booking_id.to_string(),
            })?;
        let target_owner = bookings
            .get(target_booking_id)
            .map(|b| b.owner_account_id.clone())
            .ok_or_else(|| SwapError::BookingNotFound {
                booking_id: target_booking_id.to_string(),
            })?;

        if let Some(source) = bookings.get_mut(source_booking_id) {
            source.owner_account_id = target_owner;
        }
        if let Some(target) = bookings.get_mut(target_booking_id) {
            target.owner_account_id = source_owner;
        }
        Ok(())
    }

    async fn find_open_proposal(
        &self,
        source_booking_id: &str,
        target_booking_id: &str,
        proposer_account_id: &str,
    ) -> EngineResult<Option<SwapProposal>> {
        let proposals = self.proposals.read().await;
        Ok(proposals
            .values()
            .find(|p| {
                p.source_booking_id == source_booking_id
                    && p.target_booking_id == target_booking_id
                    && p.proposer_account_id == proposer_account_id
                    && p.status.is_open()
            })
            .cloned())
    }

    async fn upsert_proposal(&self, proposal: &SwapProposal) -> EngineResult<()> {
        self.proposals
            .write()
            .await
            .insert(proposal.proposal_id.clone(), proposal.clone());
        Ok(())
    }

    async fn set_proposal_status(
        &self,
        proposal_id: &str,
        status: ProposalStatus,
    ) -> EngineResult<()> {
        let mut proposals = self.proposals.write().await;
        let proposal = proposals
            .get_mut(proposal_id)
            .ok_or_else(|| SwapError::ProposalNotFound {
                proposal_id: proposal_id.to_string(),
            })?;

        // Executed proposals are immutable
        if proposal.status == ProposalStatus::Executed && status != ProposalStatus::Executed {
            return Err(SwapError::InvalidStateTransition {
                from: "EXECUTED".to_string(),
                to: format!("{:?}", status),
            });
        }

        proposal.status = status;
        Ok(())
    }

    async fn record_payment(&self, payment: &PaymentRecord) -> EngineResult<()> {
        // Referential integrity: payer account and proposal must exist
        {
            let proposals = self.proposals.read().await;
            if !proposals.contains_key(&payment.proposal_id) {
                return Err(SwapError::ConstraintViolation {
                    constraint: "payments_proposal_id_fkey".to_string(),
                    message: format!("proposal {} does not exist", payment.proposal_id),
                });
            }
        }

        // The accounts guard must drop before the payments lock is taken;
        // refund_payment nests accounts inside payments, and holding both
        // here in the other order deadlocks against a concurrent refund.
        {
            let mut accounts = self.accounts.write().await;
            let balance = accounts.get_mut(&payment.payer_account_id).ok_or_else(|| {
                SwapError::ConstraintViolation {
                    constraint: "payments_payer_account_id_fkey".to_string(),
                    message: format!("account {} does not exist", payment.payer_account_id),
                }
            })?;

            if *balance < payment.amount {
                return Err(SwapError::InsufficientBalance {
                    account_id: payment.payer_account_id.clone(),
                    have: *balance,
                    need: payment.amount,
                });
            }
            *balance -= payment.amount;
        }

        self.payments
            .write()
            .await
            .insert(payment.payment_id.clone(), payment.clone());
        Ok(())
    }

    async fn refund_payment(&self, payment_id: &str) -> EngineResult<()> {
        let mut payments = self.payments.write().await;
        let payment = match payments.get_mut(payment_id) {
            Some(p) => p,
            // Never charged: nothing to refund
            None => return Ok(()),
        };
        if payment.refunded {
            return Ok(());
        }

        payment.refunded = true;
        let mut accounts = self.accounts.write().await;
        *accounts.entry(payment.payer_account_id.clone()).or_insert(0) += payment.amount;
        debug!(payment_id, amount = payment.amount, "payment refunded");
        Ok(())
    }

    async fn account_balance(&self, account_id: &str) -> EngineResult<i64> {
        Ok(self
            .accounts
            .read()
            .await
            .get(account_id)
            .copied()
            .unwrap_or(0))
    }

    async fn expire_stale_proposals(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let mut proposals = self.proposals.write().await;
        let mut expired = 0;
        for proposal in proposals.values_mut() {
            if proposal.status.is_open() && proposal.expiration_time <= now {
                proposal.status = ProposalStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}
