//! Transactional store abstraction
//!
//! The relational store is an external collaborator. The engine depends on
//! this trait only; each call is a single atomic unit of work on the store
//! side. The booking lock is the engine's sole mutual-exclusion primitive
//! and must be a genuine check-and-set.

pub mod memory;

use crate::error::EngineResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::InMemoryStore;

/// A reservation-like asset whose ownership can be swapped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: String,
    pub owner_account_id: String,
    pub locked: bool,
    /// Swap execution currently holding the lock, if any
    pub locked_by: Option<String>,
}

/// Proposal lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Proposed,
    Locked,
    Executed,
    Cancelled,
    Expired,
}

impl ProposalStatus {
    /// Open proposals can be reused by a retried swap request
    pub fn is_open(&self) -> bool {
        matches!(self, ProposalStatus::Proposed | ProposalStatus::Locked)
    }
}

/// Durable record of an initiated swap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapProposal {
    pub proposal_id: String,
    pub source_booking_id: String,
    pub target_booking_id: String,
    pub proposer_account_id: String,
    pub acceptor_account_id: String,
    /// Minor currency units; never negative
    pub additional_payment: Option<i64>,
    pub expiration_time: DateTime<Utc>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

/// A charged payment, refundable during compensation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub proposal_id: String,
    pub payer_account_id: String,
    pub amount: i64,
    pub refunded: bool,
}

/// Relational store operations consumed by the engine
///
/// Every method is one atomic unit of work. `unlock_booking` and
/// `refund_payment` are idempotent so compensation can safely repeat them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn get_booking(&self, booking_id: &str) -> EngineResult<Option<Booking>>;

    /// Atomic check-and-set lock. Fails with `AlreadyLocked` when another
    /// execution holds the booking.
    async fn lock_booking(&self, booking_id: &str, swap_id: &str) -> EngineResult<()>;

    /// Idempotent: unlocking an unlocked booking is a no-op success.
    async fn unlock_booking(&self, booking_id: &str) -> EngineResult<()>;

    /// Mirror the ledger-side ownership transfer for both bookings.
    async fn swap_booking_owners(
        &self,
        source_booking_id: &str,
        target_booking_id: &str,
    ) -> EngineResult<()>;

    /// Find an open proposal matching the triple, for idempotent reuse.
    async fn find_open_proposal(
        &self,
        source_booking_id: &str,
        target_booking_id: &str,
        proposer_account_id: &str,
    ) -> EngineResult<Option<SwapProposal>>;

    async fn upsert_proposal(&self, proposal: &SwapProposal) -> EngineResult<()>;

    async fn set_proposal_status(
        &self,
        proposal_id: &str,
        status: ProposalStatus,
    ) -> EngineResult<()>;

    /// Charge a payment. Referential integrity failures surface as
    /// `ConstraintViolation` with the violated constraint's name.
    async fn record_payment(&self, payment: &PaymentRecord) -> EngineResult<()>;

    /// Idempotent: refunding an already-refunded payment is a no-op success.
    async fn refund_payment(&self, payment_id: &str) -> EngineResult<()>;

    async fn account_balance(&self, account_id: &str) -> EngineResult<i64>;

    /// Mark open proposals past their expiration as EXPIRED; returns count.
    async fn expire_stale_proposals(&self, now: DateTime<Utc>) -> EngineResult<u64>;
}
