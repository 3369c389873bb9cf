//! Error types for the swap engine

use thiserror::Error;

/// Main error type for swap orchestration
#[derive(Error, Debug, Clone)]
pub enum SwapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed: {message}")]
    Validation { rule: String, message: String },

    #[error("Permission denied for account {account_id}: {message}")]
    Permission { account_id: String, message: String },

    #[error("Booking {booking_id} not found")]
    BookingNotFound { booking_id: String },

    #[error("Booking {booking_id} is already locked")]
    AlreadyLocked { booking_id: String },

    #[error("Swap {swap_id} is already in progress")]
    AlreadyInProgress { swap_id: String },

    #[error("Proposal {proposal_id} not found")]
    ProposalNotFound { proposal_id: String },

    #[error("Store constraint violation on {constraint}: {message}")]
    ConstraintViolation { constraint: String, message: String },

    #[error("Insufficient balance for account {account_id}: have {have}, need {need}")]
    InsufficientBalance {
        account_id: String,
        have: i64,
        need: i64,
    },

    #[error("Ledger rejected {operation}: {message}")]
    LedgerRejected { operation: String, message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Rollback failed for swap {swap_id} at step {step}: {message}")]
    Rollback {
        swap_id: String,
        step: String,
        message: String,
    },

    #[error("Data integrity violation: {message}")]
    DataIntegrity { message: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Swap execution {swap_id} not found")]
    ExecutionNotFound { swap_id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Check if error is retryable within a saga step
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::Network { .. } | SwapError::Timeout { .. }
        )
    }

    /// Check if error should trigger a critical alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SwapError::Rollback { .. } | SwapError::DataIntegrity { .. }
        )
    }

    /// Check if error occurred before any state was mutated
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            SwapError::Validation { .. }
                | SwapError::Permission { .. }
                | SwapError::AlreadyInProgress { .. }
                | SwapError::Config(_)
        )
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, SwapError>;
