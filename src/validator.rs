//! Precondition validation
//!
//! Pure function of the request and a snapshot of booking, balance, and
//! proposal state. Checks run in a fixed order and stop at the first failing
//! stage; nothing here mutates state.

use crate::orchestrator::SwapExecutionRequest;
use crate::store::{Booking, SwapProposal};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Rules a request can violate, in check order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValidationRule {
    SourceBookingMissing,
    TargetBookingMissing,
    SourceOwnershipMismatch,
    TargetOwnershipMismatch,
    SourceBookingLocked,
    TargetBookingLocked,
    ExpirationInPast,
    NegativePayment,
    InsufficientBalance,
    StaleProposalState,
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationRule::SourceBookingMissing => "source_booking_missing",
            ValidationRule::TargetBookingMissing => "target_booking_missing",
            ValidationRule::SourceOwnershipMismatch => "source_ownership_mismatch",
            ValidationRule::TargetOwnershipMismatch => "target_ownership_mismatch",
            ValidationRule::SourceBookingLocked => "source_booking_locked",
            ValidationRule::TargetBookingLocked => "target_booking_locked",
            ValidationRule::ExpirationInPast => "expiration_in_past",
            ValidationRule::NegativePayment => "negative_payment",
            ValidationRule::InsufficientBalance => "insufficient_balance",
            ValidationRule::StaleProposalState => "stale_proposal_state",
        };
        f.write_str(name)
    }
}

impl ValidationRule {
    /// Ownership mismatches are permission problems, not plain validation
    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            ValidationRule::SourceOwnershipMismatch | ValidationRule::TargetOwnershipMismatch
        )
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(
            self,
            ValidationRule::SourceBookingLocked | ValidationRule::TargetBookingLocked
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleViolation {
    pub rule: ValidationRule,
    pub message: String,
}

/// Result of precondition validation
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub violations: Vec<RuleViolation>,
}

impl ValidationOutcome {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn first(&self) -> Option<&RuleViolation> {
        self.violations.first()
    }
}

/// Read-only state gathered before validation
#[derive(Debug, Clone)]
pub struct ValidationSnapshot {
    pub source_booking: Option<Booking>,
    pub target_booking: Option<Booking>,
    pub proposer_balance: i64,
    pub existing_proposal: Option<SwapProposal>,
    pub now: DateTime<Utc>,
}

/// Validate a swap request against a state snapshot
///
/// Stages, stopping at the first failure:
/// 1. both bookings exist and are owned by the claimed accounts
/// 2. neither booking is locked by another active swap
/// 3. expiration time is strictly in the future
/// 4. proposer balance covers additional payment plus the platform fee
/// 5. any prior proposal for the pair is consistent with a fresh attempt
pub fn validate(
    request: &SwapExecutionRequest,
    snapshot: &ValidationSnapshot,
    platform_fee: i64,
) -> ValidationOutcome {
    let stages: [fn(&SwapExecutionRequest, &ValidationSnapshot, i64) -> Vec<RuleViolation>; 5] = [
        check_existence_and_ownership,
        check_lock_state,
        check_expiration,
        check_balance,
        check_proposal_state,
    ];

    for stage in stages {
        let violations = stage(request, snapshot, platform_fee);
        if !violations.is_empty() {
            return ValidationOutcome { violations };
        }
    }

    ValidationOutcome { violations: vec![] }
}

fn check_existence_and_ownership(
    request: &SwapExecutionRequest,
    snapshot: &ValidationSnapshot,
    _fee: i64,
) -> Vec<RuleViolation> {
    let mut violations = Vec::new();

    match &snapshot.source_booking {
        None => violations.push(RuleViolation {
            rule: ValidationRule::SourceBookingMissing,
            message: format!("booking {} does not exist", request.source_booking_id),
        }),
        Some(b) if b.owner_account_id != request.proposer_account_id => {
            violations.push(RuleViolation {
                rule: ValidationRule::SourceOwnershipMismatch,
                message: format!(
                    "booking {} is not owned by {}",
                    request.source_booking_id, request.proposer_account_id
                ),
            })
        }
        Some(_) => {}
    }

    match &snapshot.target_booking {
        None => violations.push(RuleViolation {
            rule: ValidationRule::TargetBookingMissing,
            message: format!("booking {} does not exist", request.target_booking_id),
        }),
        Some(b) if b.owner_account_id != request.acceptor_account_id => {
            violations.push(RuleViolation {
                rule: ValidationRule::TargetOwnershipMismatch,
                message: format!(
                    "booking {} is not owned by {}",
                    request.target_booking_id, request.acceptor_account_id
                ),
            })
        }
        Some(_) => {}
    }

    violations
}

fn check_lock_state(
    request: &SwapExecutionRequest,
    snapshot: &ValidationSnapshot,
    _fee: i64,
) -> Vec<RuleViolation> {
    let mut violations = Vec::new();

    let locked_by_other = |booking: &Booking| {
        booking.locked && booking.locked_by.as_deref() != Some(request.swap_id.as_str())
    };

    if let Some(b) = &snapshot.source_booking {
        if locked_by_other(b) {
            violations.push(RuleViolation {
                rule: ValidationRule::SourceBookingLocked,
                message: "booking locked".to_string(),
            });
        }
    }
    if let Some(b) = &snapshot.target_booking {
        if locked_by_other(b) {
            violations.push(RuleViolation {
                rule: ValidationRule::TargetBookingLocked,
                message: "booking locked".to_string(),
            });
        }
    }

    violations
}

fn check_expiration(
    request: &SwapExecutionRequest,
    snapshot: &ValidationSnapshot,
    _fee: i64,
) -> Vec<RuleViolation> {
    if request.expiration_time <= snapshot.now {
        return vec![RuleViolation {
            rule: ValidationRule::ExpirationInPast,
            message: "expiration time must be in the future".to_string(),
        }];
    }
    vec![]
}

fn check_balance(
    request: &SwapExecutionRequest,
    snapshot: &ValidationSnapshot,
    platform_fee: i64,
) -> Vec<RuleViolation> {
    let payment = request.additional_payment.unwrap_or(0);
    if payment < 0 {
        return vec![RuleViolation {
            rule: ValidationRule::NegativePayment,
            message: "additional payment must not be negative".to_string(),
        }];
    }

    let required = payment + platform_fee;
    if snapshot.proposer_balance < required {
        return vec![RuleViolation {
            rule: ValidationRule::InsufficientBalance,
            message: format!(
                "account {} balance {} does not cover {}",
                request.proposer_account_id, snapshot.proposer_balance, required
            ),
        }];
    }
    vec![]
}

fn check_proposal_state(
    request: &SwapExecutionRequest,
    snapshot: &ValidationSnapshot,
    _fee: i64,
) -> Vec<RuleViolation> {
    if let Some(proposal) = &snapshot.existing_proposal {
        // An open proposal is only reusable when it describes the same swap
        let consistent = proposal.acceptor_account_id == request.acceptor_account_id
            && proposal.additional_payment == request.additional_payment;
        if !consistent {
            return vec![RuleViolation {
                rule: ValidationRule::StaleProposalState,
                message: format!(
                    "existing proposal {} conflicts with this request",
                    proposal.proposal_id
                ),
            }];
        }
    }
    vec![]
}
