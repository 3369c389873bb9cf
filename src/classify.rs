//! Error classification
//!
//! Maps raw [`SwapError`] failures onto a closed taxonomy of
//! `{kind, severity}` pairs. Raw constraint names and internal detail never
//! cross the public boundary; callers receive `user_message` while the full
//! context goes to structured logs and, for critical kinds, to the alert
//! path.

use crate::error::SwapError;

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;

/// Severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Closed set of error kinds surfaced by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ValidationError,
    PermissionError,
    ForeignKeyViolation,
    NetworkError,
    LedgerRejected,
    RollbackError,
    DataIntegrityError,
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::ForeignKeyViolation => "foreign_key_violation",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::LedgerRejected => "ledger_rejected",
            ErrorKind::RollbackError => "rollback_error",
            ErrorKind::DataIntegrityError => "data_integrity_error",
            ErrorKind::InternalError => "internal_error",
        };
        f.write_str(name)
    }
}

/// A raw failure after classification
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Store constraint that was violated, if any. Log/alert use only.
    pub constraint_name: Option<String>,
    /// Safe to return to the caller.
    pub user_message: String,
    /// Extra context for logs and alerts (swap id, step, attempt counts).
    pub context: serde_json::Value,
}

impl ClassifiedError {
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Number of network failures per operation before severity escalates
const NETWORK_ESCALATION_THRESHOLD: u32 = 3;

/// Maps raw failures to the closed taxonomy
///
/// Keeps per-operation network failure counts so repeated timeouts on the
/// same ledger operation escalate from medium to high.
pub struct ErrorClassifier {
    network_failures: DashMap<(String, String), u32>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            network_failures: DashMap::new(),
        }
    }

    /// Classify a raw error observed while driving swap `swap_id`
    pub fn classify(&self, error: &SwapError, swap_id: &str) -> ClassifiedError {
        let context = serde_json::json!({
            "swap_id": swap_id,
            "detail": error.to_string(),
        });

        match error {
            SwapError::Validation { message, .. } => ClassifiedError {
                kind: ErrorKind::ValidationError,
                severity: Severity::Low,
                constraint_name: None,
                user_message: message.clone(),
                context,
            },
            SwapError::AlreadyInProgress { swap_id } => ClassifiedError {
                kind: ErrorKind::ValidationError,
                severity: Severity::Low,
                constraint_name: None,
                user_message: format!("swap {} is already in progress", swap_id),
                context,
            },
            SwapError::Permission { .. } => ClassifiedError {
                kind: ErrorKind::PermissionError,
                severity: Severity::Medium,
                constraint_name: None,
                user_message: "you do not have permission to perform this swap".into(),
                context,
            },
            SwapError::ConstraintViolation { constraint, .. } => ClassifiedError {
                kind: ErrorKind::ForeignKeyViolation,
                severity: foreign_key_severity(constraint),
                constraint_name: Some(constraint.clone()),
                user_message: "the swap could not be recorded".into(),
                context,
            },
            SwapError::AlreadyLocked { .. } => ClassifiedError {
                kind: ErrorKind::ValidationError,
                severity: Severity::Low,
                constraint_name: None,
                user_message: "booking locked".into(),
                context,
            },
            SwapError::InsufficientBalance { .. } => ClassifiedError {
                kind: ErrorKind::ValidationError,
                severity: Severity::Low,
                constraint_name: None,
                user_message: "insufficient balance for this swap".into(),
                context,
            },
            SwapError::BookingNotFound { .. } | SwapError::ProposalNotFound { .. } => {
                ClassifiedError {
                    kind: ErrorKind::ValidationError,
                    severity: Severity::Low,
                    constraint_name: None,
                    user_message: "a referenced record no longer exists".into(),
                    context,
                }
            }
            SwapError::Network { .. } | SwapError::Timeout { .. } => {
                let operation = match error {
                    SwapError::Timeout { operation } => operation.as_str(),
                    // Plain transport failures carry no operation name
                    _ => "transport",
                };
                let count = self.record_network_failure(swap_id, operation);
                let severity = if count >= NETWORK_ESCALATION_THRESHOLD {
                    Severity::High
                } else {
                    Severity::Medium
                };
                ClassifiedError {
                    kind: ErrorKind::NetworkError,
                    severity,
                    constraint_name: None,
                    user_message: "the ledger is temporarily unreachable, please retry".into(),
                    context,
                }
            }
            SwapError::LedgerRejected { .. } => ClassifiedError {
                kind: ErrorKind::LedgerRejected,
                severity: Severity::High,
                constraint_name: None,
                user_message: "the ledger rejected this swap".into(),
                context,
            },
            SwapError::Rollback { .. } => ClassifiedError {
                kind: ErrorKind::RollbackError,
                severity: Severity::Critical,
                constraint_name: None,
                user_message: "the swap could not be completed and requires operator attention"
                    .into(),
                context,
            },
            SwapError::DataIntegrity { .. } => ClassifiedError {
                kind: ErrorKind::DataIntegrityError,
                severity: Severity::Critical,
                constraint_name: None,
                user_message: "the swap outcome could not be confirmed".into(),
                context,
            },
            SwapError::Config(_)
            | SwapError::Internal(_)
            | SwapError::InvalidStateTransition { .. }
            | SwapError::ExecutionNotFound { .. } => ClassifiedError {
                kind: ErrorKind::InternalError,
                severity: Severity::High,
                constraint_name: None,
                user_message: "an internal error occurred".into(),
                context,
            },
        }
    }

    fn record_network_failure(&self, swap_id: &str, operation: &str) -> u32 {
        let mut entry = self
            .network_failures
            .entry((swap_id.to_string(), operation.to_string()))
            .or_insert(0);
        *entry += 1;
        *entry
    }

    /// Forget escalation state for a swap that reached a terminal step
    pub fn clear(&self, swap_id: &str) {
        self.network_failures.retain(|(id, _), _| id != swap_id);
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Foreign keys into core swap/user tables escalate to critical
fn foreign_key_severity(constraint: &str) -> Severity {
    if constraint.contains("swap") || constraint.contains("user") {
        Severity::Critical
    } else {
        Severity::High
    }
}
