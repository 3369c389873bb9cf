//! Swap execution state tracking
//!
//! One [`SwapExecution`] per in-flight or completed swap attempt, held in a
//! registry keyed by swap id. Steps only move forward on the success path;
//! once rollback is required they move through rollback states only.

use crate::classify::ClassifiedError;
use crate::error::{EngineResult, SwapError};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;

/// Saga steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwapStep {
    Validating,
    Proposing,
    Accepting,
    Executing,
    Verifying,
    Completed,
    RollingBack,
    RolledBack,
    Cancelled,
}

impl SwapStep {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStep::Completed | SwapStep::RolledBack | SwapStep::Cancelled
        )
    }

    /// Next step on the success path, if any
    fn forward_successor(&self) -> Option<SwapStep> {
        match self {
            SwapStep::Validating => Some(SwapStep::Proposing),
            SwapStep::Proposing => Some(SwapStep::Accepting),
            SwapStep::Accepting => Some(SwapStep::Executing),
            SwapStep::Executing => Some(SwapStep::Verifying),
            SwapStep::Verifying => Some(SwapStep::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for SwapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwapStep::Validating => "VALIDATING",
            SwapStep::Proposing => "PROPOSING",
            SwapStep::Accepting => "ACCEPTING",
            SwapStep::Executing => "EXECUTING",
            SwapStep::Verifying => "VERIFYING",
            SwapStep::Completed => "COMPLETED",
            SwapStep::RollingBack => "ROLLING_BACK",
            SwapStep::RolledBack => "ROLLED_BACK",
            SwapStep::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Per-swap execution context, exposed read-only via status queries
#[derive(Debug, Clone, Serialize)]
pub struct SwapExecution {
    pub swap_id: String,
    pub current_step: SwapStep,
    /// Ledger transaction ids in the order the steps completed; append-only
    pub transaction_ids: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub rollback_required: bool,
    /// Cooperative cancellation: checked between forward steps
    pub cancel_requested: bool,
    /// Compensation exhausted its retries; manual intervention needed
    pub stuck: bool,
    pub last_error: Option<ClassifiedError>,
}

impl SwapExecution {
    fn new(swap_id: &str) -> Self {
        Self {
            swap_id: swap_id.to_string(),
            current_step: SwapStep::Validating,
            transaction_ids: Vec::new(),
            start_time: Utc::now(),
            rollback_required: false,
            cancel_requested: false,
            stuck: false,
            last_error: None,
        }
    }

    /// Terminal or flagged stuck; eligible for cleanup once old enough
    pub fn is_settled(&self) -> bool {
        self.current_step.is_terminal() || self.stuck
    }
}

/// Registry of all tracked swap executions
pub struct ExecutionRegistry {
    executions: DashMap<String, SwapExecution>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self {
            executions: DashMap::new(),
        }
    }

    /// Register a new execution. A second request with the same swap id
    /// collapses to a rejection while the first is still active.
    pub fn insert_new(&self, swap_id: &str) -> EngineResult<()> {
        match self.executions.entry(swap_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !occupied.get().is_settled() {
                    return Err(SwapError::AlreadyInProgress {
                        swap_id: swap_id.to_string(),
                    });
                }
                occupied.insert(SwapExecution::new(swap_id));
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(SwapExecution::new(swap_id));
                Ok(())
            }
        }
    }

    /// Advance the execution to `step`, enforcing the state machine
    pub fn advance(&self, swap_id: &str, step: SwapStep) -> EngineResult<()> {
        let mut execution = self.get_mut(swap_id)?;
        let current = execution.current_step;

        let allowed = if execution.rollback_required {
            matches!(
                (current, step),
                (SwapStep::RollingBack, SwapStep::RolledBack)
            ) || (!current.is_terminal() && step == SwapStep::RollingBack)
        } else {
            current.forward_successor() == Some(step)
                || (current == SwapStep::Validating && step == SwapStep::Cancelled)
        };

        if !allowed {
            return Err(SwapError::InvalidStateTransition {
                from: current.to_string(),
                to: step.to_string(),
            });
        }

        execution.current_step = step;
        Ok(())
    }

    /// Append a ledger transaction id for a completed step
    pub fn record_transaction(&self, swap_id: &str, transaction_id: &str) -> EngineResult<()> {
        let mut execution = self.get_mut(swap_id)?;
        execution.transaction_ids.push(transaction_id.to_string());
        Ok(())
    }

    pub fn set_error(&self, swap_id: &str, error: ClassifiedError) -> EngineResult<()> {
        let mut execution = self.get_mut(swap_id)?;
        execution.last_error = Some(error);
        Ok(())
    }

    pub fn require_rollback(&self, swap_id: &str) -> EngineResult<()> {
        let mut execution = self.get_mut(swap_id)?;
        execution.rollback_required = true;
        Ok(())
    }

    pub fn mark_stuck(&self, swap_id: &str) -> EngineResult<()> {
        let mut execution = self.get_mut(swap_id)?;
        execution.stuck = true;
        Ok(())
    }

    pub fn request_cancel(&self, swap_id: &str) -> EngineResult<()> {
        let mut execution = self.get_mut(swap_id)?;
        execution.cancel_requested = true;
        Ok(())
    }

    pub fn is_cancel_requested(&self, swap_id: &str) -> bool {
        self.executions
            .get(swap_id)
            .map(|e| e.cancel_requested)
            .unwrap_or(false)
    }

    /// Read-only snapshot of one execution
    pub fn get(&self, swap_id: &str) -> Option<SwapExecution> {
        self.executions.get(swap_id).map(|e| e.clone())
    }

    /// Read-only snapshot of all non-terminal executions
    pub fn active(&self) -> Vec<SwapExecution> {
        self.executions
            .iter()
            .filter(|e| !e.current_step.is_terminal())
            .map(|e| e.clone())
            .collect()
    }

    /// Remove settled executions older than `max_age`. Non-terminal,
    /// non-stuck executions are never removed: dropping one would orphan a
    /// held booking lock.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let to_remove: Vec<String> = self
            .executions
            .iter()
            .filter(|e| e.is_settled() && e.start_time < cutoff)
            .map(|e| e.swap_id.clone())
            .collect();

        for swap_id in &to_remove {
            self.executions.remove(swap_id);
        }
        to_remove.len()
    }

    fn get_mut(
        &self,
        swap_id: &str,
    ) -> EngineResult<dashmap::mapref::one::RefMut<'_, String, SwapExecution>> {
        self.executions
            .get_mut(swap_id)
            .ok_or_else(|| SwapError::ExecutionNotFound {
                swap_id: swap_id.to_string(),
            })
    }
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_active_swap_id_rejected() {
        let registry = ExecutionRegistry::new();
        registry.insert_new("s1").unwrap();
        let err = registry.insert_new("s1").unwrap_err();
        assert!(matches!(err, SwapError::AlreadyInProgress { .. }));
    }

    #[test]
    fn test_settled_swap_id_can_be_reused() {
        let registry = ExecutionRegistry::new();
        registry.insert_new("s1").unwrap();
        registry.advance("s1", SwapStep::Cancelled).unwrap();
        registry.insert_new("s1").unwrap();
        assert_eq!(
            registry.get("s1").unwrap().current_step,
            SwapStep::Validating
        );
    }

    #[test]
    fn test_forward_only_transitions() {
        let registry = ExecutionRegistry::new();
        registry.insert_new("s1").unwrap();

        registry.advance("s1", SwapStep::Proposing).unwrap();
        registry.advance("s1", SwapStep::Accepting).unwrap();

        // Skipping a step is rejected
        let err = registry.advance("s1", SwapStep::Verifying).unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));

        // Moving backwards is rejected
        let err = registry.advance("s1", SwapStep::Proposing).unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_rollback_states_require_flag() {
        let registry = ExecutionRegistry::new();
        registry.insert_new("s1").unwrap();
        registry.advance("s1", SwapStep::Proposing).unwrap();

        let err = registry.advance("s1", SwapStep::RollingBack).unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));

        registry.require_rollback("s1").unwrap();
        registry.advance("s1", SwapStep::RollingBack).unwrap();
        registry.advance("s1", SwapStep::RolledBack).unwrap();
        assert!(registry.get("s1").unwrap().current_step.is_terminal());
    }

    #[test]
    fn test_active_excludes_terminal() {
        let registry = ExecutionRegistry::new();
        registry.insert_new("s1").unwrap();
        registry.insert_new("s2").unwrap();
        registry.advance("s2", SwapStep::Cancelled).unwrap();

        let active = registry.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].swap_id, "s1");
    }

    #[test]
    fn test_cleanup_retains_fresh_and_unsettled() {
        let registry = ExecutionRegistry::new();
        registry.insert_new("terminal-old").unwrap();
        registry.advance("terminal-old", SwapStep::Cancelled).unwrap();
        registry.insert_new("in-flight-old").unwrap();
        registry.advance("in-flight-old", SwapStep::Proposing).unwrap();

        // Backdate both starts
        {
            let mut e = registry.executions.get_mut("terminal-old").unwrap();
            e.start_time = Utc::now() - Duration::hours(2);
        }
        {
            let mut e = registry.executions.get_mut("in-flight-old").unwrap();
            e.start_time = Utc::now() - Duration::hours(2);
        }

        registry.insert_new("terminal-fresh").unwrap();
        registry.advance("terminal-fresh", SwapStep::Cancelled).unwrap();

        let removed = registry.cleanup(Duration::hours(1));
        assert_eq!(removed, 1);
        assert!(registry.get("terminal-old").is_none());
        assert!(registry.get("in-flight-old").is_some());
        assert!(registry.get("terminal-fresh").is_some());
    }

    #[test]
    fn test_stuck_execution_is_cleanable() {
        let registry = ExecutionRegistry::new();
        registry.insert_new("s1").unwrap();
        registry.advance("s1", SwapStep::Proposing).unwrap();
        registry.require_rollback("s1").unwrap();
        registry.advance("s1", SwapStep::RollingBack).unwrap();
        registry.mark_stuck("s1").unwrap();

        {
            let mut e = registry.executions.get_mut("s1").unwrap();
            e.start_time = Utc::now() - Duration::hours(2);
        }
        assert_eq!(registry.cleanup(Duration::hours(1)), 1);
    }

    #[test]
    fn test_transaction_ids_append_only() {
        let registry = ExecutionRegistry::new();
        registry.insert_new("s1").unwrap();
        registry.record_transaction("s1", "0.0.7@100.000000001").unwrap();
        registry.record_transaction("s1", "0.0.7@100.000000002").unwrap();

        let execution = registry.get("s1").unwrap();
        assert_eq!(
            execution.transaction_ids,
            vec!["0.0.7@100.000000001", "0.0.7@100.000000002"]
        );
    }
}
