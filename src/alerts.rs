//! Critical alert dispatch
//!
//! Delivery mechanics (Slack, PagerDuty, email) live behind the trait; the
//! engine only asks for a critical condition to be surfaced to operators.

use crate::classify::ClassifiedError;
use crate::metrics;

use async_trait::async_trait;
use tracing::error;

/// Operator notification channel for critical conditions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn notify_critical(&self, error: &ClassifiedError);
}

/// Dispatcher that writes critical alerts to the structured log and metrics
///
/// Stands in when no delivery channel is configured; production deployments
/// wrap a real channel behind the same trait.
pub struct LogAlertDispatcher;

#[async_trait]
impl AlertDispatcher for LogAlertDispatcher {
    async fn notify_critical(&self, err: &ClassifiedError) {
        error!(
            kind = %err.kind,
            severity = ?err.severity,
            constraint = err.constraint_name.as_deref().unwrap_or(""),
            context = %err.context,
            "CRITICAL: {}",
            err.user_message
        );
        metrics::record_critical_alert(&err.kind.to_string());
    }
}
