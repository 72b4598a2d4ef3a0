//! Requeue policy for failed reconciles
//!
//! Errors are classified by kind. The reconciler itself never retries; the
//! controller requeues the object after a fixed delay chosen from the kind.
//! Configuration problems need a human to fix the cluster, so they are retried
//! on the slower configuration delay.

use kube::runtime::controller::Action;
use tracing::debug;

use crate::config::RetryPolicy;

/// Error classification used for logging and requeue decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Cluster metadata missing or malformed
    Configuration,
    /// Registry or API server unreachable, or the deadline expired
    Transport,
    /// Registry answered with an unexpected status or body
    Protocol,
    /// Writing the ServiceAccount back failed, including conflicts
    Persistence,
    /// Shutdown interrupted the reconcile
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Choose the requeue action for a failed reconcile
pub fn requeue_action(kind: ErrorKind, policy: &RetryPolicy) -> Action {
    let delay = match kind {
        ErrorKind::Configuration => policy.configuration_retry_delay,
        ErrorKind::Transport
        | ErrorKind::Protocol
        | ErrorKind::Persistence
        | ErrorKind::Cancelled => policy.retry_delay,
    };
    debug!(
        error_kind = kind.as_str(),
        delay_secs = delay.as_secs(),
        "Scheduling retry"
    );
    Action::requeue(delay)
}
