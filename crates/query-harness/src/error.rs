//! Typed error kinds the Orchestrator uses to decide ack / nack-requeue /
//! nack-drop. Everything outside this decision still flows through
//! `anyhow::Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad job payload: decode failure at the Orchestrator. Nack-drop, never
    /// requeued — a poison message will never decode correctly on redelivery.
    #[error("validation error: {0}")]
    Validation(String),

    /// Broker publish failed, or a dependency (metadata reader, result
    /// store) was unreachable. Nack-requeue; the broker will redeliver.
    #[error("transient dependency error: {0}")]
    Transient(#[source] anyhow::Error),

    /// The ML service answered with an explicit error, or the await phase
    /// produced zero successes. Surfaced to the client as a terminal
    /// `QueryResult{status: "error"}`, not retried at the job level.
    #[error("upstream ML service error: {0}")]
    UpstreamFailure(String),

    /// No reply arrived within the await deadline.
    #[error("Search timeout - no response from ML service")]
    Timeout,
}
