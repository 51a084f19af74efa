//! Step-up approval
//!
//! After a successful primary bind the engine may ask an out-of-band
//! transport (push notification) to approve the login. The transport call
//! runs as its own task and is raced against a deadline by [`first_settled`].
//! On timeout the task is detached and its late result is dropped.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, warn};

pub const DEFAULT_STEP_UP_DEADLINE: Duration = Duration::from_secs(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepUpOutcome {
    Approve,
    Reject,
    Timeout,
}

impl std::fmt::Display for StepUpOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepUpOutcome::Approve => write!(f, "approve"),
            StepUpOutcome::Reject => write!(f, "reject"),
            StepUpOutcome::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StepUpError {
    #[error("approval transport failed: {0}")]
    Transport(String),
    #[error("approval response invalid: {0}")]
    InvalidResponse(String),
    #[error("approval task failed: {0}")]
    Task(String),
}

/// Delivers an approval request and waits for the user's answer.
#[async_trait]
pub trait ApprovalTransport: Send + Sync + 'static {
    async fn request_approval(&self, username: &str) -> Result<ApprovalDecision, StepUpError>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum Settled<T> {
    Completed(T),
    DeadlineElapsed,
}

/// Run `task` on its own and wait at most `deadline` for it.
///
/// The task is never aborted: when the deadline wins, the join handle is
/// dropped and the task runs to completion unobserved.
pub async fn first_settled<F>(task: F, deadline: Duration) -> Result<Settled<F::Output>, JoinError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let handle = tokio::spawn(task);
    match tokio::time::timeout(deadline, handle).await {
        Ok(joined) => joined.map(Settled::Completed),
        Err(_) => Ok(Settled::DeadlineElapsed),
    }
}

pub struct StepUpNotifier {
    transport: Arc<dyn ApprovalTransport>,
    deadline: Duration,
}

impl StepUpNotifier {
    pub fn new(transport: Arc<dyn ApprovalTransport>) -> Self {
        Self {
            transport,
            deadline: DEFAULT_STEP_UP_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn request(&self, username: &str) -> Result<StepUpOutcome, StepUpError> {
        let transport = Arc::clone(&self.transport);
        let user = username.to_string();
        debug!("Requesting step-up approval for {}", username);

        let settled = first_settled(
            async move { transport.request_approval(&user).await },
            self.deadline,
        )
        .await
        .map_err(|e| StepUpError::Task(e.to_string()))?;

        match settled {
            Settled::Completed(Ok(ApprovalDecision::Approve)) => Ok(StepUpOutcome::Approve),
            Settled::Completed(Ok(ApprovalDecision::Reject)) => Ok(StepUpOutcome::Reject),
            Settled::Completed(Err(e)) => Err(e),
            Settled::DeadlineElapsed => {
                warn!(
                    "Step-up approval for {} timed out after {:?}",
                    username, self.deadline
                );
                Ok(StepUpOutcome::Timeout)
            }
        }
    }
}
