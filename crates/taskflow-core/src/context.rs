//! Request identity and the per-run execution context.
//!
//! [`ExecuteCtx`] carries a run's deadline and cancellation token into the
//! action body.

use crate::error::TaskflowError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Request identity carried by every producer call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Kit {
    /// Request id, propagated into every task of a flow.
    pub rid: String,
}

impl Kit {
    /// A kit with a freshly generated request id.
    pub fn new() -> Self {
        Self {
            rid: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_rid(rid: impl Into<String>) -> Self {
        Self { rid: rid.into() }
    }
}

impl Default for Kit {
    fn default() -> Self {
        Self::new()
    }
}

/// Context handed to an action's run entry point.
#[derive(Clone, Debug)]
pub struct ExecuteCtx {
    rid: String,
    flow_id: String,
    task_id: String,
    attempt: u32,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecuteCtx {
    pub fn new(
        rid: impl Into<String>,
        flow_id: impl Into<String>,
        task_id: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            rid: rid.into(),
            flow_id: flow_id.into(),
            task_id: task_id.into(),
            attempt,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 1-based attempt number of the current run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the execution.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true if the execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Asynchronously wait until the execution is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Runs the provided future, respecting cancellation and the deadline.
    pub async fn run_future<R, F>(&self, fut: F) -> Result<R, TaskflowError>
    where
        F: Future<Output = R>,
    {
        if let Some(deadline) = self.deadline {
            let budget = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = self.cancel.cancelled() => Err(TaskflowError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(TaskflowError::Timeout(budget)),
                res = fut => Ok(res),
            }
        } else {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(TaskflowError::Cancelled),
                res = fut => Ok(res),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_future_completes() {
        let ctx = ExecuteCtx::new("rid", "f", "t", 1);
        let out = ctx.run_future(async { 7 }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_run_future_cancelled() {
        let ctx = ExecuteCtx::new("rid", "f", "t", 1);
        ctx.cancel();
        let res = ctx
            .run_future(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        assert!(matches!(res, Err(TaskflowError::Cancelled)));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_future_times_out() {
        let ctx = ExecuteCtx::new("rid", "f", "t", 1).with_timeout(Duration::from_millis(50));
        let res = ctx
            .run_future(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        assert!(matches!(res, Err(TaskflowError::Timeout(_))));
    }

    #[test]
    fn test_kit_generates_rid() {
        let a = Kit::new();
        let b = Kit::new();
        assert_ne!(a.rid, b.rid);
        assert_eq!(Kit::with_rid("abc").rid, "abc");
    }
}
