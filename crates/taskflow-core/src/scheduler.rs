//! Scheduler and executor.
//!
//! The scheduler polls the backend for ready tasks, claims each one with a
//! `Pending/Retrying -> Running` compare-and-set, runs its action under a
//! bounded number of permits and writes the outcome back. Several schedulers
//! may share one backend; the claim is the only serialization point.

use crate::action::{ActionRegistry, InvokeError};
use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::context::ExecuteCtx;
use crate::error::{ActionError, ErrorKind, TaskflowError};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::model::{Flow, FlowReason, FlowStatus, Task, TaskPatch, TaskReason, TaskStatus};
use crate::payload::Payload;
use crate::status::{first_failure, reduce_flow_status};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

/// What happened to a task handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Another worker won the claim, or the task was no longer dispatchable.
    Lost,
    Succeeded,
    /// A transient failure scheduled another attempt.
    Retrying,
    Failed,
    Cancelled,
}

struct Inner<B: Backend> {
    backend: Arc<B>,
    registry: ActionRegistry,
    config: EngineConfig,
    metrics: Arc<dyn MetricsSink>,
    permits: Arc<Semaphore>,
}

/// Dispatches ready tasks to their actions.
pub struct Scheduler<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for Scheduler<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> Scheduler<B> {
    pub fn new(backend: Arc<B>, registry: ActionRegistry, config: EngineConfig) -> Self {
        Self::with_metrics(backend, registry, config, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        backend: Arc<B>,
        registry: ActionRegistry,
        config: EngineConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_count.max(1)));
        Self {
            inner: Arc::new(Inner {
                backend,
                registry,
                config,
                metrics,
                permits,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Claim up to `dispatch_batch` ready tasks, bounded by free permits.
    async fn claim_ready(&self) -> Result<Vec<(Task, OwnedSemaphorePermit)>, TaskflowError> {
        let free = self.inner.permits.available_permits();
        if free == 0 {
            return Ok(Vec::new());
        }
        let limit = free.min(self.inner.config.dispatch_batch);
        let ready = self.inner.backend.list_ready_tasks(limit).await?;
        let mut claimed = Vec::with_capacity(ready.len());
        for task in ready {
            let Ok(permit) = self.inner.permits.clone().try_acquire_owned() else {
                break;
            };
            match self.claim(task).await {
                Ok(Some(task)) => claimed.push((task, permit)),
                Ok(None) => {}
                Err(e) => {
                    // Tasks claimed so far are already Running and must still run.
                    error!(error = %e, claimed = claimed.len(), "Claim failed, dispatching what was claimed");
                    break;
                }
            }
        }
        Ok(claimed)
    }

    /// Move a task to `Running`. Returns the task as stored after the
    /// transition, or `None` if another worker got there first.
    async fn claim(&self, mut task: Task) -> Result<Option<Task>, TaskflowError> {
        if !task.status.is_dispatchable() {
            return Ok(None);
        }
        let patch = TaskPatch::new()
            .attempt(task.attempt + 1)
            .started_at(Utc::now());
        let won = self
            .inner
            .backend
            .compare_and_set_task_status(&task.id, task.status, TaskStatus::Running, patch.clone())
            .await?;
        if !won {
            trace!(task_id = %task.id, "Lost claim");
            return Ok(None);
        }
        patch.apply(&mut task, TaskStatus::Running);
        Ok(Some(task))
    }

    /// Claim and run a single task.
    pub async fn dispatch(&self, task: Task) -> Result<DispatchOutcome, TaskflowError> {
        match self.claim(task).await? {
            Some(task) => self.execute(task).await,
            None => Ok(DispatchOutcome::Lost),
        }
    }

    /// Claim every ready task the permits allow and run them to completion.
    /// Returns the number of tasks claimed.
    pub async fn run_once(&self) -> Result<usize, TaskflowError> {
        let claimed = self.claim_ready().await?;
        let n = claimed.len();
        let runs = claimed.into_iter().map(|(task, permit)| async move {
            let task_id = task.id.clone();
            if let Err(e) = self.execute(task).await {
                error!(task_id = %task_id, error = %e, "Dispatch failed");
            }
            drop(permit);
        });
        futures::future::join_all(runs).await;
        Ok(n)
    }

    /// Call [`run_once`](Self::run_once) until a cycle claims nothing.
    pub async fn drain(&self) -> Result<usize, TaskflowError> {
        let mut total = 0;
        loop {
            let n = self.run_once().await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    /// Reclaim tasks whose lease expired. Tasks that had used up their
    /// attempts come back `Failed`; their dependents are cancelled and the
    /// flow is refreshed. Returns the number of reclaimed tasks.
    #[instrument(skip(self), level = "debug")]
    pub async fn sweep_once(&self) -> Result<usize, TaskflowError> {
        let reclaimed = self
            .inner
            .backend
            .reclaim_stale_running(self.inner.config.lease_timeout, self.inner.config.retry.max_attempts)
            .await?;
        for task in &reclaimed {
            warn!(task_id = %task.id, attempt = task.attempt, status = %task.status, "Reclaimed task with expired lease");
            if task.status != TaskStatus::Failed {
                continue;
            }
            if let Ok(flow) = self.inner.backend.get_flow(&task.flow_id).await {
                self.inner
                    .metrics
                    .on_failure(&flow.template, &task.action, Duration::ZERO)
                    .await;
            }
            self.cascade_cancel(task).await?;
            self.refresh_flow(&task.flow_id).await?;
        }
        Ok(reclaimed.len())
    }

    /// Dispatch and sweep until `token` is cancelled, then wait for
    /// in-flight runs to finish.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn run_forever(&self, token: CancellationToken) {
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
        let mut next_sweep = Instant::now() + self.inner.config.sweep_interval;
        loop {
            in_flight.retain(|h| !h.is_finished());
            if Instant::now() >= next_sweep {
                if let Err(e) = self.sweep_once().await {
                    error!(error = %e, "Lease sweep failed");
                }
                next_sweep = Instant::now() + self.inner.config.sweep_interval;
            }
            let claimed = match self.claim_ready().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "Failed to claim ready tasks");
                    Vec::new()
                }
            };
            if claimed.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
                }
                continue;
            }
            for (task, permit) in claimed {
                let this = self.clone();
                in_flight.push(tokio::spawn(async move {
                    let _permit = permit;
                    let task_id = task.id.clone();
                    if let Err(e) = this.execute(task).await {
                        error!(task_id = %task_id, error = %e, "Dispatch failed");
                    }
                }));
            }
            if token.is_cancelled() {
                break;
            }
        }
        for handle in in_flight {
            let _ = handle.await;
        }
        debug!("Scheduler stopped");
    }

    /// Run the scheduler loop in a background task.
    pub fn spawn(&self) -> SchedulerHandle {
        let token = CancellationToken::new();
        let child = token.child_token();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_forever(child).await });
        SchedulerHandle {
            token,
            handle: Some(handle),
        }
    }

    fn max_attempts(&self, task: &Task) -> u32 {
        task.max_attempts
            .unwrap_or(self.inner.config.retry.max_attempts)
    }

    /// Run a task that has already been claimed.
    #[instrument(
        skip(self, task),
        fields(task_id = %task.id, flow_id = %task.flow_id, action = %task.action, attempt = task.attempt),
        level = "debug"
    )]
    async fn execute(&self, task: Task) -> Result<DispatchOutcome, TaskflowError> {
        let backend = &self.inner.backend;
        let flow = backend.get_flow(&task.flow_id).await?;
        if flow.status == FlowStatus::Cancelled {
            return self.finish_cancelled(&flow, &task).await;
        }
        if flow.status == FlowStatus::Pending {
            backend
                .update_flow_status(&flow.id, FlowStatus::Running, None)
                .await?;
        }

        let params = match self.resolve_parameters(&task).await {
            Ok(params) => params,
            Err(msg) => {
                let err = TaskflowError::ParameterDecodeFailed(msg);
                return self
                    .finish_failed(&flow, &task, ActionError::permanent(err.to_string()), Duration::ZERO)
                    .await;
            }
        };
        let action = match self.inner.registry.resolve(&task.action) {
            Ok(action) => action,
            Err(e) => {
                return self
                    .finish_failed(&flow, &task, ActionError::permanent(e.to_string()), Duration::ZERO)
                    .await;
            }
        };

        let token = CancellationToken::new();
        let mut ctx = ExecuteCtx::new(flow.rid.clone(), flow.id.clone(), task.id.clone(), task.attempt)
            .with_cancel_token(token.clone());
        let timeout = task
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.inner.config.task_timeout);
        if let Some(timeout) = timeout {
            ctx = ctx.with_timeout(timeout);
        }

        self.inner.metrics.on_dispatch(&flow.template, &task.action).await;
        let watcher = self.watch_status(task.id.clone(), token);
        let started = Instant::now();
        let outcome = ctx.run_future(action.invoke(&ctx, &params)).await;
        let elapsed = started.elapsed();
        watcher.abort();

        match outcome {
            Ok(Ok(result)) => self.finish_success(&flow, &task, result, elapsed).await,
            Ok(Err(InvokeError::Decode(msg))) => {
                let err = TaskflowError::ParameterDecodeFailed(msg);
                self.finish_failed(&flow, &task, ActionError::permanent(err.to_string()), elapsed)
                    .await
            }
            Ok(Err(InvokeError::Action(err))) => self.finish_error(&flow, &task, err, elapsed).await,
            Err(TaskflowError::Timeout(d)) => {
                let err = ActionError::transient(format!("timed out after {d:?}"));
                self.finish_error(&flow, &task, err, elapsed).await
            }
            Err(TaskflowError::Cancelled) => self.finish_cancelled(&flow, &task).await,
            Err(other) => {
                self.finish_failed(&flow, &task, ActionError::permanent(other.to_string()), elapsed)
                    .await
            }
        }
    }

    /// Fill deferred bindings from the results of the tasks they name.
    async fn resolve_parameters(&self, task: &Task) -> Result<Payload, String> {
        let mut params = task.parameters.clone();
        for binding in &task.deferred {
            let source = self
                .inner
                .backend
                .get_task(&binding.source_task)
                .await
                .map_err(|e| e.to_string())?;
            let result = match (&source.status, &source.result) {
                (TaskStatus::Success, Some(result)) => result,
                _ => return Err(format!("task {} has no result", source.id)),
            };
            binding
                .apply(&mut params.body, result)
                .map_err(|e| e.to_string())?;
        }
        Ok(params)
    }

    /// Cancel `token` once the stored task leaves `Running`.
    fn watch_status(&self, task_id: String, token: CancellationToken) -> JoinHandle<()> {
        let backend = self.inner.backend.clone();
        let interval = self.inner.config.poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match backend.get_task(&task_id).await {
                    Ok(t) if t.status == TaskStatus::Running => {}
                    Ok(t) => {
                        debug!(task_id = %task_id, status = %t.status, "Task left Running, cancelling run");
                        token.cancel();
                        return;
                    }
                    Err(e) => trace!(task_id = %task_id, error = %e, "Status check failed"),
                }
            }
        })
    }

    async fn finish_success(
        &self,
        flow: &Flow,
        task: &Task,
        result: Payload,
        elapsed: Duration,
    ) -> Result<DispatchOutcome, TaskflowError> {
        let stored = self
            .inner
            .backend
            .compare_and_set_task_status(
                &task.id,
                TaskStatus::Running,
                TaskStatus::Success,
                TaskPatch::new().result(result).finished_at(Utc::now()),
            )
            .await?;
        if !stored {
            // Cancelled or reclaimed while running; the result is dropped.
            warn!(task_id = %task.id, "Discarding result of task that left Running");
            return Ok(DispatchOutcome::Lost);
        }
        self.inner
            .metrics
            .on_success(&flow.template, &task.action, elapsed)
            .await;
        debug!(task_id = %task.id, "Task succeeded");
        self.refresh_flow(&flow.id).await?;
        Ok(DispatchOutcome::Succeeded)
    }

    async fn finish_error(
        &self,
        flow: &Flow,
        task: &Task,
        err: ActionError,
        elapsed: Duration,
    ) -> Result<DispatchOutcome, TaskflowError> {
        let policy = self
            .inner
            .config
            .retry
            .clone()
            .with_max_attempts(self.max_attempts(task));
        if !policy.should_retry(&err, task.attempt) {
            return self.finish_failed(flow, task, err, elapsed).await;
        }
        let now = Utc::now();
        let backoff = policy.backoff_duration(task.attempt);
        let reason = TaskReason {
            kind: err.kind,
            message: err.message.clone(),
            attempt: task.attempt,
            at: now,
        };
        let stored = self
            .inner
            .backend
            .compare_and_set_task_status(
                &task.id,
                TaskStatus::Running,
                TaskStatus::Retrying,
                TaskPatch::new()
                    .reason(reason)
                    .next_attempt_at(now + crate::backend::chrono_duration(backoff)),
            )
            .await?;
        if !stored {
            return Ok(DispatchOutcome::Lost);
        }
        self.inner
            .metrics
            .on_retry(&flow.template, &task.action, elapsed)
            .await;
        debug!(task_id = %task.id, attempt = task.attempt, backoff = ?backoff, error = %err.message, "Task will retry");
        Ok(DispatchOutcome::Retrying)
    }

    async fn finish_failed(
        &self,
        flow: &Flow,
        task: &Task,
        err: ActionError,
        elapsed: Duration,
    ) -> Result<DispatchOutcome, TaskflowError> {
        let now = Utc::now();
        let reason = TaskReason {
            kind: err.kind,
            message: err.message.clone(),
            attempt: task.attempt,
            at: now,
        };
        let stored = self
            .inner
            .backend
            .compare_and_set_task_status(
                &task.id,
                TaskStatus::Running,
                TaskStatus::Failed,
                TaskPatch::new().reason(reason).finished_at(now),
            )
            .await?;
        if !stored {
            return Ok(DispatchOutcome::Lost);
        }
        self.inner
            .metrics
            .on_failure(&flow.template, &task.action, elapsed)
            .await;
        warn!(task_id = %task.id, attempt = task.attempt, error = %err.message, "Task failed");
        self.cascade_cancel(task).await?;
        self.refresh_flow(&flow.id).await?;
        Ok(DispatchOutcome::Failed)
    }

    async fn finish_cancelled(&self, flow: &Flow, task: &Task) -> Result<DispatchOutcome, TaskflowError> {
        let stored = self
            .inner
            .backend
            .compare_and_set_task_status(
                &task.id,
                TaskStatus::Running,
                TaskStatus::Cancelled,
                TaskPatch::new().finished_at(Utc::now()),
            )
            .await?;
        // Already `Cancelled` when the flow was cancelled first. Any other
        // status means the lease was reclaimed and the task lives on.
        if !stored && self.inner.backend.get_task(&task.id).await?.status != TaskStatus::Cancelled {
            debug!(task_id = %task.id, "Run interrupted after its lease was reclaimed");
            return Ok(DispatchOutcome::Lost);
        }
        self.inner
            .metrics
            .on_cancelled(&flow.template, &task.action)
            .await;
        debug!(task_id = %task.id, "Task cancelled");
        self.cascade_cancel(task).await?;
        self.refresh_flow(&flow.id).await?;
        Ok(DispatchOutcome::Cancelled)
    }

    /// Cancel every task that transitively depends on `root`, walking the
    /// reverse dependency edges once per task.
    async fn cascade_cancel(&self, root: &Task) -> Result<usize, TaskflowError> {
        let tasks = self.inner.backend.get_tasks(&root.flow_id).await?;
        let mut dependents: HashMap<&str, Vec<&Task>> = HashMap::new();
        for t in &tasks {
            for dep in &t.depends_on {
                dependents.entry(dep.as_str()).or_default().push(t);
            }
        }

        let now = Utc::now();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([root.id.as_str()]);
        let mut cancelled = 0;
        while let Some(id) = queue.pop_front() {
            for t in dependents.get(id).into_iter().flatten() {
                if !visited.insert(t.id.as_str()) {
                    continue;
                }
                queue.push_back(t.id.as_str());
                if !t.status.is_dispatchable() {
                    continue;
                }
                let reason = TaskReason {
                    kind: ErrorKind::Permanent,
                    message: format!("upstream task {} did not succeed", root.id),
                    attempt: t.attempt,
                    at: now,
                };
                let stored = self
                    .inner
                    .backend
                    .compare_and_set_task_status(
                        &t.id,
                        t.status,
                        TaskStatus::Cancelled,
                        TaskPatch::new().reason(reason).finished_at(now),
                    )
                    .await?;
                if stored {
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            debug!(task_id = %root.id, cancelled, "Cancelled dependents");
        }
        Ok(cancelled)
    }

    /// Re-evaluate and persist the flow's aggregate status.
    async fn refresh_flow(&self, flow_id: &str) -> Result<FlowStatus, TaskflowError> {
        let backend = &self.inner.backend;
        let flow = backend.get_flow(flow_id).await?;
        if flow.status.is_terminal() {
            return Ok(flow.status);
        }
        let tasks = backend.get_tasks(flow_id).await?;
        let status = reduce_flow_status(flow.status, &tasks);
        if status == flow.status {
            return Ok(status);
        }
        let reason = if status == FlowStatus::Failed {
            first_failure(&tasks).map(|t| FlowReason {
                task_id: t.id.clone(),
                message: t
                    .reason
                    .as_ref()
                    .map(|r| r.message.clone())
                    .unwrap_or_default(),
            })
        } else {
            None
        };
        backend.update_flow_status(flow_id, status, reason).await?;
        debug!(flow_id, status = %status, "Flow status updated");
        Ok(status)
    }
}

/// Handle to a scheduler loop started with [`Scheduler::spawn`].
pub struct SchedulerHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal the loop to stop claiming new work.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Wait for the loop and its in-flight runs to finish.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
