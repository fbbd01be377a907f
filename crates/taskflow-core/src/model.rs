//! Flow and task records shared by the engine and every backend.

use crate::binding::DeferredBinding;
use crate::error::ErrorKind;
use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate status of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Success | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Pending => "pending",
            FlowStatus::Running => "running",
            FlowStatus::Success => "success",
            FlowStatus::Failed => "failed",
            FlowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses from which the `Running` transition may be attempted.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "retrying" => Some(TaskStatus::Retrying),
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last classified error recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReason {
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Why a flow ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowReason {
    pub task_id: String,
    pub message: String,
}

/// One instantiation of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub template: String,
    pub status: FlowStatus,
    /// Request id of the call that created the flow.
    pub rid: String,
    pub memo: Option<String>,
    pub reason: Option<FlowReason>,
    /// Owned task ids in step order.
    pub task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One unit of work bound to an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub flow_id: String,
    /// Index of the template step this task was expanded from.
    pub step: usize,
    pub action: String,
    pub parameters: Payload,
    /// Result bindings resolved just before dispatch.
    #[serde(default)]
    pub deferred: Vec<DeferredBinding>,
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    pub attempt: u32,
    /// Overrides the engine's retry policy when set.
    pub max_attempts: Option<u32>,
    /// Overrides the engine's task timeout when set.
    pub timeout_secs: Option<u64>,
    pub result: Option<Payload>,
    pub reason: Option<TaskReason>,
    /// Earliest time a `Retrying` task may be dispatched again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether the task's own status and backoff deadline allow dispatch.
    /// Dependency satisfaction is checked separately by the backend.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Retrying => self.next_attempt_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

/// Field updates applied together with a status compare-and-set.
///
/// Unset fields keep their stored value, except `next_attempt_at` which is
/// always replaced and `reason` which is cleared on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub attempt: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Payload>,
    pub reason: Option<TaskReason>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn result(mut self, result: Payload) -> Self {
        self.result = Some(result);
        self
    }

    pub fn reason(mut self, reason: TaskReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn next_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    /// Apply the new status and these fields to a stored task.
    pub fn apply(&self, task: &mut Task, status: TaskStatus) {
        task.status = status;
        if let Some(attempt) = self.attempt {
            task.attempt = attempt;
        }
        if let Some(at) = self.started_at {
            task.started_at = Some(at);
        }
        if let Some(at) = self.finished_at {
            task.finished_at = Some(at);
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
        if status == TaskStatus::Success {
            task.reason = None;
        } else if let Some(reason) = &self.reason {
            task.reason = Some(reason.clone());
        }
        task.next_attempt_at = self.next_attempt_at;
    }
}

/// Filter for listing flows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowFilter {
    pub status: Option<FlowStatus>,
    pub template: Option<String>,
    pub ids: Option<Vec<String>>,
}

impl FlowFilter {
    pub fn matches(&self, flow: &Flow) -> bool {
        self.status.map_or(true, |s| s == flow.status)
            && self.template.as_ref().map_or(true, |t| *t == flow.template)
            && self.ids.as_ref().map_or(true, |ids| ids.contains(&flow.id))
    }
}

/// Offset/limit page over flows ordered by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

/// A flow together with its tasks, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowView {
    #[serde(flatten)]
    pub flow: Flow,
    pub tasks: Vec<Task>,
}

impl FlowView {
    pub fn task_by_step(&self, step: usize) -> Option<&Task> {
        self.tasks.iter().find(|t| t.step == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(status: TaskStatus) -> Task {
        Task {
            id: "t1".into(),
            flow_id: "f1".into(),
            step: 0,
            action: "noop".into(),
            parameters: Payload::new("noop", json!({})),
            deferred: vec![],
            depends_on: vec![],
            status,
            attempt: 0,
            max_attempts: None,
            timeout_secs: None,
            result: None,
            reason: None,
            next_attempt_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_status_serde_is_snake_case() {
        assert_eq!(serde_json::to_string(&TaskStatus::Retrying).unwrap(), "\"retrying\"");
        assert_eq!(TaskStatus::parse("cancelled"), Some(TaskStatus::Cancelled));
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_retrying_task_due_after_deadline() {
        let now = Utc::now();
        let mut t = task(TaskStatus::Retrying);
        t.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(!t.is_due(now));
        assert!(t.is_due(now + chrono::Duration::seconds(6)));
        assert!(!task(TaskStatus::Running).is_due(now));
    }

    #[test]
    fn test_patch_success_clears_reason_and_deadline() {
        let now = Utc::now();
        let mut t = task(TaskStatus::Running);
        t.reason = Some(TaskReason {
            kind: ErrorKind::Transient,
            message: "flaky".into(),
            attempt: 1,
            at: now,
        });
        t.next_attempt_at = Some(now);
        TaskPatch::new()
            .finished_at(now)
            .result(Payload::new("noop", json!(1)))
            .apply(&mut t, TaskStatus::Success);
        assert_eq!(t.status, TaskStatus::Success);
        assert!(t.reason.is_none());
        assert!(t.next_attempt_at.is_none());
        assert_eq!(t.finished_at, Some(now));
    }

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let flow = Flow {
            id: "f1".into(),
            template: "sync-region".into(),
            status: FlowStatus::Running,
            rid: "r".into(),
            memo: None,
            reason: None,
            task_ids: vec![],
            created_at: now,
            updated_at: now,
        };
        assert!(FlowFilter::default().matches(&flow));
        let f = FlowFilter {
            status: Some(FlowStatus::Failed),
            ..Default::default()
        };
        assert!(!f.matches(&flow));
        let f = FlowFilter {
            template: Some("sync-region".into()),
            ids: Some(vec!["f1".into()]),
            ..Default::default()
        };
        assert!(f.matches(&flow));
    }
}
