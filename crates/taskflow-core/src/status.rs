//! Aggregate flow status as a pure reduction over task statuses.

use crate::model::{FlowStatus, Task, TaskStatus};

/// Reduce the statuses of a flow's tasks to the flow's status.
///
/// A terminal `current` status is kept as is. While any task can still make
/// progress the flow is `Pending` (nothing started yet) or `Running`. Once
/// every task is terminal the flow is `Success` if all succeeded, `Failed` if
/// any failed, and `Cancelled` otherwise.
pub fn reduce_flow_status(current: FlowStatus, tasks: &[Task]) -> FlowStatus {
    if current.is_terminal() || tasks.is_empty() {
        return current;
    }
    let active = tasks.iter().any(|t| !t.status.is_terminal());
    if active {
        let untouched = tasks.iter().all(|t| t.status == TaskStatus::Pending);
        return if untouched {
            FlowStatus::Pending
        } else {
            FlowStatus::Running
        };
    }
    if tasks.iter().all(|t| t.status == TaskStatus::Success) {
        FlowStatus::Success
    } else if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
        FlowStatus::Failed
    } else {
        FlowStatus::Cancelled
    }
}

/// The failed task that explains a `Failed` flow, earliest step first.
pub fn first_failure(tasks: &[Task]) -> Option<&Task> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .min_by_key(|t| t.step)
}
