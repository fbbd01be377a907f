//! Redis implementation of the taskflow `Backend`.
//!
//! Layout, under the configured prefix:
//! - `flow:{id}`: hash with `status`, `rev` and the JSON `data` of the flow
//! - `flows`: sorted set of flow ids scored by creation time (ms)
//! - `task:{id}`: hash with `status`, `rev` and the JSON `data` of the task
//! - `tasks:pending`: set of pending task ids
//! - `tasks:retrying`: sorted set of retrying task ids scored by next attempt (ms)
//! - `tasks:running`: sorted set of running task ids scored by start time (ms)

use crate::client::RedisClient;
use crate::scripts::{self, MISSING, REJECTED, STALE, WRITTEN};
use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use taskflow_core::backend::{chrono_duration, reclaim_transition, Backend, BackendError};
use taskflow_core::{Flow, FlowFilter, FlowReason, FlowStatus, Page, Task, TaskPatch, TaskStatus};
use tracing::{error, instrument, trace, warn};

/// Revision conflicts tolerated before a write gives up.
const MAX_CAS_ROUNDS: usize = 16;

/// Flow ids read per round trip when a filter has to inspect flow rows.
const LIST_CHUNK: usize = 64;

/// Redis-backed flow and task store.
#[derive(Clone)]
pub struct RedisBackend {
    client: RedisClient,
    task_cas: Script,
    flow_update: Script,
}

fn io(e: redis::RedisError) -> BackendError {
    error!("Redis error: {}", e);
    BackendError::Io(e.to_string())
}

fn ser(e: serde_json::Error) -> BackendError {
    BackendError::Serialization(e.to_string())
}

fn decode<T: DeserializeOwned>(data: &str) -> Result<T, BackendError> {
    serde_json::from_str(data).map_err(ser)
}

impl RedisBackend {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            task_cas: scripts::task_cas(),
            flow_update: scripts::flow_update(),
        }
    }

    fn flow_key(&self, flow_id: &str) -> String {
        self.client.prefixed_key(&format!("flow:{flow_id}"))
    }

    fn flows_key(&self) -> String {
        self.client.prefixed_key("flows")
    }

    fn task_key(&self, task_id: &str) -> String {
        self.client.prefixed_key(&format!("task:{task_id}"))
    }

    fn pending_key(&self) -> String {
        self.client.prefixed_key("tasks:pending")
    }

    fn retrying_key(&self) -> String {
        self.client.prefixed_key("tasks:retrying")
    }

    fn running_key(&self) -> String {
        self.client.prefixed_key("tasks:running")
    }

    /// Read `status`, `rev` and `data` of one row.
    async fn read_row(&self, key: &str) -> Result<Option<(String, String, String)>, BackendError> {
        let mut conn = self.client.conn.clone();
        let (status, rev, data): (Option<String>, Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(key)
            .arg("status")
            .arg("rev")
            .arg("data")
            .query_async(&mut conn)
            .await
            .map_err(io)?;
        Ok(match (status, rev, data) {
            (Some(s), Some(r), Some(d)) => Some((s, r, d)),
            _ => None,
        })
    }

    /// Load the JSON payload of several rows in one round trip, skipping
    /// rows that do not exist.
    async fn load_many<T: DeserializeOwned>(&self, keys: &[String]) -> Result<Vec<T>, BackendError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hget(key, "data");
        }
        let mut conn = self.client.conn.clone();
        let rows: Vec<Option<String>> = pipe.query_async(&mut conn).await.map_err(io)?;
        rows.into_iter().flatten().map(|d| decode(&d)).collect()
    }

    /// Current status of each task id, `None` for missing rows.
    async fn statuses(&self, task_ids: &[String]) -> Result<Vec<Option<TaskStatus>>, BackendError> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in task_ids {
            pipe.hget(self.task_key(id), "status");
        }
        let mut conn = self.client.conn.clone();
        let rows: Vec<Option<String>> = pipe.query_async(&mut conn).await.map_err(io)?;
        Ok(rows
            .into_iter()
            .map(|s| s.as_deref().and_then(TaskStatus::parse))
            .collect())
    }

    /// Compare-and-set with the new status and fields computed from the
    /// stored row by `edit`. Retries while other writers bump the revision
    /// between read and write.
    async fn cas_task(
        &self,
        task_id: &str,
        expected: TaskStatus,
        edit: impl Fn(&mut Task) -> TaskStatus,
    ) -> Result<Option<Task>, BackendError> {
        let key = self.task_key(task_id);
        for _ in 0..MAX_CAS_ROUNDS {
            let Some((status, rev, data)) = self.read_row(&key).await? else {
                return Err(BackendError::NotFound(format!("task {task_id}")));
            };
            if status != expected.as_str() {
                return Ok(None);
            }
            let mut task: Task = decode(&data)?;
            let new = edit(&mut task);
            task.status = new;
            let retry_at = task.next_attempt_at.unwrap_or_else(Utc::now).timestamp_millis();
            let running_since = task.started_at.unwrap_or_else(Utc::now).timestamp_millis();
            let encoded = serde_json::to_string(&task).map_err(ser)?;

            let mut conn = self.client.conn.clone();
            let outcome: i64 = self
                .task_cas
                .key(&key)
                .key(self.pending_key())
                .key(self.retrying_key())
                .key(self.running_key())
                .arg(task_id)
                .arg(expected.as_str())
                .arg(&rev)
                .arg(new.as_str())
                .arg(encoded)
                .arg(retry_at)
                .arg(running_since)
                .invoke_async(&mut conn)
                .await
                .map_err(io)?;
            match outcome {
                WRITTEN => return Ok(Some(task)),
                REJECTED => return Ok(None),
                MISSING => return Err(BackendError::NotFound(format!("task {task_id}"))),
                STALE => trace!(task_id, "Revision moved, retrying CAS"),
                other => return Err(BackendError::Other(format!("unexpected script reply {other}"))),
            }
        }
        Err(BackendError::Conflict(format!("task {task_id} kept changing")))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    #[instrument(skip(self, flow, tasks), fields(flow_id = %flow.id), level = "trace")]
    async fn create_flow_with_tasks(&self, flow: Flow, tasks: Vec<Task>) -> Result<String, BackendError> {
        for task in &tasks {
            if task.flow_id != flow.id {
                return Err(BackendError::Other(format!(
                    "task {} belongs to flow {}, not {}",
                    task.id, task.flow_id, flow.id
                )));
            }
            if let Some(dep) = task.depends_on.iter().find(|d| !flow.task_ids.contains(d)) {
                return Err(BackendError::Other(format!(
                    "task {} depends on {} outside its flow",
                    task.id, dep
                )));
            }
        }

        let flow_key = self.flow_key(&flow.id);
        let mut conn = self.client.conn.clone();
        let exists: bool = conn.exists(&flow_key).await.map_err(io)?;
        if exists {
            return Err(BackendError::Conflict(format!("flow {} already exists", flow.id)));
        }

        // MULTI/EXEC: the whole graph becomes visible at once or not at all.
        let mut pipe = redis::pipe();
        pipe.atomic();
        for task in &tasks {
            let data = serde_json::to_string(task).map_err(ser)?;
            pipe.hset_multiple(
                self.task_key(&task.id),
                &[("status", task.status.as_str()), ("rev", "0"), ("data", data.as_str())],
            )
            .ignore();
            if task.status == TaskStatus::Pending {
                pipe.sadd(self.pending_key(), &task.id).ignore();
            }
        }
        let data = serde_json::to_string(&flow).map_err(ser)?;
        pipe.hset_multiple(
            &flow_key,
            &[("status", flow.status.as_str()), ("rev", "0"), ("data", data.as_str())],
        )
        .ignore();
        pipe.zadd(self.flows_key(), &flow.id, flow.created_at.timestamp_millis())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(io)?;

        trace!(tasks = tasks.len(), "Created flow {}", flow.id);
        Ok(flow.id)
    }

    #[instrument(skip(self), level = "trace")]
    async fn get_flow(&self, flow_id: &str) -> Result<Flow, BackendError> {
        let mut conn = self.client.conn.clone();
        let data: Option<String> = conn.hget(self.flow_key(flow_id), "data").await.map_err(io)?;
        match data {
            Some(d) => decode(&d),
            None => Err(BackendError::NotFound(format!("flow {flow_id}"))),
        }
    }

    #[instrument(skip(self, filter), level = "trace")]
    async fn list_flows(&self, filter: &FlowFilter, page: Page) -> Result<Vec<Flow>, BackendError> {
        if page.limit == 0 {
            return Ok(Vec::new());
        }
        if let Some(ids) = &filter.ids {
            let keys: Vec<String> = ids.iter().map(|id| self.flow_key(id)).collect();
            let mut flows: Vec<Flow> = self.load_many(&keys).await?;
            flows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            return Ok(flows
                .into_iter()
                .filter(|f| filter.matches(f))
                .skip(page.offset)
                .take(page.limit)
                .collect());
        }

        let mut conn = self.client.conn.clone();
        if filter.status.is_none() && filter.template.is_none() {
            // The index is already in creation order.
            let start = page.offset as isize;
            let stop = page.offset.saturating_add(page.limit - 1) as isize;
            let ids: Vec<String> = conn.zrange(self.flows_key(), start, stop).await.map_err(io)?;
            let keys: Vec<String> = ids.iter().map(|id| self.flow_key(id)).collect();
            return self.load_many(&keys).await;
        }

        // Walk the index a chunk at a time until the page is full.
        let chunk = page.limit.max(LIST_CHUNK);
        let mut skipped = 0;
        let mut flows = Vec::with_capacity(page.limit);
        let mut start = 0;
        loop {
            let ids: Vec<String> = conn
                .zrange(self.flows_key(), start as isize, (start + chunk - 1) as isize)
                .await
                .map_err(io)?;
            let keys: Vec<String> = ids.iter().map(|id| self.flow_key(id)).collect();
            for flow in self.load_many::<Flow>(&keys).await? {
                if !filter.matches(&flow) {
                    continue;
                }
                if skipped < page.offset {
                    skipped += 1;
                    continue;
                }
                flows.push(flow);
                if flows.len() == page.limit {
                    return Ok(flows);
                }
            }
            if ids.len() < chunk {
                return Ok(flows);
            }
            start += chunk;
        }
    }

    #[instrument(skip(self), level = "trace")]
    async fn get_tasks(&self, flow_id: &str) -> Result<Vec<Task>, BackendError> {
        let flow = self.get_flow(flow_id).await?;
        let keys: Vec<String> = flow.task_ids.iter().map(|id| self.task_key(id)).collect();
        self.load_many(&keys).await
    }

    #[instrument(skip(self), level = "trace")]
    async fn get_task(&self, task_id: &str) -> Result<Task, BackendError> {
        let mut conn = self.client.conn.clone();
        let data: Option<String> = conn.hget(self.task_key(task_id), "data").await.map_err(io)?;
        match data {
            Some(d) => decode(&d),
            None => Err(BackendError::NotFound(format!("task {task_id}"))),
        }
    }

    #[instrument(skip(self, patch), level = "trace")]
    async fn compare_and_set_task_status(
        &self,
        task_id: &str,
        expected: TaskStatus,
        new: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool, BackendError> {
        let written = self
            .cas_task(task_id, expected, |task| {
                patch.apply(task, new);
                new
            })
            .await?;
        Ok(written.is_some())
    }

    #[instrument(skip(self, reason), level = "trace")]
    async fn update_flow_status(
        &self,
        flow_id: &str,
        status: FlowStatus,
        reason: Option<FlowReason>,
    ) -> Result<bool, BackendError> {
        let key = self.flow_key(flow_id);
        for _ in 0..MAX_CAS_ROUNDS {
            let Some((stored, rev, data)) = self.read_row(&key).await? else {
                return Err(BackendError::NotFound(format!("flow {flow_id}")));
            };
            let mut flow: Flow = decode(&data)?;
            if flow.status.is_terminal() {
                trace!(flow_id, stored = %stored, "Flow already terminal");
                return Ok(false);
            }
            flow.status = status;
            if reason.is_some() {
                flow.reason = reason.clone();
            }
            flow.updated_at = Utc::now();
            let encoded = serde_json::to_string(&flow).map_err(ser)?;

            let mut conn = self.client.conn.clone();
            let outcome: i64 = self
                .flow_update
                .key(&key)
                .arg(&rev)
                .arg(status.as_str())
                .arg(encoded)
                .invoke_async(&mut conn)
                .await
                .map_err(io)?;
            match outcome {
                WRITTEN => return Ok(true),
                REJECTED => return Ok(false),
                MISSING => return Err(BackendError::NotFound(format!("flow {flow_id}"))),
                STALE => trace!(flow_id, "Revision moved, retrying flow update"),
                other => return Err(BackendError::Other(format!("unexpected script reply {other}"))),
            }
        }
        Err(BackendError::Conflict(format!("flow {flow_id} kept changing")))
    }

    #[instrument(skip(self), level = "trace")]
    async fn list_ready_tasks(&self, limit: usize) -> Result<Vec<Task>, BackendError> {
        let now = Utc::now();
        let mut conn = self.client.conn.clone();
        let mut ids: Vec<String> = conn.smembers(self.pending_key()).await.map_err(io)?;
        let due: Vec<String> = conn
            .zrangebyscore(self.retrying_key(), "-inf", now.timestamp_millis())
            .await
            .map_err(io)?;
        ids.extend(due);

        let keys: Vec<String> = ids.iter().map(|id| self.task_key(id)).collect();
        let mut candidates: Vec<Task> = self.load_many(&keys).await?;
        candidates.retain(|t| t.is_due(now));
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.step.cmp(&b.step)));

        // One round trip for the dependency statuses of every candidate.
        let mut dep_ids: Vec<String> = candidates
            .iter()
            .flat_map(|t| t.depends_on.iter().cloned())
            .collect();
        dep_ids.sort();
        dep_ids.dedup();
        let statuses = self.statuses(&dep_ids).await?;
        let status_of: HashMap<&str, Option<TaskStatus>> = dep_ids
            .iter()
            .map(String::as_str)
            .zip(statuses)
            .collect();

        Ok(candidates
            .into_iter()
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|d| status_of.get(d.as_str()).copied().flatten() == Some(TaskStatus::Success))
            })
            .take(limit)
            .collect())
    }

    #[instrument(skip(self), level = "trace")]
    async fn reclaim_stale_running(
        &self,
        lease_timeout: Duration,
        default_max_attempts: u32,
    ) -> Result<Vec<Task>, BackendError> {
        let now = Utc::now();
        let cutoff = (now - chrono_duration(lease_timeout)).timestamp_millis();
        let mut conn = self.client.conn.clone();
        let stale: Vec<String> = conn
            .zrangebyscore(self.running_key(), "-inf", format!("({cutoff}"))
            .await
            .map_err(io)?;

        let mut reclaimed = Vec::new();
        for task_id in stale {
            let outcome = self
                .cas_task(&task_id, TaskStatus::Running, |task| {
                    let (status, patch) = reclaim_transition(task, default_max_attempts, now);
                    patch.apply(task, status);
                    status
                })
                .await;
            match outcome {
                Ok(Some(task)) => reclaimed.push(task),
                Ok(None) => {}
                Err(e) => warn!(task_id, error = %e, "Failed to reclaim task"),
            }
        }
        Ok(reclaimed)
    }
}
