//! Lua scripts for the compare-and-set transitions.
//!
//! Rows are hashes with `status`, `rev` and `data` fields. A script only
//! writes when the stored status and revision are the ones the caller read,
//! so the JSON in `data` is always replaced as a whole.

use redis::Script;

/// KEYS: task row, pending set, retrying zset, running zset.
/// ARGV: task id, expected status, expected rev, new status, data,
/// retry-at score, running-since score.
///
/// Returns 1 on write, 0 on status mismatch, -1 on revision mismatch and
/// -2 if the row does not exist.
const TASK_CAS: &str = r#"
local cur = redis.call('HMGET', KEYS[1], 'status', 'rev')
if not cur[1] then return -2 end
if cur[1] ~= ARGV[2] then return 0 end
if cur[2] ~= ARGV[3] then return -1 end
redis.call('HSET', KEYS[1], 'status', ARGV[4], 'rev', tonumber(ARGV[3]) + 1, 'data', ARGV[5])
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
if ARGV[4] == 'pending' then
  redis.call('SADD', KEYS[2], ARGV[1])
elseif ARGV[4] == 'retrying' then
  redis.call('ZADD', KEYS[3], ARGV[6], ARGV[1])
elseif ARGV[4] == 'running' then
  redis.call('ZADD', KEYS[4], ARGV[7], ARGV[1])
end
return 1
"#;

/// KEYS: flow row. ARGV: expected rev, new status, data.
///
/// Returns 1 on write, 0 if the flow is already terminal, -1 on revision
/// mismatch and -2 if the row does not exist.
const FLOW_UPDATE: &str = r#"
local cur = redis.call('HMGET', KEYS[1], 'status', 'rev')
if not cur[1] then return -2 end
if cur[1] == 'success' or cur[1] == 'failed' or cur[1] == 'cancelled' then return 0 end
if cur[2] ~= ARGV[1] then return -1 end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'rev', tonumber(ARGV[1]) + 1, 'data', ARGV[3])
return 1
"#;

pub(crate) const WRITTEN: i64 = 1;
pub(crate) const REJECTED: i64 = 0;
pub(crate) const STALE: i64 = -1;
pub(crate) const MISSING: i64 = -2;

pub(crate) fn task_cas() -> Script {
    Script::new(TASK_CAS)
}

pub(crate) fn flow_update() -> Script {
    Script::new(FLOW_UPDATE)
}
