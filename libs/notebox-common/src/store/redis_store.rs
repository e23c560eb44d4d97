use super::{check_transition, StateStore};
use crate::error::{StoreError, StoreResult};
use crate::redis::{
    cancel_key, output_key, request_key, status_key, CAPACITY_KEY, COMPLETIONS_CHANNEL,
    PENDING_QUEUE, RUNNING_SET,
};
use crate::types::{
    CompletionEvent, ExecutionId, ExecutionOutput, ExecutionRequest, ExecutionState,
    ExecutionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;

/// Compare-and-set on the `state` field of a status hash.
/// ARGV: expected state, next state, timestamp field, timestamp value, detail.
const TRANSITION_LUA: &str = r#"
local current = redis.call('HGET', KEYS[1], 'state')
if current ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[2], ARGV[3], ARGV[4])
if ARGV[5] ~= '' then
    redis.call('HSET', KEYS[1], 'detail', ARGV[5])
end
return 1
"#;

/// Redis-backed store shared by API, CLI and workers
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    result_ttl: Option<Duration>,
    transition_script: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            result_ttl: None,
            transition_script: Script::new(TRANSITION_LUA),
        }
    }

    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    /// Expire finished executions after `ttl`; zero keeps them forever
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = if ttl.is_zero() { None } else { Some(ttl) };
        self
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn expire_finished(&self, id: &ExecutionId, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let mut pipe = redis::pipe();
        for key in [status_key(id), output_key(id), request_key(id), cancel_key(id)] {
            pipe.cmd("EXPIRE").arg(key).arg(secs).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

fn status_fields(status: &ExecutionStatus) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("state", status.state.to_string()),
        ("cell_id", status.cell_id.clone()),
        ("notebook_id", status.notebook_id.clone()),
        ("execution_count", status.execution_count.to_string()),
        ("created_at", status.created_at.to_rfc3339()),
    ];
    if let Some(started_at) = status.started_at {
        fields.push(("started_at", started_at.to_rfc3339()));
    }
    if let Some(completed_at) = status.completed_at {
        fields.push(("completed_at", completed_at.to_rfc3339()));
    }
    if let Some(detail) = &status.detail {
        fields.push(("detail", detail.clone()));
    }
    fields
}

fn parse_time(
    id: &ExecutionId,
    fields: &HashMap<String, String>,
    name: &str,
) -> StoreResult<Option<DateTime<Utc>>> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| StoreError::corrupt(*id, format!("{}: {}", name, e))),
    }
}

fn parse_status(
    id: &ExecutionId,
    fields: &HashMap<String, String>,
    output_count: u64,
) -> StoreResult<ExecutionStatus> {
    let required = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::corrupt(*id, format!("missing field {}", name)))
    };

    let state = required("state")?
        .parse::<ExecutionState>()
        .map_err(|e| StoreError::corrupt(*id, e))?;
    let execution_count = required("execution_count")?
        .parse::<u32>()
        .map_err(|e| StoreError::corrupt(*id, format!("execution_count: {}", e)))?;
    let created_at = parse_time(id, fields, "created_at")?
        .ok_or_else(|| StoreError::corrupt(*id, "missing field created_at"))?;

    Ok(ExecutionStatus {
        execution_id: *id,
        state,
        cell_id: required("cell_id")?,
        notebook_id: required("notebook_id")?,
        execution_count,
        created_at,
        started_at: parse_time(id, fields, "started_at")?,
        completed_at: parse_time(id, fields, "completed_at")?,
        output_count,
        detail: fields.get("detail").cloned(),
    })
}

fn timestamp_field(to: ExecutionState) -> &'static str {
    if to == ExecutionState::Running {
        "started_at"
    } else {
        "completed_at"
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn create(
        &self,
        request: &ExecutionRequest,
        status: &ExecutionStatus,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let id = &status.execution_id;
        let payload = serde_json::to_string(request)?;

        redis::pipe()
            .atomic()
            .set(request_key(id), payload)
            .ignore()
            .hset_multiple(status_key(id), &status_fields(status))
            .ignore()
            .rpush(PENDING_QUEUE, id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn request(&self, id: &ExecutionId) -> StoreResult<Option<ExecutionRequest>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(request_key(id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn status(&self, id: &ExecutionId) -> StoreResult<Option<ExecutionStatus>> {
        let mut conn = self.conn.clone();
        let (fields, output_count): (HashMap<String, String>, u64) = redis::pipe()
            .hgetall(status_key(id))
            .llen(output_key(id))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        parse_status(id, &fields, output_count).map(Some)
    }

    async fn transition(
        &self,
        id: &ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
        at: DateTime<Utc>,
        detail: Option<&str>,
    ) -> StoreResult<bool> {
        check_transition(from, to)?;

        let mut conn = self.conn.clone();
        let applied: i64 = self
            .transition_script
            .key(status_key(id))
            .arg(from.as_str())
            .arg(to.as_str())
            .arg(timestamp_field(to))
            .arg(at.to_rfc3339())
            .arg(detail.unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;

        let applied = applied == 1;
        if applied && to.is_terminal() {
            if let Some(ttl) = self.result_ttl {
                self.expire_finished(id, ttl).await?;
            }
        }
        Ok(applied)
    }

    async fn append_output(
        &self,
        id: &ExecutionId,
        output: &ExecutionOutput,
    ) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(output)?;
        let len: u64 = conn.rpush(output_key(id), payload).await?;
        Ok(len)
    }

    async fn outputs(&self, id: &ExecutionId, from: usize) -> StoreResult<Vec<ExecutionOutput>> {
        let mut conn = self.conn.clone();
        let start = isize::try_from(from).unwrap_or(isize::MAX);
        let raw: Vec<String> = conn.lrange(output_key(id), start, -1).await?;
        raw.iter()
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }

    async fn requeue(&self, id: &ExecutionId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(PENDING_QUEUE, id.to_string()).await?;
        Ok(())
    }

    async fn dequeue(&self) -> StoreResult<Option<ExecutionId>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.lpop(PENDING_QUEUE, None).await?;
        match raw {
            Some(raw) => match raw.parse::<ExecutionId>() {
                Ok(id) => Ok(Some(id)),
                Err(e) => {
                    tracing::warn!(entry = %raw, error = %e, "Dropping malformed queue entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn remove_pending(&self, id: &ExecutionId) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(PENDING_QUEUE, 0, id.to_string()).await?;
        Ok(removed > 0)
    }

    async fn pending_len(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(PENDING_QUEUE).await?)
    }

    async fn mark_running(&self, id: &ExecutionId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(RUNNING_SET, id.to_string()).await?;
        Ok(())
    }

    async fn clear_running(&self, id: &ExecutionId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(RUNNING_SET, id.to_string()).await?;
        Ok(())
    }

    async fn running_ids(&self) -> StoreResult<Vec<ExecutionId>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.smembers(RUNNING_SET).await?;
        Ok(raw.iter().filter_map(|r| r.parse().ok()).collect())
    }

    async fn running_count(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(RUNNING_SET).await?)
    }

    async fn request_cancel(&self, id: &ExecutionId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(cancel_key(id)).arg(1);
        if let Some(ttl) = self.result_ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn cancel_requested(&self, id: &ExecutionId) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(cancel_key(id)).await?)
    }

    async fn set_capacity(&self, max_concurrent: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(CAPACITY_KEY, max_concurrent).await?;
        Ok(())
    }

    async fn capacity(&self) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(CAPACITY_KEY).await?)
    }

    async fn publish_completion(&self, event: &CompletionEvent) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)?;
        conn.publish::<_, _, ()>(COMPLETIONS_CHANNEL, payload).await?;
        Ok(())
    }
}
