use crate::types::{JobRecord, JobStatus, JudgeJob};
use redis::{AsyncCommands, RedisResult};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Redis queue semantics shared by the API (producer) and the worker (consumer).
/// Keys are deterministic so both sides agree without coordination.

pub const QUEUE_KEY: &str = "tribunal:queue:judge";
pub const RESULT_PREFIX: &str = "tribunal:result";
pub const STATUS_PREFIX: &str = "tribunal:status";

/// Results and statuses expire after 24 hours
pub const RESULT_TTL_SECONDS: u64 = 86_400;

pub fn result_key(job_id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

pub fn status_key(job_id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

fn encode<T: Serialize>(value: &T) -> RedisResult<String> {
    serde_json::to_string(value).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
    })
}

fn decode<T: DeserializeOwned>(payload: &str) -> RedisResult<T> {
    serde_json::from_str(payload).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
    })
}

/// Enqueue a job (RPUSH, FIFO) and mark it queued
pub async fn push_job(conn: &mut redis::aio::ConnectionManager, job: &JudgeJob) -> RedisResult<()> {
    let payload = encode(job)?;
    set_status(conn, &job.id, JobStatus::Queued).await?;
    conn.rpush(QUEUE_KEY, payload).await
}

/// Pop the next job, blocking up to `timeout_seconds` so callers can check for shutdown
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<JudgeJob>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => decode(&payload).map(Some),
        None => Ok(None),
    }
}

pub async fn set_status(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
    status: JobStatus,
) -> RedisResult<()> {
    let payload = encode(&status)?;
    conn.set_ex(status_key(job_id), payload, RESULT_TTL_SECONDS as _).await
}

pub async fn get_status(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
) -> RedisResult<Option<JobStatus>> {
    let payload: Option<String> = conn.get(status_key(job_id)).await?;
    payload.map(|data| decode(&data)).transpose()
}

/// Store a finished job record; the status key flips to `completed` alongside it
pub async fn store_result(conn: &mut redis::aio::ConnectionManager, record: &JobRecord) -> RedisResult<()> {
    let payload = encode(record)?;
    let _: () = conn
        .set_ex(result_key(&record.job_id), payload, RESULT_TTL_SECONDS as _)
        .await?;
    set_status(conn, &record.job_id, JobStatus::Completed).await
}

pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
) -> RedisResult<Option<JobRecord>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;
    payload.map(|data| decode(&data)).transpose()
}
