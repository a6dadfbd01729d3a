//! Batched export to a Langfuse-compatible ingestion endpoint.
//!
//! Each relay produces three events: `trace-create` (grouping by session id),
//! `generation-create` and `generation-update`. Events are queued in memory
//! and posted in batches of at most `batch_size` on `flush`. The queue holds
//! at most `max_queue` events; past that the oldest are dropped.

use super::{RelayTrace, TraceSink};
use crate::error::{ProxyError, Result};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;

const INGESTION_PATH: &str = "/api/public/ingestion";

pub const DEFAULT_MAX_QUEUE: usize = 10_000;
pub const DEFAULT_BATCH_SIZE: usize = 500;

pub struct LangfuseSink {
    client: reqwest::Client,
    url: String,
    public_key: String,
    secret_key: String,
    max_queue: usize,
    batch_size: usize,
    queue: Mutex<VecDeque<Value>>,
}

impl LangfuseSink {
    pub fn new(
        client: reqwest::Client,
        host: &str,
        public_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: format!("{}{}", host.trim_end_matches('/'), INGESTION_PATH),
            public_key: public_key.into(),
            secret_key: secret_key.into(),
            max_queue: DEFAULT_MAX_QUEUE,
            batch_size: DEFAULT_BATCH_SIZE,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Override the queue cap and the per-request batch size. Both are at
    /// least one.
    pub fn with_limits(mut self, max_queue: usize, batch_size: usize) -> Self {
        self.max_queue = max_queue.max(1);
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or_default()
    }

    fn enqueue(&self, kind: &str, body: Value) {
        let event = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "timestamp": Utc::now().to_rfc3339(),
            "type": kind,
            "body": body,
        });
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(event);
            self.enforce_cap(&mut queue);
        }
    }

    fn take_batch(&self) -> Vec<Value> {
        self.queue
            .lock()
            .map(|mut q| {
                let n = q.len().min(self.batch_size);
                q.drain(..n).collect()
            })
            .unwrap_or_default()
    }

    /// Put an unsent batch back ahead of newer events.
    fn requeue(&self, batch: Vec<Value>) {
        if let Ok(mut queue) = self.queue.lock() {
            for event in batch.into_iter().rev() {
                queue.push_front(event);
            }
            self.enforce_cap(&mut queue);
        }
    }

    fn enforce_cap(&self, queue: &mut VecDeque<Value>) {
        let excess = queue.len().saturating_sub(self.max_queue);
        if excess > 0 {
            queue.drain(..excess);
            tracing::warn!(
                dropped = excess,
                max_queue = self.max_queue,
                "trace queue full, dropped oldest events"
            );
        }
    }

    async fn post(&self, batch: &[Value]) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(&json!({ "batch": batch }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::upstream(status.as_u16(), body));
        }
        Ok(())
    }
}

#[async_trait]
impl TraceSink for LangfuseSink {
    fn generation_started(&self, trace: &RelayTrace) {
        self.enqueue(
            "trace-create",
            json!({
                "id": trace.id,
                "name": trace.name,
                "sessionId": trace.correlation_id,
                "timestamp": trace.started_at.to_rfc3339(),
            }),
        );
        self.enqueue(
            "generation-create",
            json!({
                "id": trace.id,
                "traceId": trace.id,
                "name": trace.name,
                "model": trace.model,
                "input": trace.input,
                "metadata": trace.metadata,
                "startTime": trace.started_at.to_rfc3339(),
            }),
        );
    }

    fn generation_finished(&self, trace: &RelayTrace) {
        let (level, status_message) = match &trace.status {
            super::TraceStatus::Error { message } => ("ERROR", Some(message.as_str())),
            _ => ("DEFAULT", None),
        };
        self.enqueue(
            "generation-update",
            json!({
                "id": trace.id,
                "traceId": trace.id,
                "endTime": trace.ended_at.map(|t| t.to_rfc3339()),
                "output": trace.output,
                "usage": trace.usage,
                "level": level,
                "statusMessage": status_message,
            }),
        );
    }

    /// Send queued events batch by batch. Stops at the first failure and
    /// keeps that batch and everything after it for the next flush.
    async fn flush(&self) -> Result<()> {
        let mut sent = 0;
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }
            if let Err(e) = self.post(&batch).await {
                self.requeue(batch);
                return Err(e);
            }
            sent += batch.len();
        }

        if sent > 0 {
            tracing::debug!(events = sent, "flushed trace events");
        }
        Ok(())
    }
}
