//! Generation tracing.
//!
//! Every relay call opens a [`RelayTrace`] through the [`TraceRecorder`] and
//! closes it exactly once: on success, on failure, or when the stream is
//! dropped before it finished. Records go to a [`TraceSink`], which may buffer
//! them until [`TraceRecorder::flush`] is called.

pub mod jsonl;
pub mod langfuse;
pub mod sinks;

use crate::config::{SinkKind, TracesConfig};
use crate::error::{ProxyError, Result};
use crate::types::{ChatMessage, ChatRequest};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub use jsonl::JsonlSink;
pub use langfuse::LangfuseSink;
pub use sinks::{LogSink, MemorySink, NoopSink};

pub const GENERATION_NAME: &str = "openrouter_chat_completion";
pub const CANCELLED_MESSAGE: &str = "stream cancelled before completion";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Ok,
    Error { message: String },
}

/// One relay invocation as seen by the observability backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayTrace {
    pub id: String,
    pub name: String,
    pub model: String,
    pub input: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub metadata: Value,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    pub status: TraceStatus,
}

impl RelayTrace {
    fn open(request: &ChatRequest, correlation_id: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: GENERATION_NAME.to_string(),
            model: request.model.clone(),
            input: request.messages.clone(),
            correlation_id: correlation_id.map(str::to_string),
            metadata: serde_json::json!({
                "session_id": correlation_id,
                "stream": request.is_streaming(),
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
            }),
            started_at: Utc::now(),
            ended_at: None,
            output: String::new(),
            usage: None,
            status: TraceStatus::Running,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, TraceStatus::Error { .. })
    }
}

/// Destination for trace records.
///
/// The record calls are synchronous so they can run from a `Drop` impl;
/// sinks that talk to the network buffer and send on `flush`.
#[async_trait]
pub trait TraceSink: Send + Sync {
    fn generation_started(&self, trace: &RelayTrace);

    fn generation_finished(&self, trace: &RelayTrace);

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Process-wide handle to the trace sink, created at startup and shared by
/// every request.
#[derive(Clone)]
pub struct TraceRecorder {
    sink: Arc<dyn TraceSink>,
}

impl TraceRecorder {
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self { sink }
    }

    /// Open a trace for a request that is about to be relayed.
    pub fn start(&self, request: &ChatRequest, correlation_id: Option<&str>) -> ActiveTrace {
        let trace = RelayTrace::open(request, correlation_id);
        self.sink.generation_started(&trace);
        ActiveTrace {
            trace,
            sink: Arc::clone(&self.sink),
            finished: false,
        }
    }

    pub async fn flush(&self) -> Result<()> {
        self.sink.flush().await
    }

    /// Flush on a fixed interval until the task is aborted.
    pub fn spawn_periodic_flush(&self, every: Duration) -> JoinHandle<()> {
        let recorder = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = recorder.flush().await {
                    tracing::warn!(error = %e, "periodic trace flush failed");
                }
            }
        })
    }
}

/// A trace owned by one relay call.
///
/// Dropping it before [`succeed`](Self::succeed) or [`fail`](Self::fail)
/// records it as cancelled, keeping whatever output had been streamed.
#[must_use]
pub struct ActiveTrace {
    trace: RelayTrace,
    sink: Arc<dyn TraceSink>,
    finished: bool,
}

impl ActiveTrace {
    pub fn id(&self) -> &str {
        &self.trace.id
    }

    pub fn push_delta(&mut self, delta: &str) {
        self.trace.output.push_str(delta);
    }

    pub fn set_output(&mut self, output: String) {
        self.trace.output = output;
    }

    pub fn set_usage(&mut self, usage: Value) {
        self.trace.usage = Some(usage);
    }

    pub fn succeed(&mut self) {
        self.finish(TraceStatus::Ok);
    }

    /// Annotate the trace with `error`. The caller still owns the error and
    /// is expected to pass it on.
    pub fn fail(&mut self, error: &ProxyError) {
        self.finish(TraceStatus::Error {
            message: error.to_string(),
        });
    }

    fn finish(&mut self, status: TraceStatus) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.trace.status = status;
        self.trace.ended_at = Some(Utc::now());
        self.sink.generation_finished(&self.trace);
    }
}

impl Drop for ActiveTrace {
    fn drop(&mut self) {
        self.finish(TraceStatus::Error {
            message: CANCELLED_MESSAGE.to_string(),
        });
    }
}

/// Build the sink selected in the configuration.
pub fn sink_from_config(config: &TracesConfig, client: reqwest::Client) -> Result<Arc<dyn TraceSink>> {
    let sink: Arc<dyn TraceSink> = match config.sink {
        SinkKind::None => Arc::new(NoopSink),
        SinkKind::Log => Arc::new(LogSink),
        SinkKind::Jsonl => Arc::new(JsonlSink::new(&config.path)?),
        SinkKind::Langfuse => {
            let lf = &config.langfuse;
            let public_key = std::env::var(&lf.public_key_env).map_err(|_| {
                ProxyError::config(format!("Environment variable '{}' not set", lf.public_key_env))
            })?;
            let secret_key = std::env::var(&lf.secret_key_env).map_err(|_| {
                ProxyError::config(format!("Environment variable '{}' not set", lf.secret_key_env))
            })?;
            Arc::new(
                LangfuseSink::new(client, &lf.host, public_key, secret_key)
                    .with_limits(lf.max_queue, lf.batch_size),
            )
        }
    };
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        let mut req = ChatRequest::new("openai/gpt-4o", vec![ChatMessage::new("user", "hi")]);
        req.stream = Some(true);
        req.temperature = Some(0.2);
        req
    }

    #[test]
    fn start_records_context() {
        let sink = Arc::new(MemorySink::new());
        let recorder = TraceRecorder::new(sink.clone());

        let mut trace = recorder.start(&request(), Some("s-1"));
        trace.succeed();

        let started = sink.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].model, "openai/gpt-4o");
        assert_eq!(started[0].correlation_id.as_deref(), Some("s-1"));
        assert_eq!(started[0].metadata["stream"], true);
        assert_eq!(started[0].metadata["temperature"], 0.2);
        assert_eq!(started[0].status, TraceStatus::Running);
    }

    #[test]
    fn success_carries_output_and_usage() {
        let sink = Arc::new(MemorySink::new());
        let recorder = TraceRecorder::new(sink.clone());

        let mut trace = recorder.start(&request(), None);
        trace.push_delta("a");
        trace.push_delta("b");
        trace.set_usage(serde_json::json!({"total_tokens": 3}));
        trace.succeed();
        drop(trace);

        let finished = sink.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].output, "ab");
        assert_eq!(finished[0].usage, Some(serde_json::json!({"total_tokens": 3})));
        assert_eq!(finished[0].status, TraceStatus::Ok);
        assert!(finished[0].ended_at.is_some());
    }

    #[test]
    fn terminal_update_happens_once() {
        let sink = Arc::new(MemorySink::new());
        let recorder = TraceRecorder::new(sink.clone());

        let mut trace = recorder.start(&request(), None);
        trace.fail(&ProxyError::upstream(500, "down"));
        trace.succeed();
        drop(trace);

        let finished = sink.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(
            finished[0].status,
            TraceStatus::Error {
                message: "Upstream API error (500): down".to_string()
            }
        );
    }

    #[test]
    fn dropped_trace_is_recorded_as_cancelled() {
        let sink = Arc::new(MemorySink::new());
        let recorder = TraceRecorder::new(sink.clone());

        let mut trace = recorder.start(&request(), None);
        trace.push_delta("partial");
        drop(trace);

        let finished = sink.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].output, "partial");
        assert_eq!(
            finished[0].status,
            TraceStatus::Error {
                message: CANCELLED_MESSAGE.to_string()
            }
        );
    }

    #[test]
    fn flush_reaches_sink() {
        let sink = Arc::new(MemorySink::new());
        let recorder = TraceRecorder::new(sink.clone());
        tokio_test::block_on(recorder.flush()).unwrap();
        tokio_test::block_on(recorder.flush()).unwrap();
        assert_eq!(sink.flush_count(), 2);
    }
}
