//! In-process sinks.

use super::{RelayTrace, TraceSink};
use crate::error::Result;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Discards every record.
pub struct NoopSink;

impl TraceSink for NoopSink {
    fn generation_started(&self, _trace: &RelayTrace) {}

    fn generation_finished(&self, _trace: &RelayTrace) {}
}

/// Emits each record as a structured `tracing` event.
pub struct LogSink;

impl TraceSink for LogSink {
    fn generation_started(&self, trace: &RelayTrace) {
        tracing::info!(
            trace_id = %trace.id,
            model = %trace.model,
            session_id = trace.correlation_id.as_deref().unwrap_or("-"),
            messages = trace.input.len(),
            stream = %trace.metadata["stream"],
            "generation started"
        );
    }

    fn generation_finished(&self, trace: &RelayTrace) {
        let elapsed_ms = trace
            .ended_at
            .map(|end| (end - trace.started_at).num_milliseconds())
            .unwrap_or_default();
        let usage = trace
            .usage
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();

        if trace.is_error() {
            tracing::warn!(
                trace_id = %trace.id,
                model = %trace.model,
                status = ?trace.status,
                output_chars = trace.output.len(),
                elapsed_ms,
                "generation failed"
            );
        } else {
            tracing::info!(
                trace_id = %trace.id,
                model = %trace.model,
                output_chars = trace.output.len(),
                usage = %usage,
                elapsed_ms,
                "generation completed"
            );
        }
    }
}

/// Keeps every record in memory. Useful in tests and when embedding the
/// proxy in another process.
#[derive(Default)]
pub struct MemorySink {
    started: Mutex<Vec<RelayTrace>>,
    finished: Mutex<Vec<RelayTrace>>,
    flushes: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<RelayTrace> {
        self.started.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn finished(&self) -> Vec<RelayTrace> {
        self.finished.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TraceSink for MemorySink {
    fn generation_started(&self, trace: &RelayTrace) {
        if let Ok(mut started) = self.started.lock() {
            started.push(trace.clone());
        }
    }

    fn generation_finished(&self, trace: &RelayTrace) {
        if let Ok(mut finished) = self.finished.lock() {
            finished.push(trace.clone());
        }
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
