use super::{RelayTrace, TraceSink};
use crate::error::Result;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceEventKind {
    GenerationCreate,
    GenerationUpdate,
}

/// One line of the trace file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub event: TraceEventKind,
    pub trace: RelayTrace,
}

/// Appends trace events to a JSON-lines file. Writes are buffered and only
/// guaranteed on disk after `flush`.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, event: TraceEventKind, trace: &RelayTrace) {
        let entry = TraceEvent {
            timestamp: Utc::now(),
            event,
            trace: trace.clone(),
        };
        let Ok(json) = serde_json::to_string(&entry) else {
            return;
        };
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(e) = writeln!(writer, "{json}") {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to write trace event");
            }
        }
    }
}

#[async_trait]
impl TraceSink for JsonlSink {
    fn generation_started(&self, trace: &RelayTrace) {
        self.write(TraceEventKind::GenerationCreate, trace);
    }

    fn generation_finished(&self, trace: &RelayTrace) {
        self.write(TraceEventKind::GenerationUpdate, trace);
    }

    async fn flush(&self) -> Result<()> {
        if let Ok(mut writer) = self.writer.lock() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{TraceRecorder, TraceStatus};
    use crate::types::{ChatMessage, ChatRequest};
    use std::sync::Arc;

    #[test]
    fn writes_create_and_update_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("traces.jsonl");
        let sink = Arc::new(JsonlSink::new(&path).unwrap());
        let recorder = TraceRecorder::new(sink.clone());

        let req = ChatRequest::new("openai/gpt-4o", vec![ChatMessage::new("user", "hi")]);
        let mut trace = recorder.start(&req, Some("s-9"));
        trace.set_output("hello".to_string());
        trace.succeed();
        drop(trace);
        tokio_test::block_on(recorder.flush()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let events: Vec<TraceEvent> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, TraceEventKind::GenerationCreate);
        assert_eq!(events[1].event, TraceEventKind::GenerationUpdate);
        assert_eq!(events[1].trace.output, "hello");
        assert_eq!(events[1].trace.status, TraceStatus::Ok);
        assert_eq!(events[0].trace.id, events[1].trace.id);
        assert_eq!(events[0].trace.correlation_id.as_deref(), Some("s-9"));
    }
}
