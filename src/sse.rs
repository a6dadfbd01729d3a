//! Server-Sent-Events handling for relayed completion streams.
//!
//! Lines are relayed to the client verbatim; this module only splits the
//! upstream byte stream into lines and reads what the trace needs out of them.

use serde_json::Value;

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";

/// Splits a byte stream into lines, holding partial lines (and partial UTF-8
/// sequences) until the rest arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk, returning every line it completed.
    /// Line terminators (`\n` or `\r\n`) are stripped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Flush whatever is left once the upstream body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// What a single relayed line means for the trace.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// Comments, `event:` fields and anything else that isn't `data:`.
    NotData,
    /// The end-of-stream sentinel.
    Done,
    /// A parsed JSON chunk.
    Chunk {
        delta: Option<String>,
        usage: Option<Value>,
    },
    /// A `data:` payload that isn't valid JSON. Skipped.
    Malformed,
}

pub fn inspect_line(line: &str) -> LineEvent {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineEvent::NotData;
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);

    if payload.trim() == DONE_SENTINEL {
        return LineEvent::Done;
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(chunk) => LineEvent::Chunk {
            delta: delta_content(&chunk).map(str::to_string),
            usage: usage_of(&chunk),
        },
        Err(_) => LineEvent::Malformed,
    }
}

/// `choices[0].delta.content` of a streaming chunk.
pub fn delta_content(chunk: &Value) -> Option<&str> {
    chunk
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}

/// Generated text and usage extracted from a complete (non-streaming) body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOutput {
    pub text: String,
    pub usage: Option<Value>,
}

pub fn completion_output(body: &Value) -> CompletionOutput {
    let text = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    CompletionOutput {
        text,
        usage: usage_of(body),
    }
}

fn usage_of(value: &Value) -> Option<Value> {
    value.get("usage").filter(|u| u.is_object()).cloned()
}

/// Re-frame a relayed line as its own SSE event.
pub fn frame(line: &str) -> String {
    format!("{line}\n\n")
}
