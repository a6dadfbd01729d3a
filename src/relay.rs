//! Forwarding of chat-completion requests to the upstream provider.
//!
//! [`Relay::relay`] returns a lazy stream: nothing is sent until the caller
//! first polls it. A streaming request yields one SSE frame per upstream
//! line as soon as it arrives; a buffered request yields the upstream body
//! once, exactly as received. Failures arrive as the stream's last item.

use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};
use crate::sse::{self, LineEvent, LineSplitter};
use crate::trace::{ActiveTrace, TraceRecorder};
use crate::types::ChatRequest;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Clone)]
pub struct Relay {
    client: reqwest::Client,
    upstream: Arc<UpstreamConfig>,
}

impl Relay {
    pub fn new(client: reqwest::Client, upstream: UpstreamConfig) -> Self {
        Self {
            client,
            upstream: Arc::new(upstream),
        }
    }

    /// Relay `request` upstream under a trace opened on `recorder`.
    ///
    /// `request` must already be in upstream form (see
    /// [`Dialect::prepare`](crate::types::Dialect::prepare)).
    pub fn relay(
        &self,
        request: ChatRequest,
        correlation_id: Option<String>,
        recorder: &TraceRecorder,
    ) -> ChunkStream {
        let trace = recorder.start(&request, correlation_id.as_deref());

        tracing::info!(
            trace_id = %trace.id(),
            model = %request.model,
            stream = request.is_streaming(),
            session_id = correlation_id.as_deref().unwrap_or("-"),
            "relaying chat completion"
        );

        let call = UpstreamCall {
            client: self.client.clone(),
            upstream: Arc::clone(&self.upstream),
            request,
            correlation_id,
        };

        if call.request.is_streaming() {
            Box::pin(call.streaming(trace))
        } else {
            Box::pin(call.buffered(trace))
        }
    }
}

struct UpstreamCall {
    client: reqwest::Client,
    upstream: Arc<UpstreamConfig>,
    request: ChatRequest,
    correlation_id: Option<String>,
}

impl UpstreamCall {
    async fn send(&self) -> Result<reqwest::Response> {
        let api_key = self.upstream.resolve_api_key()?;
        let url = self.upstream.completions_url();

        tracing::debug!(
            url = %url,
            body = %serde_json::to_string(&self.request).unwrap_or_default(),
            "POST upstream"
        );

        let mut builder = self
            .client
            .post(&url)
            .timeout(self.upstream.timeout())
            .bearer_auth(api_key)
            .header("HTTP-Referer", &self.upstream.referer)
            .header("X-Title", &self.upstream.title)
            .json(&self.request);

        if let Some(ref session_id) = self.correlation_id {
            builder = builder.header("X-Session-Id", session_id);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %body, "upstream returned an error");
            return Err(ProxyError::upstream(status.as_u16(), body));
        }

        Ok(response)
    }

    async fn fetch_body(&self) -> Result<(Bytes, serde_json::Value)> {
        let body = self.send().await?.bytes().await?;
        let value = serde_json::from_slice(&body).map_err(|e| {
            ProxyError::internal(format!("upstream returned invalid JSON: {e}"))
        })?;
        Ok((body, value))
    }

    fn buffered(self, trace: ActiveTrace) -> impl Stream<Item = Result<Bytes>> + Send {
        async_stream::stream! {
            let mut trace = trace;
            match self.fetch_body().await {
                Ok((body, value)) => {
                    let output = sse::completion_output(&value);
                    trace.set_output(output.text);
                    if let Some(usage) = output.usage {
                        trace.set_usage(usage);
                    }
                    trace.succeed();
                    yield Ok(body);
                }
                Err(e) => {
                    trace.fail(&e);
                    yield Err(e);
                }
            }
        }
    }

    fn streaming(self, trace: ActiveTrace) -> impl Stream<Item = Result<Bytes>> + Send {
        async_stream::stream! {
            let mut trace = trace;
            let response = match self.send().await {
                Ok(r) => r,
                Err(e) => {
                    trace.fail(&e);
                    yield Err(e);
                    return;
                }
            };

            let mut body = response.bytes_stream();
            let mut lines = LineSplitter::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let e = ProxyError::from(e);
                        tracing::warn!(error = %e, "upstream stream broke off");
                        trace.fail(&e);
                        yield Err(e);
                        return;
                    }
                };

                for line in lines.push(&chunk) {
                    if line.is_empty() {
                        continue;
                    }
                    let done = observe_line(&mut trace, &line);
                    if done {
                        trace.succeed();
                    }
                    yield Ok(Bytes::from(sse::frame(&line)));
                    if done {
                        return;
                    }
                }
            }

            if let Some(line) = lines.finish().filter(|l| !l.is_empty()) {
                observe_line(&mut trace, &line);
                trace.succeed();
                yield Ok(Bytes::from(sse::frame(&line)));
            }

            trace.succeed();
        }
    }
}

/// Record what `line` contributes to the trace. Returns true on the
/// end-of-stream sentinel.
fn observe_line(trace: &mut ActiveTrace, line: &str) -> bool {
    match sse::inspect_line(line) {
        LineEvent::Done => true,
        LineEvent::Chunk { delta, usage } => {
            if let Some(delta) = delta {
                trace.push_delta(&delta);
            }
            if let Some(usage) = usage {
                trace.set_usage(usage);
            }
            false
        }
        LineEvent::Malformed => {
            tracing::debug!(line = %line, "skipping unparseable stream chunk");
            false
        }
        LineEvent::NotData => false,
    }
}
