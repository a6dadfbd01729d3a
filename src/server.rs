use crate::error::{ProxyError, Result};
use crate::relay::{ChunkStream, Relay};
use crate::trace::TraceRecorder;
use crate::types::{ChatRequest, Dialect};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub const SERVICE_NAME: &str = "openrouter-proxy";
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub recorder: TraceRecorder,
    /// Key inbound callers must send in `x-api-key`; `None` disables the check.
    pub inbound_api_key: Option<String>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let guarded = Router::new()
        .route("/models", get(handle_models))
        .route("/health", get(handle_health))
        .route("/chat/completions", post(handle_chat_completions))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/messages", post(handle_messages))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ));

    Router::new()
        .route("/", get(handle_root))
        .merge(guarded)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(ref expected) = state.inbound_api_key {
        let presented = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return ProxyError::Unauthorized.into_response();
        }
    }
    next.run(request).await
}

async fn handle_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    relay_endpoint(&state, Dialect::OpenAi, &body).await
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    relay_endpoint(&state, Dialect::Anthropic, &body).await
}

async fn relay_endpoint(state: &AppState, dialect: Dialect, body: &[u8]) -> Response {
    match relay_response(state, dialect, body).await {
        Ok(resp) => resp,
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() && !matches!(e, ProxyError::Upstream { .. }) {
                tracing::error!(status = status.as_u16(), error = %e, "relay failed");
            } else {
                tracing::warn!(status = status.as_u16(), error = %e, "relay rejected");
            }
            e.into_response()
        }
    }
}

async fn relay_response(state: &AppState, dialect: Dialect, body: &[u8]) -> Result<Response> {
    let request = parse_request(body)?;
    let (request, correlation_id) = dialect.prepare(request);
    let streaming = request.is_streaming();

    let chunks = state.relay.relay(request, correlation_id, &state.recorder);

    if streaming {
        stream_response(chunks).await
    } else {
        buffered_response(chunks).await
    }
}

fn parse_request(body: &[u8]) -> Result<ChatRequest> {
    serde_json::from_slice(body).map_err(|e| {
        if e.is_data() {
            ProxyError::client_input(format!("Invalid request body: {e}"))
        } else {
            ProxyError::client_input("Invalid JSON in request body")
        }
    })
}

/// Wait for the first chunk so an upstream failure can still set the status
/// line, then relay the rest as it arrives.
async fn stream_response(mut chunks: ChunkStream) -> Result<Response> {
    let first = chunks.next().await.transpose()?;

    let rest = chunks.map(|item| Ok::<_, Infallible>(item.unwrap_or_else(|e| error_frame(&e))));
    let body = stream::iter(first.map(Ok::<_, Infallible>)).chain(rest);

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .map_err(|e| ProxyError::internal(e.to_string()))
}

async fn buffered_response(mut chunks: ChunkStream) -> Result<Response> {
    let body = chunks
        .next()
        .await
        .transpose()?
        .ok_or_else(|| ProxyError::internal("upstream returned no response"))?;

    Ok(([(CONTENT_TYPE, "application/json")], body).into_response())
}

/// Final SSE frame sent when the relay fails after the stream has started.
fn error_frame(error: &ProxyError) -> Bytes {
    let payload = json!({
        "error": {
            "message": error.detail(),
            "code": error.status_code().as_u16(),
        }
    });
    Bytes::from(format!("data: {payload}\n\n"))
}

async fn handle_models() -> Json<serde_json::Value> {
    Json(json!({ "message": "Success: /models path hit" }))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
    }))
}

async fn handle_root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "OpenRouter Proxy with Langfuse",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/models", "/chat/completions", "/v1/messages", "/health"],
        "authentication": "Required (x-api-key header)",
        "auth_enforced": state.inbound_api_key.is_some(),
    }))
}
