//! Error types for the proxy and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("{message}")]
    ClientInput { message: String },

    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("Upstream API error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("Request error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server configuration error: {message}")]
    Config { message: String },

    #[error("Unexpected error: {message}")]
    Internal { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProxyError {
    pub fn client_input(msg: impl Into<String>) -> Self {
        Self::ClientInput {
            message: msg.into(),
        }
    }

    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    /// HTTP status this error is reported with.
    ///
    /// Upstream errors keep the provider's status; a provider status that is
    /// not a valid error code falls back to 502.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ClientInput { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Transport(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Config { .. }
            | Self::Internal { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Toml(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Human-readable text for the `detail` field of error bodies.
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "detail": self.detail() }));
        if matches!(self, Self::Unauthorized) {
            return (status, [("www-authenticate", "ApiKey")], body).into_response();
        }
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
