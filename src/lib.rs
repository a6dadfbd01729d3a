pub mod config;
pub mod error;
pub mod normalize;
pub mod relay;
pub mod server;
pub mod sse;
pub mod trace;
pub mod types;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use normalize::normalize_model_id;
pub use relay::Relay;
pub use server::{build_router, AppState};
pub use trace::TraceRecorder;
