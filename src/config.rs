use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub traces: TracesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_upstream_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_referer")]
    pub referer: String,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_inbound_key_env")]
    pub api_key_env: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    None,
    #[default]
    Log,
    Jsonl,
    Langfuse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracesConfig {
    #[serde(default)]
    pub sink: SinkKind,
    #[serde(default = "default_trace_path")]
    pub path: PathBuf,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default)]
    pub langfuse: LangfuseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LangfuseConfig {
    #[serde(default = "default_langfuse_host")]
    pub host: String,
    #[serde(default = "default_langfuse_public_env")]
    pub public_key_env: String,
    #[serde(default = "default_langfuse_secret_env")]
    pub secret_key_env: String,
    /// Events kept while the backend is unreachable; the oldest go first.
    #[serde(default = "default_langfuse_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_langfuse_batch_size")]
    pub batch_size: usize,
}

fn default_port() -> u16 {
    8000
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_upstream_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_referer() -> String {
    "http://localhost:8000".to_string()
}

fn default_title() -> String {
    "Graphiti Proxy Server".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_inbound_key_env() -> String {
    "API_KEY".to_string()
}

fn default_trace_path() -> PathBuf {
    PathBuf::from("traces.jsonl")
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_langfuse_host() -> String {
    "https://cloud.langfuse.com".to_string()
}

fn default_langfuse_public_env() -> String {
    "LANGFUSE_PUBLIC_KEY".to_string()
}

fn default_langfuse_secret_env() -> String {
    "LANGFUSE_SECRET_KEY".to_string()
}

fn default_langfuse_max_queue() -> usize {
    crate::trace::langfuse::DEFAULT_MAX_QUEUE
}

fn default_langfuse_batch_size() -> usize {
    crate::trace::langfuse::DEFAULT_BATCH_SIZE
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            upstream: UpstreamConfig::default(),
            auth: AuthConfig::default(),
            traces: TracesConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_upstream_key_env(),
            referer: default_referer(),
            title: default_title(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key_env: default_inbound_key_env(),
        }
    }
}

impl Default for TracesConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::default(),
            path: default_trace_path(),
            flush_interval_secs: default_flush_interval_secs(),
            langfuse: LangfuseConfig::default(),
        }
    }
}

impl Default for LangfuseConfig {
    fn default() -> Self {
        Self {
            host: default_langfuse_host(),
            public_key_env: default_langfuse_public_env(),
            secret_key_env: default_langfuse_secret_env(),
            max_queue: default_langfuse_max_queue(),
            batch_size: default_langfuse_batch_size(),
        }
    }
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults
    /// when none exists. An explicit path must exist.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Apply the environment variables the proxy has always honoured.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("PORT") {
            self.port = port
                .parse()
                .map_err(|_| ProxyError::config(format!("PORT is not a valid port: {port}")))?;
        }
        if let Some(referer) = lookup("HTTP_REFERER") {
            self.upstream.referer = referer;
        }
        if let Some(title) = lookup("X_TITLE") {
            self.upstream.title = title;
        }
        if let Some(host) = lookup("LANGFUSE_HOST") {
            self.traces.langfuse.host = host;
        }
        Ok(())
    }
}

impl UpstreamConfig {
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve the provider API key. Checked per request, not at startup.
    pub fn resolve_api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ProxyError::config(format!(
                    "Missing {} environment variable",
                    self.api_key_env
                ))
            })
    }
}

impl AuthConfig {
    /// The key inbound callers must present. When the variable is unset a
    /// random key is generated for this process and logged once.
    pub fn resolve_api_key(&self) -> String {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.is_empty() => key,
            _ => {
                let key = uuid::Uuid::new_v4().simple().to_string();
                tracing::warn!(
                    env = %self.api_key_env,
                    generated_key = %key,
                    "API key variable not set, generated a key for this session"
                );
                key
            }
        }
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("observability-proxy.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("observability-proxy").join("config.toml"));
    }
    if let Some(home) = home_dir() {
        paths.push(home.join(".config").join("observability-proxy").join("config.toml"));
        paths.push(home.join(".observability-proxy.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 5000

[upstream]
base_url = "http://localhost:9999/api/v1/"
title = "Test Title"

[auth]
enabled = true

[traces]
sink = "jsonl"
path = "/tmp/traces.jsonl"
"#
        )
        .unwrap();

        let config = ProxyConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(
            config.upstream.completions_url(),
            "http://localhost:9999/api/v1/chat/completions"
        );
        assert_eq!(config.upstream.title, "Test Title");
        assert_eq!(config.upstream.referer, "http://localhost:8000");
        assert_eq!(config.upstream.timeout(), Duration::from_secs(60));
        assert!(config.auth.enabled);
        assert_eq!(config.auth.api_key_env, "API_KEY");
        assert_eq!(config.traces.sink, SinkKind::Jsonl);
        assert_eq!(config.traces.langfuse.host, "https://cloud.langfuse.com");
    }

    #[test]
    fn test_example_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.example.toml");
        let config = ProxyConfig::load(&path).unwrap();
        let defaults = ProxyConfig::default();
        assert_eq!(config.port, defaults.port);
        assert_eq!(config.upstream.base_url, defaults.upstream.base_url);
        assert_eq!(config.upstream.title, defaults.upstream.title);
        assert_eq!(config.traces.sink, defaults.traces.sink);
        assert_eq!(config.traces.langfuse.host, defaults.traces.langfuse.host);
        assert_eq!(config.traces.langfuse.max_queue, 10_000);
        assert_eq!(config.traces.langfuse.batch_size, 500);
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let f = NamedTempFile::new().unwrap();
        let config = ProxyConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(
            config.upstream.completions_url(),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        assert_eq!(config.upstream.api_key_env, "OPENROUTER_API_KEY");
        assert!(!config.auth.enabled);
        assert_eq!(config.traces.sink, SinkKind::Log);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "9001"),
            ("HTTP_REFERER", "https://example.com"),
            ("X_TITLE", "Other"),
            ("LANGFUSE_HOST", "http://langfuse.local"),
        ]
        .into_iter()
        .collect();

        let mut config = ProxyConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.port, 9001);
        assert_eq!(config.upstream.referer, "https://example.com");
        assert_eq!(config.upstream.title, "Other");
        assert_eq!(config.traces.langfuse.host, "http://langfuse.local");
    }

    #[test]
    fn test_invalid_port_override() {
        let mut config = ProxyConfig::default();
        let err = config
            .apply_overrides(|k| (k == "PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config { .. }));
    }

    #[test]
    fn test_missing_upstream_key_is_config_error() {
        let upstream = UpstreamConfig {
            api_key_env: "OBSERVABILITY_PROXY_TEST_UNSET_KEY".to_string(),
            ..UpstreamConfig::default()
        };
        let err = upstream.resolve_api_key().unwrap_err();
        assert!(matches!(err, ProxyError::Config { .. }));
    }
}
