use clap::Parser;
use observability_proxy::config::{config_search_paths, ProxyConfig};
use observability_proxy::trace::sink_from_config;
use observability_proxy::{build_router, AppState, Relay, TraceRecorder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "observability-proxy",
    about = "OpenRouter chat-completion proxy with generation tracing",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "observability_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;
    config.apply_env_overrides()?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let client = reqwest::Client::builder()
        .timeout(config.upstream.timeout())
        .build()?;

    let sink = sink_from_config(&config.traces, client.clone())?;
    let recorder = TraceRecorder::new(sink);
    let flusher =
        recorder.spawn_periodic_flush(Duration::from_secs(config.traces.flush_interval_secs.max(1)));

    let inbound_api_key = config
        .auth
        .enabled
        .then(|| config.auth.resolve_api_key());

    info!("  Upstream:  {}", config.upstream.completions_url());
    info!("  Traces:    {:?}", config.traces.sink);
    info!("  Auth:      {}", if inbound_api_key.is_some() { "x-api-key required" } else { "disabled" });
    info!("  Port:      {}", config.port);

    let state = Arc::new(AppState {
        relay: Relay::new(client, config.upstream.clone()),
        recorder: recorder.clone(),
        inbound_api_key,
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    flusher.abort();
    info!("Flushing trace records");
    if let Err(e) = recorder.flush().await {
        tracing::error!(error = %e, "final trace flush failed");
    }

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
