//! ccproxy server
//!
//! HTTP proxy that serves the Claude messages API on top of OpenAI-compatible
//! and native Anthropic upstreams, with tier-based model routing and a
//! persistent request history.

use anyhow::{Context, Result};
use ccproxy::{build_state, create_router, HistoryStore, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    // Optional config file path as the first argument
    let config_file = std::env::args().nth(1);
    let settings =
        Settings::load_default(config_file.as_deref()).context("Failed to load configuration")?;

    info!(
        "Configuration loaded: {} provider(s), {} transformer(s)",
        settings.providers.len(),
        settings.transformers.len()
    );

    let history = HistoryStore::open(&settings.server.db_file)
        .context("Failed to open history database")?;

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let state = build_state(settings, history).await?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("ccproxy listening on {}", addr);
    info!("Messages endpoint: http://{}/v1/messages", addr);

    axum::serve(listener, app)
        .await
        .context("Server terminated")?;

    Ok(())
}

/// Initialize the tracing subscriber; JSON output with LOG_FORMAT=json
fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if log_format == "json" {
        Box::new(
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .finish(),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .with_target(false)
                .finish(),
        )
    };

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
