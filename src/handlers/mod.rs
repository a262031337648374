//! HTTP handlers module
//!
//! Application state and route wiring

pub mod admin;
pub mod health;
pub mod proxy;

use crate::config::Settings;
use crate::services::{ModelRouter, Translator, UpstreamClient};
use crate::storage::HistoryStore;
use crate::transformers::TransformerRegistry;
use anyhow::Result;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Shared application state threaded through every handler
pub struct AppState {
    pub settings: Settings,
    pub router: ModelRouter,
    pub translator: Translator,
    pub client: UpstreamClient,
    pub history: HistoryStore,
    pub transformers: TransformerRegistry,
}

/// Build the application state around an already-open history store
pub async fn build_state(settings: Settings, history: HistoryStore) -> Result<Arc<AppState>> {
    let router = ModelRouter::new(&settings);
    router
        .restore_persisted(&history)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to restore persisted selections: {}", e))?;

    let translator = Translator::new(&settings.server);
    let client = UpstreamClient::new(&settings.server)?;
    let transformers = TransformerRegistry::from_config(&settings.transformers);

    Ok(Arc::new(AppState {
        settings,
        router,
        translator,
        client,
        history,
        transformers,
    }))
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let middleware_stack = ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    // Only the messages endpoints require the client secret
    let messages_routes = Router::new()
        .route("/v1/messages", post(proxy::handle_messages))
        .route("/v1/messages/count_tokens", post(proxy::count_tokens))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::auth::require_client_secret,
        ));

    Router::new()
        .merge(messages_routes)
        .route("/health", get(health::health_check))
        .route("/api/config/get", get(admin::get_config))
        .route("/api/config/update", post(admin::update_config))
        .route("/api/history", get(admin::get_history))
        .route("/api/history/:id", get(admin::get_history_record))
        .route("/api/summary", get(admin::get_summary))
        .with_state(state)
        .layer(middleware_stack)
}
