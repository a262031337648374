//! Admin API handlers
//!
//! Current-selection management and the history query surface

use crate::handlers::AppState;
use crate::services::Tier;
use crate::utils::error::{AppError, AppResult};
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// GET /api/config/get
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let current = state.router.current().await;

    // Today's per-model request counters from the history summary
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let model_counts: HashMap<String, u64> = match state
        .history
        .summary(Some(&today), Some(&today))
        .await
    {
        Ok(summary) => summary
            .into_iter()
            .map(|row| (row.model, row.request_count))
            .collect(),
        Err(e) => {
            warn!("Failed to load today's usage: {}", e);
            HashMap::new()
        }
    };

    let first_base_url = state
        .settings
        .providers
        .first()
        .map(|p| p.base_url.clone())
        .unwrap_or_default();

    Json(serde_json::json!({
        "message": format!("ccproxy v{}", env!("CARGO_PKG_VERSION")),
        "status": "running",
        "config": {
            "openai_base_url": first_base_url,
            "max_tokens_limit": state.settings.server.max_tokens_limit,
            "api_key_configured": state
                .settings
                .providers
                .iter()
                .all(|p| !p.resolve_api_key().is_empty()),
            "client_api_key_validation": state.settings.server.client_api_key.is_some(),
        },
        "current": {
            "BIG_MODEL": current.big,
            "MIDDLE_MODEL": current.middle,
            "SMALL_MODEL": current.small,
        },
        "available": {
            "BIG_MODELS": state.router.available(Tier::Big),
            "MIDDLE_MODELS": state.router.available(Tier::Middle),
            "SMALL_MODELS": state.router.available(Tier::Small),
        },
        "model_counts": model_counts,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// POST /api/config/update body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdateRequest {
    #[serde(rename = "BIG_MODEL", skip_serializing_if = "Option::is_none")]
    pub big_model: Option<String>,
    #[serde(rename = "MIDDLE_MODEL", skip_serializing_if = "Option::is_none")]
    pub middle_model: Option<String>,
    #[serde(rename = "SMALL_MODEL", skip_serializing_if = "Option::is_none")]
    pub small_model: Option<String>,
}

/// POST /api/config/update
pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConfigUpdateRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let updates = [
        (Tier::Big, request.big_model),
        (Tier::Middle, request.middle_model),
        (Tier::Small, request.small_model),
    ];

    for (tier, value) in updates {
        if let Some(value) = value {
            state
                .router
                .update_selection(tier, &value, &state.history)
                .await?;
        }
    }

    let current = state.router.current().await;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Configuration updated and persisted",
        "current": {
            "BIG_MODEL": current.big,
            "MIDDLE_MODEL": current.middle,
            "SMALL_MODEL": current.small,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// GET /api/history query parameters
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    /// YYYY-MM-DD
    pub date: Option<String>,
    /// 0-23, narrows `date` to one hour
    pub hour: Option<u32>,
}

/// GET /api/history
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    debug!(
        "History query: limit={} date={:?} hour={:?}",
        limit, query.date, query.hour
    );

    if let Some(hour) = query.hour {
        if hour > 23 {
            return Err(AppError::InvalidRequest(
                "hour must be between 0 and 23".to_string(),
            ));
        }
        if query.date.is_none() {
            return Err(AppError::InvalidRequest(
                "hour filter requires a date".to_string(),
            ));
        }
    }

    let records = state
        .history
        .recent(limit, query.date.as_deref(), query.hour)
        .await?;
    let total_count = records.len();

    Ok(Json(serde_json::json!({
        "status": "success",
        "data": {
            "records": records,
            "total_count": total_count,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// GET /api/history/{id}
pub async fn get_history_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let record = state
        .history
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("history record {}", id)))?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "data": record,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// GET /api/summary query parameters
#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// GET /api/summary
pub async fn get_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SummaryQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let summary = state
        .history
        .summary(query.start_date.as_deref(), query.end_date.as_deref())
        .await?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "data": {
            "by_model": summary,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}
