//! ccproxy library
//!
//! Claude-compatible API proxy: tiered model routing, Claude/OpenAI protocol
//! translation, a transformer pipeline for provider quirks, SSE streaming and
//! a persistent request history.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod storage;
pub mod transformers;
pub mod utils;

pub use config::Settings;
pub use handlers::{build_state, create_router, AppState};
pub use storage::HistoryStore;
pub use utils::error::{AppError, AppResult};
