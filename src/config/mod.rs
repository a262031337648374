//! Configuration management module
//!
//! TOML config file loading with env fallback

pub mod settings;

pub use settings::{ProviderConfig, ServerSettings, Settings, TransformerConfig};
