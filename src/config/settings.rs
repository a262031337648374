//! Application configuration
//!
//! Loads the TOML config file (a `[config]` table, repeated `[[provider]]`
//! tables and `[transformers.<name>]` tables) with an env-only fallback when
//! no file is given.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Fully loaded application settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Server and pipeline knobs from `[config]`
    pub server: ServerSettings,
    /// Provider catalog from `[[provider]]`
    pub providers: Vec<ProviderConfig>,
    /// Transformer configurations in file order
    pub transformers: Vec<TransformerConfig>,
}

/// `[config]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen host
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Upstream streaming timeout in seconds
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout: u64,
    /// Retry budget for retryable upstream failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Ceiling applied to translated max_tokens
    #[serde(default = "default_max_tokens_limit")]
    pub max_tokens_limit: u32,
    /// Floor applied to translated max_tokens
    #[serde(default = "default_min_tokens_limit")]
    pub min_tokens_limit: u32,
    /// SQLite history database path
    #[serde(default = "default_db_file")]
    pub db_file: String,
    /// Shared secret expected from clients; unset accepts any token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_api_key: Option<String>,
    /// Initial big-tier selection, `Provider:model` or bare model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub big_model: Option<String>,
    /// Initial middle-tier selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_model: Option<String>,
    /// Initial small-tier selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_model: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_request_timeout() -> u64 {
    90
}

fn default_stream_timeout() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_tokens_limit() -> u32 {
    4096
}

fn default_min_tokens_limit() -> u32 {
    100
}

fn default_db_file() -> String {
    "cc.db".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            stream_timeout: default_stream_timeout(),
            max_retries: default_max_retries(),
            max_tokens_limit: default_max_tokens_limit(),
            min_tokens_limit: default_min_tokens_limit(),
            db_file: default_db_file(),
            client_api_key: None,
            big_model: None,
            middle_model: None,
            small_model: None,
        }
    }
}

/// `[[provider]]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name, referenced by selections and transformer predicates
    pub name: String,
    /// Provider API base URL
    pub base_url: String,
    /// API key literal; overridden by `env_key` when both are set
    #[serde(default)]
    pub api_key: String,
    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_key: Option<String>,
    /// "openai" for chat-completions upstreams, "anthropic" for native ones
    #[serde(default = "default_provider_type")]
    pub provider_type: String,
    /// Models this provider can serve for the big tier
    #[serde(default)]
    pub big_models: Vec<String>,
    /// Models this provider can serve for the middle tier
    #[serde(default)]
    pub middle_models: Vec<String>,
    /// Models this provider can serve for the small tier
    #[serde(default)]
    pub small_models: Vec<String>,
}

fn default_provider_type() -> String {
    "openai".to_string()
}

impl ProviderConfig {
    /// Resolve the API key: env_key wins when set and present
    pub fn resolve_api_key(&self) -> String {
        if let Some(env_key) = &self.env_key {
            if let Ok(value) = std::env::var(env_key) {
                if !value.is_empty() {
                    return value;
                }
            }
        }
        self.api_key.clone()
    }

    /// Whether this upstream speaks the native Anthropic protocol
    pub fn is_anthropic(&self) -> bool {
        self.provider_type == "anthropic"
    }

    /// Models advertised for a tier
    pub fn models_for_tier(&self, tier: crate::services::router::Tier) -> &[String] {
        use crate::services::router::Tier;
        match tier {
            Tier::Big => &self.big_models,
            Tier::Middle => &self.middle_models,
            Tier::Small => &self.small_models,
        }
    }
}

/// One `[transformers.<name>]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Registry name; filled from the table key at load time
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Provider predicate list; case-insensitive exact match or glob
    #[serde(default)]
    pub providers: Vec<String>,
    /// Model predicate list; glob supported, "*" matches all
    #[serde(default = "default_model_globs")]
    pub models: Vec<String>,
    /// Transformer-specific options
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_true() -> bool {
    true
}

fn default_model_globs() -> Vec<String> {
    vec!["*".to_string()]
}

/// Raw file shape before transformer tables are flattened
#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    config: ServerSettings,
    #[serde(default)]
    provider: Vec<ProviderConfig>,
    #[serde(default)]
    transformers: toml::value::Table,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {:?}", path);

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml(&content)
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawSettings = toml::from_str(content).context("Failed to parse config TOML")?;

        let mut transformers = Vec::new();
        for (name, value) in raw.transformers {
            let mut tc: TransformerConfig = value
                .clone()
                .try_into()
                .with_context(|| format!("Invalid [transformers.{}] table", name))?;
            tc.name = name;
            // Keep option keys the registry does not model (max_output,
            // cache_control, ...) available to the transformer
            tc.options = toml_to_json(toml::Value::Table(
                value
                    .as_table()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|(k, _)| !matches!(k.as_str(), "enabled" | "providers" | "models"))
                    .collect(),
            ));
            transformers.push(tc);
        }

        let settings = Self {
            server: raw.config,
            providers: raw.provider,
            transformers,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Build settings from environment variables only: a single "default"
    /// OpenAI-compatible provider, tier lists from BIG/MIDDLE/SMALL_MODELS
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        let base_url = env_or("OPENAI_BASE_URL", "https://api.openai.com/v1");

        let big_models = env_list("BIG_MODELS", "BIG_MODEL", "gpt-4o");
        let middle_models = env_list("MIDDLE_MODELS", "MIDDLE_MODEL", "gpt-4o");
        let small_models = env_list("SMALL_MODELS", "SMALL_MODEL", "gpt-4o-mini");

        let server = ServerSettings {
            host: env_or("HOST", "0.0.0.0"),
            port: env_or("PORT", "8082").parse().context("Invalid port")?,
            request_timeout: env_or("REQUEST_TIMEOUT", "90")
                .parse()
                .context("Invalid request timeout")?,
            stream_timeout: env_or("STREAM_TIMEOUT", "600")
                .parse()
                .context("Invalid stream timeout")?,
            max_retries: env_or("MAX_RETRIES", "2")
                .parse()
                .context("Invalid retry budget")?,
            max_tokens_limit: env_or("MAX_TOKENS_LIMIT", "4096")
                .parse()
                .context("Invalid max tokens limit")?,
            min_tokens_limit: env_or("MIN_TOKENS_LIMIT", "100")
                .parse()
                .context("Invalid min tokens limit")?,
            db_file: env_or("DB_FILE", "cc.db"),
            client_api_key: std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty()),
            big_model: Some(big_models[0].clone()),
            middle_model: Some(middle_models[0].clone()),
            small_model: Some(small_models[0].clone()),
        };

        let settings = Self {
            server,
            providers: vec![ProviderConfig {
                name: "default".to_string(),
                base_url,
                api_key,
                env_key: None,
                provider_type: "openai".to_string(),
                big_models,
                middle_models,
                small_models,
            }],
            transformers: Vec::new(),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Load from an explicit path, or CONFIG_FILE env, or env-only fallback
    pub fn load_default(config_file: Option<&str>) -> Result<Self> {
        if let Some(path) = config_file {
            return Self::load(Path::new(path));
        }
        if let Ok(path) = std::env::var("CONFIG_FILE") {
            return Self::load(Path::new(&path));
        }
        Self::from_env()
    }

    /// Validate configuration consistency
    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Port number cannot be 0");
        }

        if self.providers.is_empty() {
            anyhow::bail!("At least one provider must be configured");
        }

        if self.server.min_tokens_limit > self.server.max_tokens_limit {
            anyhow::bail!(
                "min_tokens_limit ({}) exceeds max_tokens_limit ({})",
                self.server.min_tokens_limit,
                self.server.max_tokens_limit
            );
        }

        for provider in &self.providers {
            if provider.name.is_empty() {
                anyhow::bail!("Provider name cannot be empty");
            }

            if !provider.base_url.starts_with("http") {
                anyhow::bail!(
                    "Invalid base URL for provider '{}': {}",
                    provider.name,
                    provider.base_url
                );
            }

            let valid_types = ["openai", "anthropic"];
            if !valid_types.contains(&provider.provider_type.as_str()) {
                anyhow::bail!(
                    "Invalid provider type '{}' for provider '{}'",
                    provider.provider_type,
                    provider.name
                );
            }

            if provider.big_models.is_empty()
                && provider.middle_models.is_empty()
                && provider.small_models.is_empty()
            {
                anyhow::bail!(
                    "Provider '{}' must advertise at least one model",
                    provider.name
                );
            }
        }

        Ok(())
    }

    /// Find a provider by name, case-insensitive
    pub fn find_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Environment variable with fallback
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Comma-separated model list from `plural` env, falling back to `singular`
fn env_list(plural: &str, singular: &str, default: &str) -> Vec<String> {
    let raw = std::env::var(plural)
        .or_else(|_| std::env::var(singular))
        .unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Convert a TOML value into JSON for transformer options
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [config]
        port = 8082
        max_tokens_limit = 8192
        big_model = "OpenRouter:deepseek/deepseek-chat"
        small_model = "gpt-4o-mini"

        [[provider]]
        name = "OpenAI"
        base_url = "https://api.openai.com/v1"
        env_key = "OPENAI_API_KEY"
        big_models = ["gpt-4o"]
        middle_models = ["gpt-4o"]
        small_models = ["gpt-4o-mini"]

        [[provider]]
        name = "OpenRouter"
        base_url = "https://openrouter.ai/api/v1"
        api_key = "sk-or-test"
        big_models = ["deepseek/deepseek-chat"]

        [[provider]]
        name = "Anthropic"
        base_url = "https://api.anthropic.com"
        env_key = "ANTHROPIC_UPSTREAM_KEY"
        provider_type = "anthropic"
        big_models = ["claude-3-5-sonnet-20241022"]

        [transformers.deepseek]
        enabled = true
        providers = ["OpenRouter"]
        models = ["deepseek*"]
        max_output = 8192

        [transformers.openrouter]
        providers = ["OpenRouter"]

        [transformers.openrouter.cache_control]
        ttl = 3600
        refresh = "force"
    "#;

    #[test]
    fn test_parse_full_file() {
        let settings = Settings::from_toml(SAMPLE).unwrap();

        assert_eq!(settings.server.port, 8082);
        assert_eq!(settings.server.max_tokens_limit, 8192);
        assert_eq!(settings.server.request_timeout, 90);
        assert_eq!(settings.providers.len(), 3);
        assert_eq!(
            settings.server.big_model.as_deref(),
            Some("OpenRouter:deepseek/deepseek-chat")
        );

        let anthropic = settings.find_provider("anthropic").unwrap();
        assert!(anthropic.is_anthropic());
    }

    #[test]
    fn test_transformer_tables_in_order() {
        let settings = Settings::from_toml(SAMPLE).unwrap();

        assert_eq!(settings.transformers.len(), 2);
        assert_eq!(settings.transformers[0].name, "deepseek");
        assert_eq!(settings.transformers[1].name, "openrouter");

        let deepseek = &settings.transformers[0];
        assert!(deepseek.enabled);
        assert_eq!(deepseek.providers, vec!["OpenRouter"]);
        assert_eq!(deepseek.models, vec!["deepseek*"]);
        assert_eq!(deepseek.options["max_output"], 8192);

        let openrouter = &settings.transformers[1];
        assert_eq!(openrouter.models, vec!["*"]);
        assert_eq!(openrouter.options["cache_control"]["ttl"], 3600);
        assert_eq!(openrouter.options["cache_control"]["refresh"], "force");
    }

    #[test]
    fn test_env_key_priority() {
        let provider = ProviderConfig {
            name: "test".to_string(),
            base_url: "https://example.com".to_string(),
            api_key: "literal-key".to_string(),
            env_key: Some("CCPROXY_TEST_KEY_PRIORITY".to_string()),
            provider_type: "openai".to_string(),
            big_models: vec!["m".to_string()],
            middle_models: vec![],
            small_models: vec![],
        };

        std::env::remove_var("CCPROXY_TEST_KEY_PRIORITY");
        assert_eq!(provider.resolve_api_key(), "literal-key");

        std::env::set_var("CCPROXY_TEST_KEY_PRIORITY", "env-key");
        assert_eq!(provider.resolve_api_key(), "env-key");
        std::env::remove_var("CCPROXY_TEST_KEY_PRIORITY");
    }

    #[test]
    fn test_validation_rejects_bad_provider() {
        let bad_url = r#"
            [[provider]]
            name = "broken"
            base_url = "ftp://example.com"
            big_models = ["m"]
        "#;
        assert!(Settings::from_toml(bad_url).is_err());

        let bad_type = r#"
            [[provider]]
            name = "broken"
            base_url = "https://example.com"
            provider_type = "grpc"
            big_models = ["m"]
        "#;
        assert!(Settings::from_toml(bad_type).is_err());

        let no_models = r#"
            [[provider]]
            name = "broken"
            base_url = "https://example.com"
        "#;
        assert!(Settings::from_toml(no_models).is_err());
    }

    #[test]
    fn test_validation_rejects_empty() {
        assert!(Settings::from_toml("").is_err());
    }

    #[test]
    fn test_token_limit_ordering() {
        let inverted = r#"
            [config]
            max_tokens_limit = 50
            min_tokens_limit = 100

            [[provider]]
            name = "OpenAI"
            base_url = "https://api.openai.com/v1"
            big_models = ["gpt-4o"]
        "#;
        assert!(Settings::from_toml(inverted).is_err());
    }
}
