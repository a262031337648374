//! Configuration loading integration tests

use ccproxy::config::Settings;
use std::io::Write;
use tempfile::NamedTempFile;

const FULL_CONFIG: &str = r#"
    [config]
    host = "127.0.0.1"
    port = 9090
    request_timeout = 120
    max_retries = 3
    max_tokens_limit = 8192
    min_tokens_limit = 50
    db_file = "test.db"
    client_api_key = "shared-secret"
    big_model = "OpenRouter:deepseek/deepseek-chat"
    middle_model = "OpenAI:gpt-4o"
    small_model = "OpenAI:gpt-4o-mini"

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
    api_key = "sk-or-key"
    big_models = ["deepseek/deepseek-chat"]

    [[provider]]
    name = "Claude"
    base_url = "https://api.anthropic.com"
    env_key = "UPSTREAM_ANTHROPIC_KEY"
    provider_type = "anthropic"
    big_models = ["claude-3-5-sonnet-20241022"]

    [transformers.deepseek]
    enabled = true
    providers = ["OpenRouter"]
    models = ["deepseek*"]
    max_output = 4096

    [transformers.tooluse]
    enabled = false
    providers = ["DeepSeek"]
"#;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(FULL_CONFIG.as_bytes()).unwrap();

    let settings = Settings::load(file.path()).unwrap();

    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 9090);
    assert_eq!(settings.server.request_timeout, 120);
    assert_eq!(settings.server.max_retries, 3);
    assert_eq!(settings.server.client_api_key.as_deref(), Some("shared-secret"));
    assert_eq!(settings.providers.len(), 3);
    assert_eq!(settings.transformers.len(), 2);
}

#[test]
fn test_defaults_fill_in() {
    let minimal = r#"
        [[provider]]
        name = "OpenAI"
        base_url = "https://api.openai.com/v1"
        api_key = "sk-x"
        big_models = ["gpt-4o"]
    "#;

    let settings = Settings::from_toml(minimal).unwrap();
    assert_eq!(settings.server.port, 8082);
    assert_eq!(settings.server.request_timeout, 90);
    assert_eq!(settings.server.max_retries, 2);
    assert_eq!(settings.server.max_tokens_limit, 4096);
    assert_eq!(settings.server.min_tokens_limit, 100);
    assert!(settings.server.client_api_key.is_none());
    assert_eq!(settings.providers[0].provider_type, "openai");
}

#[test]
fn test_transformer_defaults() {
    let settings = Settings::from_toml(FULL_CONFIG).unwrap();

    let deepseek = settings
        .transformers
        .iter()
        .find(|t| t.name == "deepseek")
        .unwrap();
    assert!(deepseek.enabled);
    assert_eq!(deepseek.options["max_output"], 4096);

    let tooluse = settings
        .transformers
        .iter()
        .find(|t| t.name == "tooluse")
        .unwrap();
    assert!(!tooluse.enabled);
    // models defaults to the match-all glob
    assert_eq!(tooluse.models, vec!["*"]);
}

#[test]
fn test_anthropic_provider_type() {
    let settings = Settings::from_toml(FULL_CONFIG).unwrap();
    let claude = settings.find_provider("Claude").unwrap();
    assert!(claude.is_anthropic());
    assert_eq!(claude.env_key.as_deref(), Some("UPSTREAM_ANTHROPIC_KEY"));
}

#[test]
fn test_invalid_configs_rejected() {
    // No providers at all
    assert!(Settings::from_toml("[config]\nport = 8082").is_err());

    // Unknown provider type
    let bad_type = r#"
        [[provider]]
        name = "X"
        base_url = "https://example.com"
        provider_type = "soap"
        big_models = ["m"]
    "#;
    assert!(Settings::from_toml(bad_type).is_err());

    // Port zero
    let bad_port = r#"
        [config]
        port = 0

        [[provider]]
        name = "X"
        base_url = "https://example.com"
        big_models = ["m"]
    "#;
    assert!(Settings::from_toml(bad_port).is_err());
}

#[test]
fn test_missing_file_fails() {
    let result = Settings::load(std::path::Path::new("/nonexistent/ccproxy.toml"));
    assert!(result.is_err());
}
