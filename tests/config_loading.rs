use std::io::Write;

use troupe_core::config::{AppConfig, MemoryBackend, ReactMode};
use troupe_core::error::TroupeError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[agent]
react_mode = "plan_and_act"
max_loop = 5
max_retry = 4
watch_all = true

[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test-key"
max_tokens = 2048
temperature = 0.3

[memory]
backend = "sqlite"
path = "/tmp/troupe-test/messages.db"

[events]
capacity = 64
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.agent.react_mode, ReactMode::PlanAndAct);
    assert_eq!(config.agent.max_loop, 5);
    assert_eq!(config.agent.max_retry, 4);
    assert!(config.agent.watch_all);

    let model = config.model.expect("model section");
    assert_eq!(model.provider, "openai");
    assert_eq!(model.model_id, "gpt-4o-mini");
    assert_eq!(model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(model.generate_options().max_tokens, 2048);

    assert_eq!(config.memory.backend, MemoryBackend::Sqlite);
    assert_eq!(
        config.memory.resolved_path(),
        std::path::PathBuf::from("/tmp/troupe-test/messages.db")
    );
    assert_eq!(config.events.capacity, 64);
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = AppConfig::parse("").expect("parse empty");
    assert_eq!(config.agent.react_mode, ReactMode::React);
    assert_eq!(config.agent.max_loop, 1);
    assert_eq!(config.agent.max_retry, 3);
    assert!(!config.agent.watch_all);
    assert!(config.model.is_none());
    assert_eq!(config.memory.backend, MemoryBackend::Memory);
    assert_eq!(config.events.capacity, 256);
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, TroupeError::ConfigNotFound(_)));
}

#[test]
fn test_zero_max_loop_rejected() {
    let err = AppConfig::parse("[agent]\nmax_loop = 0\n").unwrap_err();
    assert!(matches!(err, TroupeError::Config(_)));
}

#[test]
fn test_unknown_react_mode_rejected() {
    let err = AppConfig::parse("[agent]\nreact_mode = \"chaotic\"\n").unwrap_err();
    assert!(matches!(err, TroupeError::Config(_)));
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("TROUPE_TEST_MODEL_KEY", "sk-from-env");
    let toml_content = r#"
[model]
model_id = "gpt-4o"
api_key = "${TROUPE_TEST_MODEL_KEY}"
"#;
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let model = config.model.expect("model section");
    assert_eq!(model.api_key, Some("sk-from-env".to_string()));
}
