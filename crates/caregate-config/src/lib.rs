use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default)]
    pub consent: Consent,
    #[serde(default)]
    pub triage: Triage,
    #[serde(default)]
    pub proactive: Proactive,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default = "default_transactional_tools")]
    pub transactional_tools: Vec<String>,
    #[serde(default)]
    pub tool_allowlist: Vec<String>,
    #[serde(default = "default_user_id")]
    pub default_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consent {
    #[serde(default = "default_consent_ttl_seconds")]
    pub default_ttl_seconds: i64,
    #[serde(default = "default_consent_max_ttl_seconds")]
    pub max_ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triage {
    #[serde(default = "default_emergent_context_ttl_seconds")]
    pub emergent_context_ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proactive {
    #[serde(default = "default_non_urgent_daily_cap")]
    pub non_urgent_daily_cap: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    #[serde(default = "default_audit_sink")]
    pub sink: String,
    pub jsonl_path: String,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            transactional_tools: default_transactional_tools(),
            tool_allowlist: Vec::new(),
            default_user_id: default_user_id(),
        }
    }
}

impl Default for Consent {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_consent_ttl_seconds(),
            max_ttl_seconds: default_consent_max_ttl_seconds(),
        }
    }
}

impl Default for Triage {
    fn default() -> Self {
        Self {
            emergent_context_ttl_seconds: default_emergent_context_ttl_seconds(),
        }
    }
}

impl Default for Proactive {
    fn default() -> Self {
        Self {
            non_urgent_daily_cap: default_non_urgent_daily_cap(),
        }
    }
}

fn default_transactional_tools() -> Vec<String> {
    vec![
        "appointment_book".to_string(),
        "medication_refill_request".to_string(),
        "medical_purchase".to_string(),
    ]
}

fn default_user_id() -> String {
    "anonymous".to_string()
}

fn default_consent_ttl_seconds() -> i64 {
    300
}

fn default_consent_max_ttl_seconds() -> i64 {
    3600
}

fn default_emergent_context_ttl_seconds() -> i64 {
    1800
}

fn default_non_urgent_daily_cap() -> u32 {
    1
}

fn default_audit_sink() -> String {
    "jsonl".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.gate.transactional_tools.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "gate.transactional_tools must name at least one tool".to_string(),
        ));
    }
    if cfg.gate.default_user_id.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "gate.default_user_id must not be empty".to_string(),
        ));
    }
    if cfg.consent.default_ttl_seconds < 1 {
        return Err(ConfigError::UnsupportedConfig(
            "consent.default_ttl_seconds must be >= 1".to_string(),
        ));
    }
    if cfg.consent.max_ttl_seconds < cfg.consent.default_ttl_seconds {
        return Err(ConfigError::UnsupportedConfig(
            "consent.max_ttl_seconds must be >= consent.default_ttl_seconds".to_string(),
        ));
    }
    if cfg.triage.emergent_context_ttl_seconds < 1 {
        return Err(ConfigError::UnsupportedConfig(
            "triage.emergent_context_ttl_seconds must be >= 1".to_string(),
        ));
    }
    if cfg.audit.sink != "jsonl" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "audit.sink={} is not implemented; supported: jsonl",
            cfg.audit.sink
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("caregate-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

gate:
  transactional_tools:
    - "appointment_book"
    - "medication_refill_request"
  tool_allowlist: []
  default_user_id: "anonymous"

consent:
  default_ttl_seconds: 300
  max_ttl_seconds: 3600

triage:
  emergent_context_ttl_seconds: 1800

proactive:
  non_urgent_daily_cap: 1

audit:
  sink: "jsonl"
  jsonl_path: "./caregate-audit.jsonl"
"#
        .to_string()
    }

    #[test]
    fn accepts_base_config_with_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.store.kind, "memory");
        assert_eq!(cfg.consent.default_ttl_seconds, 300);
        assert_eq!(cfg.proactive.non_urgent_daily_cap, 1);
        assert_eq!(cfg.gate.default_user_id, "anonymous");
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaLoad(_)
                | ConfigError::SchemaValidation(_)
                | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unsupported_audit_sink_at_runtime() {
        let path = write_temp_config(&base_yaml().replace("sink: \"jsonl\"", "sink: \"stdout\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_empty_transactional_tool_set() {
        let path = write_temp_config(&base_yaml().replace(
            "  transactional_tools:\n    - \"appointment_book\"\n    - \"medication_refill_request\"",
            "  transactional_tools: []",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_ttl_inversion() {
        let path = write_temp_config(
            &base_yaml().replace("max_ttl_seconds: 3600", "max_ttl_seconds: 60"),
        );
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }
}
