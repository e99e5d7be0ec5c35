//! Gateway configuration, loaded from a TOML file and overridable by
//! environment variables.
//!
//! Grounded in `querymt`'s `PluginRegistry::from_path` shape: a flat TOML
//! file parsed once at startup, rather than a runtime-mutable registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::GatewayError;

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_voice_dir() -> PathBuf {
    PathBuf::from("voices")
}

fn default_health_cooldown_secs() -> u64 {
    30
}

fn default_consecutive_failure_threshold() -> u32 {
    3
}

fn default_history_len() -> usize {
    20
}

fn default_job_retention_cap() -> usize {
    200
}

fn default_min_transcript_chars() -> usize {
    1
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_model() -> String {
    "default".to_string()
}

fn default_voice() -> String {
    "default".to_string()
}

fn default_search_max_results() -> usize {
    5
}

/// Per-capability ordered backend selection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub backends: Vec<String>,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// One configured backend descriptor entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub capability: crate::capability::Capability,
    pub base_url: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default = "default_policy_weight")]
    pub policy_weight: u32,
}

fn default_policy_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub auth_key: Option<String>,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_voice_dir")]
    pub voice_dir: PathBuf,

    #[serde(default)]
    pub audio_device: Option<String>,

    #[serde(default = "default_health_cooldown_secs")]
    pub health_cooldown_secs: u64,

    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: u32,

    #[serde(default = "default_history_len")]
    pub history_len: usize,

    #[serde(default = "default_job_retention_cap")]
    pub job_retention_cap: usize,

    #[serde(default = "default_min_transcript_chars")]
    pub min_transcript_chars: usize,

    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_voice")]
    pub default_voice: String,

    #[serde(default = "default_search_max_results")]
    pub search_max_results: usize,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub policies: HashMap<crate::capability::Capability, PolicyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen_addr: default_listen_addr(),
            auth_key: None,
            log_dir: default_log_dir(),
            voice_dir: default_voice_dir(),
            audio_device: None,
            health_cooldown_secs: default_health_cooldown_secs(),
            consecutive_failure_threshold: default_consecutive_failure_threshold(),
            history_len: default_history_len(),
            job_retention_cap: default_job_retention_cap(),
            min_transcript_chars: default_min_transcript_chars(),
            model_dir: default_model_dir(),
            default_model: default_model(),
            default_voice: default_voice(),
            search_max_results: default_search_max_results(),
            backends: Vec::new(),
            policies: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from a TOML file, falling back to defaults for anything absent.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Internal(format!(
                "failed to read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, GatewayError> {
        toml::from_str(raw)
            .map_err(|e| GatewayError::Internal(format!("invalid config: {e}")))
    }

    /// Apply `GATEWAY_*` environment overrides on top of a loaded config.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("GATEWAY_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(key) = std::env::var("GATEWAY_AUTH_KEY") {
            self.auth_key = Some(key);
        }
        if let Ok(dir) = std::env::var("GATEWAY_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn default_providers_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cogs-gateway")
            .join("providers.toml")
    }

    /// One `BackendDescriptor` per configured backend, ready for
    /// `BackendRouter::new`, created at startup from configuration.
    pub fn build_descriptors(&self) -> Vec<crate::backend::BackendDescriptor> {
        self.backends
            .iter()
            .map(|b| crate::backend::BackendDescriptor::new(b.id.clone(), b.capability, b.is_primary, b.policy_weight))
            .collect()
    }

    pub fn build_policies(&self) -> HashMap<crate::capability::Capability, crate::backend::SelectionPolicy> {
        self.policies
            .iter()
            .map(|(capability, policy)| {
                (
                    *capability,
                    crate::backend::SelectionPolicy::new(policy.backends.clone(), policy.fallback_enabled),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_is_minimal() {
        let cfg = GatewayConfig::from_toml_str("listen_addr = \"127.0.0.1:9000\"").unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.job_retention_cap, 200);
        assert!(cfg.backends.is_empty());
    }

    #[test]
    fn parses_backends_and_policies() {
        let raw = r#"
            [[backends]]
            id = "llm-primary"
            capability = "generate_text"
            base_url = "http://127.0.0.1:9100"
            is_primary = true

            [policies.generate_text]
            backends = ["llm-primary", "llm-fallback"]
            fallback_enabled = true
        "#;
        let cfg = GatewayConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.backends.len(), 1);
        assert_eq!(cfg.backends[0].id, "llm-primary");
        let policy = cfg.policies.get(&crate::capability::Capability::GenerateText).unwrap();
        assert!(policy.fallback_enabled);
        assert_eq!(policy.backends.len(), 2);
    }
}
