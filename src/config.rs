//! Configuration management for the transaction sender
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Environment variable pointing at the configuration file
pub const CONFIG_ENV_VAR: &str = "TX_SENDER_CONFIG";

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub sender: SenderConfig,
    pub nonce: NonceConfig,
    pub key_manager: KeyManagerConfig,
    #[serde(default)]
    pub multi_tenancy: MultiTenancyConfig,
    pub job_api: JobApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    pub instance_id: String,
    /// Number of jobs processed concurrently
    pub workers: usize,
    /// Nonce-conflict recoveries allowed per job
    pub max_recovery: u32,
    pub send_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum NonceBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NonceConfig {
    pub backend: NonceBackend,
    pub redis_url: Option<String>,
    /// TTL of cached nonces, none when unset
    pub expiration_secs: Option<u64>,
    /// Lifetime of a per-key nonce lock left behind by a crashed holder
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

fn default_lock_ttl_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyManagerConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultiTenancyConfig {
    pub enabled: bool,
    pub default_tenant: String,
}

impl Default for MultiTenancyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_tenant: crate::types::DEFAULT_TENANT.to_string(),
        }
    }
}

impl MultiTenancyConfig {
    /// Tenants the signer may look an account up under, in order
    pub fn allowed_tenants(&self, job_tenant: &str) -> Vec<String> {
        let mut tenants = vec![job_tenant.to_string()];
        if self.enabled && job_tenant != self.default_tenant {
            tenants.push(self.default_tenant.clone());
        }
        tenants
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobApiConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub uuid: Uuid,
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    /// Tessera third-party API, required for Tessera private jobs
    pub tessera_url: Option<String>,
    pub enabled: bool,
}

impl Settings {
    /// Load settings from the file named by `TX_SENDER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.sender.workers == 0 {
            anyhow::bail!("sender.workers must be at least 1");
        }

        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.enabled && chain.tessera_url.is_none() {
                tracing::debug!("Chain {} has no Tessera URL - private payloads disabled", name);
            }
        }

        if self.nonce.lock_ttl_secs <= self.sender.send_timeout_secs {
            anyhow::bail!("nonce.lock_ttl_secs must exceed sender.send_timeout_secs");
        }

        if self.nonce.backend == NonceBackend::Redis && self.nonce.redis_url.is_none() {
            anyhow::bail!("nonce.redis_url is required for the redis backend");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[sender]
instance_id = "tx-sender-0"
workers = 4
max_recovery = 5
send_timeout_secs = 30

[nonce]
backend = "memory"

[key_manager]
url = "${TX_SENDER_TEST_KM_URL}"

[multi_tenancy]
enabled = true
default_tenant = "_"

[job_api]
url = "http://localhost:8081"

[metrics]
enabled = false
port = 9090

[chains.besu]
uuid = "c3b4d3f2-0b1e-4c55-8a4d-2f1b8a9a7e21"
chain_id = 2018
rpc_urls = ["http://localhost:8545"]
enabled = true
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TX_SENDER_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TX_SENDER_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        env::set_var("TX_SENDER_TEST_KM_URL", "http://key-manager:8081");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.key_manager.url, "http://key-manager:8081");
        assert_eq!(settings.sender.max_recovery, 5);
        assert_eq!(settings.nonce.lock_ttl_secs, 60);
        assert_eq!(settings.enabled_chains().len(), 1);
        assert!(!settings.logging.json);
        assert_eq!(
            settings.multi_tenancy.allowed_tenants("tenant-a"),
            vec!["tenant-a".to_string(), "_".to_string()]
        );
        assert_eq!(settings.multi_tenancy.allowed_tenants("_"), vec!["_".to_string()]);
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let config = SAMPLE.replace("backend = \"memory\"", "backend = \"redis\"");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.as_bytes()).unwrap();

        assert!(Settings::load_from(file.path()).is_err());
    }

    #[test]
    fn test_lock_ttl_must_outlive_send_timeout() {
        let config = SAMPLE.replace("backend = \"memory\"", "backend = \"memory\"\nlock_ttl_secs = 30");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.as_bytes()).unwrap();

        assert!(Settings::load_from(file.path()).is_err());
    }
}
