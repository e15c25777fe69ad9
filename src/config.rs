//! TOML configuration parsing and validation.
//!
//! A single file configures both sides of the protocol: the client
//! (`[project]`, `[client]`) and the remote index (`[db]`, `[server]`,
//! `[auth]`, `[cache]`, `[processing]`). Every section except `[project]`
//! has defaults, so a client-only or server-only file stays short.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    pub project: ProjectConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/msync.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub id: String,
    pub root: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub ignore_globs: Vec<String>,
    /// Directory holding `snapshot.json` and `dirty.json`. Relative paths
    /// resolve against `root`.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_max_fragment_lines")]
    pub max_fragment_lines: usize,
}

impl ProjectConfig {
    pub fn state_path(&self) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            self.root.join(&self.state_dir)
        }
    }
}

fn default_extensions() -> Vec<String> {
    ["rs", "ts", "tsx", "js", "jsx", "py", "go", "java"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_state_dir() -> PathBuf {
    PathBuf::from(".msync")
}
fn default_max_fragment_lines() -> usize {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Environment variable holding the bearer credential.
    #[serde(default = "default_credential_env")]
    pub credential_env: String,
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            credential_env: default_credential_env(),
            timeout_secs: default_client_timeout(),
        }
    }
}

fn default_server_url() -> String {
    "http://127.0.0.1:7431".to_string()
}
fn default_credential_env() -> String {
    "MSYNC_TOKEN".to_string()
}
fn default_client_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Reject Phase 2 content whose digest differs from its claimed hash.
    #[serde(default = "default_true")]
    pub verify_content_hash: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            verify_content_hash: true,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7431".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Environment variable holding the HMAC signing secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
        }
    }
}

fn default_secret_env() -> String {
    "MSYNC_AUTH_SECRET".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_fragment_ttl_days")]
    pub fragment_ttl_days: u64,
    #[serde(default = "default_payload_ttl_days")]
    pub payload_ttl_days: u64,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    #[serde(default = "default_put_max_retries")]
    pub put_max_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fragment_ttl_days: default_fragment_ttl_days(),
            payload_ttl_days: default_payload_ttl_days(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            put_max_retries: default_put_max_retries(),
        }
    }
}

fn default_fragment_ttl_days() -> u64 {
    30
}
fn default_payload_ttl_days() -> u64 {
    90
}
fn default_lookup_timeout_ms() -> u64 {
    2000
}
fn default_put_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Chat model used for summaries.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_processing_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            embedding_model: None,
            url: None,
            dims: None,
            batch_size: default_batch_size(),
            timeout_secs: default_processing_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_processing_timeout() -> u64 {
    25
}
fn default_max_retries() -> u32 {
    2
}

/// Hard execution ceiling of a single request; processing must finish
/// well inside it.
pub const REQUEST_CEILING_SECS: u64 = 60;

impl ProcessingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate project
    if config.project.id.trim().is_empty() {
        anyhow::bail!("project.id must not be empty");
    }
    if config.project.max_fragment_lines == 0 {
        anyhow::bail!("project.max_fragment_lines must be > 0");
    }

    // Validate cache
    if config.cache.fragment_ttl_days == 0 || config.cache.payload_ttl_days == 0 {
        anyhow::bail!("cache TTLs must be > 0 days");
    }
    if config.cache.payload_ttl_days < config.cache.fragment_ttl_days {
        anyhow::bail!("cache.payload_ttl_days must be >= cache.fragment_ttl_days");
    }

    // Validate processing
    let processing = &config.processing;
    if processing.batch_size == 0 {
        anyhow::bail!("processing.batch_size must be > 0");
    }
    if processing.timeout_secs == 0 || processing.timeout_secs >= REQUEST_CEILING_SECS {
        anyhow::bail!(
            "processing.timeout_secs must be in 1..{}",
            REQUEST_CEILING_SECS
        );
    }

    match processing.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown processing provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if processing.is_enabled() {
        if processing.dims.is_none() || processing.dims == Some(0) {
            anyhow::bail!(
                "processing.dims must be > 0 when provider is '{}'",
                processing.provider
            );
        }
        if processing.embedding_model.is_none() {
            anyhow::bail!(
                "processing.embedding_model must be specified when provider is '{}'",
                processing.provider
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[project]
id = "demo"
root = "/tmp/demo"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.cache.fragment_ttl_days, 30);
        assert_eq!(config.cache.payload_ttl_days, 90);
        assert!(config.server.verify_content_hash);
        assert!(!config.processing.is_enabled());
        assert_eq!(
            config.project.state_path(),
            PathBuf::from("/tmp/demo/.msync")
        );
    }

    #[test]
    fn test_rejects_payload_ttl_shorter_than_fragment_ttl() {
        let text = format!("{}\n[cache]\nfragment_ttl_days = 30\npayload_ttl_days = 7\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_timeout_at_ceiling() {
        let text = format!("{}\n[processing]\ntimeout_secs = 60\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_enabled_provider_requires_dims_and_model() {
        let text = format!("{}\n[processing]\nprovider = \"openai\"\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());

        let text = format!(
            "{}\n[processing]\nprovider = \"openai\"\ndims = 8\nembedding_model = \"m\"\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&text).unwrap();
        validate(&config).unwrap();
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let text = format!("{}\n[processing]\nprovider = \"magic\"\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());
    }
}
