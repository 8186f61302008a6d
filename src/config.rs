use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub listen: ListenConfig,
    pub upstreams: Vec<UpstreamConfig>,
    /// Omitted: answers are forwarded as they come
    pub loadbalance: Option<LoadBalanceConfig>,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoadBalanceConfig {
    pub weight_file: String,
    /// Seconds between weight file checks, 0 = load once at startup
    #[serde(default = "default_reload_secs")]
    pub reload_secs: u64,
    /// Exact repeating cycle instead of weighted random draws
    #[serde(default)]
    pub deterministic: bool,
    /// Fixed seed for the random selector (reproducible runs)
    pub seed: Option<u64>,
    /// Base directory for a relative weight_file
    pub root: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_address")]
    pub address: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_web_address(),
            port: default_web_port(),
        }
    }
}

// Default value functions
fn default_timeout_ms() -> u64 { 2000 }
fn default_reload_secs() -> u64 { 30 }
fn default_true() -> bool { true }
fn default_web_address() -> String { "0.0.0.0".to_string() }
fn default_web_port() -> u16 { 8053 }

impl LoadBalanceConfig {
    /// Weight file path, joined onto `root` when relative
    pub fn weight_path(&self) -> PathBuf {
        let path = Path::new(&self.weight_file);
        match &self.root {
            Some(root) if !path.is_absolute() && !root.is_empty() => Path::new(root).join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        let config = Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path, e))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.upstreams.is_empty() {
            return Err(anyhow::anyhow!("At least one upstream server is required"));
        }
        if let Some(lb) = &config.loadbalance {
            if lb.weight_file.trim().is_empty() {
                return Err(anyhow::anyhow!("loadbalance.weight_file must not be empty"));
            }
        }
        Ok(config)
    }
}
