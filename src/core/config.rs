use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Contents of `config.toml` in the data directory. Every field has a
/// default, so an empty or missing file is a working configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub warm_pool: WarmPoolConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub cron: CronConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Events a slow listener may fall behind before it starts losing them.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub prompt_preamble: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Upper bound on waiting for any single backend to answer a cancel.
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentConfig {
    /// Shell command that runs one job; the prompt arrives on stdin.
    #[serde(default)]
    pub command: Option<String>,
    /// Run once per warm worker at startup.
    #[serde(default)]
    pub warmup_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarmPoolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_cancel_ack_timeout_ms")]
    pub cancel_ack_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// No timeout when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: String,
    /// Workflow file to `workflow_dispatch`; push-triggered when unset.
    #[serde(default)]
    pub workflow: Option<String>,
    /// Name of the environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CronConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    17900
}
fn default_event_buffer() -> usize {
    1024
}
fn default_page_size() -> usize {
    25
}
fn default_drain_timeout_secs() -> u64 {
    30
}
fn default_cancel_timeout_ms() -> u64 {
    10_000
}

fn default_pool_size() -> usize {
    2
}
fn default_cancel_ack_timeout_ms() -> u64 {
    5000
}
fn default_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_base_branch() -> String {
    "main".to_string()
}
fn default_jobs_dir() -> String {
    "jobs".to_string()
}
fn default_token_env() -> String {
    "GH_TOKEN".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_command_timeout_secs() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            prompt_preamble: None,
            page_size: default_page_size(),
            drain_timeout_secs: default_drain_timeout_secs(),
            cancel_timeout_ms: default_cancel_timeout_ms(),
        }
    }
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: default_pool_size(),
            cancel_ack_timeout_ms: default_cancel_ack_timeout_ms(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: None,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: default_api_base(),
            owner: String::new(),
            repo: String::new(),
            base_branch: default_base_branch(),
            jobs_dir: default_jobs_dir(),
            workflow: None,
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join("config.toml");
        if !config_path.exists() {
            info!("No config.toml found, using defaults.");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid {}", config_path.display()))?;
        info!(
            "Loaded config: warm_pool={}x{}, local={}, remote={}, tz={}",
            if config.warm_pool.enabled { "on" } else { "off" },
            config.warm_pool.size,
            config.local.enabled,
            config.remote.enabled,
            config.cron.timezone
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.cron.tz()?;
        if config.remote.enabled && (config.remote.owner.is_empty() || config.remote.repo.is_empty())
        {
            return Err(anyhow!("[remote] requires owner and repo when enabled"));
        }
        Ok(config)
    }
}

impl DispatchConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

impl WarmPoolConfig {
    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl LocalConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl CronConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow!("Unknown timezone '{}': {}", self.timezone, e))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
