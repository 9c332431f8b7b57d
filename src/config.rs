use anyhow::{bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for treemirror
///
/// The source and destination roots come from the command line; this file
/// only tunes how the mirror behaves.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Transfer timeout and retry policy
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Source reachability probing
    #[serde(default)]
    pub reachability: ReachabilityConfig,

    /// Live watch and outage supervision
    #[serde(default)]
    pub watch: WatchConfig,

    /// Path filtering
    #[serde(default)]
    pub filter: FilterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Console display settings
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Transfer policy for copy, rename and remove operations
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransferConfig {
    /// Wall-clock budget for a single attempt
    #[serde(default = "default_transfer_timeout")]
    pub timeout: String, // "30s"

    /// Attempts before a transfer is reported as failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String, // "5s"

    /// Widen destination permissions and retry once on a permission error
    #[serde(default = "default_true")]
    pub force_permissions: bool,
}

/// Reachability probe configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReachabilityConfig {
    /// File-sharing port used for the host liveness check
    #[serde(default = "default_share_port")]
    pub share_port: u16,

    /// Timeout for the liveness connect and the mount command
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String, // "5s"

    /// Host to probe (parsed from a UNC-style source when unset)
    pub host: Option<String>,

    /// Command used to map the share, `{source}` is replaced by the source root
    #[serde(default = "default_mount_command")]
    pub mount_command: Vec<String>,

    /// Path that becomes readable once the share is mapped
    #[serde(default = "default_mount_point")]
    pub mount_point: Option<String>,
}

/// Live watch configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Interval between reachability checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String, // "1s"

    /// How long to wait for the source to come back before re-arming
    #[serde(default = "default_reconnect_window")]
    pub reconnect_window: String, // "60s"
}

/// Path filter configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FilterConfig {
    /// Path segments that exclude an entry (and its whole subtree)
    #[serde(default = "default_ignored_segments")]
    pub ignored_segments: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Append-only log file
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Enable colored console output
    #[serde(default = "default_true")]
    pub color: bool,
}

/// Console display configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DisplayConfig {
    /// Draw the overwriting progress line and operation timers
    #[serde(default = "default_true")]
    pub console_progress: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_transfer_timeout() -> String {
    "30s".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> String {
    "5s".to_string()
}
fn default_share_port() -> u16 {
    445
}
fn default_connect_timeout() -> String {
    "5s".to_string()
}
fn default_mount_command() -> Vec<String> {
    if cfg!(windows) {
        ["net", "use", "Z:", "{source}", "/persistent:no"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        Vec::new()
    }
}
fn default_mount_point() -> Option<String> {
    if cfg!(windows) {
        Some("Z:\\".to_string())
    } else {
        None
    }
}
fn default_poll_interval() -> String {
    "1s".to_string()
}
fn default_reconnect_window() -> String {
    "60s".to_string()
}
fn default_ignored_segments() -> Vec<String> {
    vec!["build".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/treemirror/sync.log", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/treemirror/sync.log", home)
    } else {
        "sync_log.txt".to_string()
    }
}

// Default implementations
impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: default_transfer_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            force_permissions: default_true(),
        }
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            share_port: default_share_port(),
            connect_timeout: default_connect_timeout(),
            host: None,
            mount_command: default_mount_command(),
            mount_point: default_mount_point(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            reconnect_window: default_reconnect_window(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            ignored_segments: default_ignored_segments(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_file: default_log_file(),
            color: default_true(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            console_progress: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("treemirror").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.logging.log_file = shellexpand::full(&self.logging.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        if let Some(mount_point) = &self.reachability.mount_point {
            self.reachability.mount_point = Some(
                shellexpand::full(mount_point)
                    .context("Failed to expand mount_point path")?
                    .into_owned(),
            );
        }

        Ok(())
    }

    /// Reject settings that would make the mirror misbehave
    pub fn validate(&self) -> Result<()> {
        if self.transfer.max_retries == 0 {
            bail!("transfer.max_retries must be at least 1");
        }
        if self.filter.ignored_segments.iter().any(|s| s.is_empty()) {
            bail!("filter.ignored_segments must not contain empty names");
        }

        self.transfer_timeout()?;
        self.retry_delay()?;
        self.connect_timeout()?;
        if self.poll_interval()?.is_zero() {
            bail!("watch.poll_interval must be greater than zero");
        }
        self.reconnect_window()?;

        Ok(())
    }

    pub fn transfer_timeout(&self) -> Result<Duration> {
        parse_duration(&self.transfer.timeout).context("Invalid transfer.timeout")
    }

    pub fn retry_delay(&self) -> Result<Duration> {
        parse_duration(&self.transfer.retry_delay).context("Invalid transfer.retry_delay")
    }

    pub fn connect_timeout(&self) -> Result<Duration> {
        parse_duration(&self.reachability.connect_timeout)
            .context("Invalid reachability.connect_timeout")
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.watch.poll_interval).context("Invalid watch.poll_interval")
    }

    pub fn reconnect_window(&self) -> Result<Duration> {
        parse_duration(&self.watch.reconnect_window).context("Invalid watch.reconnect_window")
    }
}

/// Parse duration strings like "500ms", "30s", "5m", "1h", "2d" or bare seconds
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    if let Some(value) = duration_str.strip_suffix("ms") {
        value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .context("Invalid milliseconds value")
    } else if let Some(value) = duration_str.strip_suffix('s') {
        value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .context("Invalid seconds value")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value
            .trim()
            .parse::<u64>()
            .map(|v| Duration::from_secs(v * 60))
            .context("Invalid minutes value")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value
            .trim()
            .parse::<u64>()
            .map(|v| Duration::from_secs(v * 3600))
            .context("Invalid hours value")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value
            .trim()
            .parse::<u64>()
            .map(|v| Duration::from_secs(v * 86400))
            .context("Invalid days value")
    } else {
        duration_str
            .parse::<u64>()
            .map(Duration::from_secs)
            .context("Invalid duration format. Use format like '500ms', '30s', '5m', '1h'")
    }
}
