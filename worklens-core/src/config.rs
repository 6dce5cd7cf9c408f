//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/worklens/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/worklens/` (~/.config/worklens/)
//! - Data: `$XDG_DATA_HOME/worklens/` (~/.local/share/worklens/)
//! - State/Logs: `$XDG_STATE_HOME/worklens/` (~/.local/state/worklens/)
//!
//! All tuning constants of the pipeline (window sizes, cooldowns, retention
//! horizons, classification cadence, extra redaction rules) live here and are
//! treated as immutable inputs for a run.

use crate::error::{Error, Result};
use crate::sanitize::RuleSpec;
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Ingestion server tuning
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Correlation window tuning
    #[serde(default)]
    pub correlator: CorrelatorConfig,

    /// Anomaly detection tuning
    #[serde(default)]
    pub anomaly: AnomalyConfig,

    /// External inference service
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Retention horizons
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Extra redaction rules (appended after the built-ins)
    #[serde(default)]
    pub sanitizer: SanitizerConfig,

    /// In-process producer tuning (file watcher, git prober)
    #[serde(default)]
    pub collectors: CollectorsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ingestion server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Override for the Unix socket path (default: data dir)
    pub socket_path: Option<PathBuf>,

    /// Capacity of the queue between server and correlator
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-connection unread backlog bound (drop-oldest past this)
    #[serde(default = "default_connection_backlog")]
    pub connection_backlog: usize,

    /// Maximum accepted frame size in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            queue_capacity: default_queue_capacity(),
            connection_backlog: default_connection_backlog(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_connection_backlog() -> usize {
    256
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

/// Correlation window configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorrelatorConfig {
    /// Rolling window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Heartbeat interval in seconds (upper bound on queue waits)
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Duplicate-command tolerance in milliseconds
    #[serde(default = "default_dedup_tolerance_ms")]
    pub dedup_tolerance_ms: u64,

    /// Gap tolerance for extending an open aggregated event, in seconds
    #[serde(default = "default_merge_gap_secs")]
    pub merge_gap_secs: u64,

    /// Same-command failures needed for an error-loop episode
    #[serde(default = "default_error_loop_threshold")]
    pub error_loop_threshold: usize,

    /// Distinct modified files needed for an active-editing episode
    #[serde(default = "default_editing_file_threshold")]
    pub editing_file_threshold: usize,

    /// Distinct markdown files needed for a doc-writing episode
    #[serde(default = "default_doc_file_threshold")]
    pub doc_file_threshold: usize,

    /// Commit/push commands needed for a git-burst episode
    #[serde(default = "default_git_burst_threshold")]
    pub git_burst_threshold: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            dedup_tolerance_ms: default_dedup_tolerance_ms(),
            merge_gap_secs: default_merge_gap_secs(),
            error_loop_threshold: default_error_loop_threshold(),
            editing_file_threshold: default_editing_file_threshold(),
            doc_file_threshold: default_doc_file_threshold(),
            git_burst_threshold: default_git_burst_threshold(),
        }
    }
}

fn default_window_secs() -> u64 {
    600
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_dedup_tolerance_ms() -> u64 {
    800
}

fn default_merge_gap_secs() -> u64 {
    120
}

fn default_error_loop_threshold() -> usize {
    3
}

fn default_editing_file_threshold() -> usize {
    10
}

fn default_doc_file_threshold() -> usize {
    5
}

fn default_git_burst_threshold() -> usize {
    3
}

/// Anomaly detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    /// Cooldown per (anomaly type, directory) in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Lookback window for anomaly checks in seconds
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,

    /// Same-command failures that constitute an error loop
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: usize,

    /// Minimum commands in the lookback before rate checks apply
    #[serde(default = "default_min_commands")]
    pub min_commands: usize,

    /// Failure-rate threshold for repeated_failure
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,

    /// Failed build/test commands that constitute build thrash
    #[serde(default = "default_build_failure_threshold")]
    pub build_failure_threshold: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            lookback_secs: default_lookback_secs(),
            repeat_threshold: default_repeat_threshold(),
            min_commands: default_min_commands(),
            failure_rate: default_failure_rate(),
            build_failure_threshold: default_build_failure_threshold(),
        }
    }
}

fn default_cooldown_secs() -> u64 {
    1800
}

fn default_lookback_secs() -> u64 {
    300
}

fn default_repeat_threshold() -> usize {
    3
}

fn default_min_commands() -> usize {
    5
}

fn default_failure_rate() -> f64 {
    0.5
}

fn default_build_failure_threshold() -> usize {
    5
}

/// External inference service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Inference endpoint URL (required to run the daemon)
    pub endpoint: Option<String>,

    /// Model name passed through to the service
    #[serde(default = "default_model")]
    pub model: String,

    /// API key (can also come from the WORKLENS_API_KEY env var)
    pub api_key: Option<String>,

    /// Request timeout in seconds (the one long timeout in the pipeline)
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts after the first failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds (doubles per attempt, capped at 30s)
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Periodic classification cadence in seconds
    #[serde(default = "default_cadence_secs")]
    pub cadence_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: default_model(),
            api_key: None,
            timeout_secs: default_inference_timeout(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            cadence_secs: default_cadence_secs(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_inference_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_cadence_secs() -> u64 {
    600
}

impl InferenceConfig {
    /// Resolve the API key from config or environment
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("WORKLENS_API_KEY").ok())
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_none() {
            return Err(Error::Config(
                "inference.endpoint is required to run the daemon".to_string(),
            ));
        }
        if self.max_retries > 10 {
            return Err(Error::Config(
                "inference.max_retries must be at most 10".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retention horizons
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Days to keep raw records (commands, samples, file events, git contexts)
    #[serde(default = "default_raw_days")]
    pub raw_days: u32,

    /// Days to keep derived records (aggregated events, analyses, interventions)
    #[serde(default = "default_derived_days")]
    pub derived_days: u32,

    /// Days of inactivity before a discovered directory is deactivated
    #[serde(default = "default_dir_inactive_days")]
    pub dir_inactive_days: u32,

    /// Hours between retention runs
    #[serde(default = "default_retention_cadence_hours")]
    pub cadence_hours: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_days: default_raw_days(),
            derived_days: default_derived_days(),
            dir_inactive_days: default_dir_inactive_days(),
            cadence_hours: default_retention_cadence_hours(),
        }
    }
}

fn default_raw_days() -> u32 {
    7
}

fn default_derived_days() -> u32 {
    30
}

fn default_dir_inactive_days() -> u32 {
    30
}

fn default_retention_cadence_hours() -> u32 {
    24
}

/// Extra redaction rules supplied by the user
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SanitizerConfig {
    /// Applied after the built-in rules, in the given order.
    /// A pattern that fails to compile is a fatal startup error.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// In-process producer configuration (file watcher, git prober)
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorsConfig {
    /// Debounce interval for file events in milliseconds
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,

    /// Maximum number of discovered directories to watch
    #[serde(default = "default_watch_max_dirs")]
    pub watch_max_dirs: usize,

    /// How often the watch list is refreshed, in seconds
    #[serde(default = "default_watch_rescan_secs")]
    pub watch_rescan_secs: u64,

    /// File extensions worth recording
    #[serde(default = "default_watch_extensions")]
    pub watch_extensions: Vec<String>,

    /// Git context re-probe interval for an unchanged directory, in seconds
    #[serde(default = "default_git_recheck_secs")]
    pub git_recheck_secs: u64,
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            watch_debounce_ms: default_watch_debounce_ms(),
            watch_max_dirs: default_watch_max_dirs(),
            watch_rescan_secs: default_watch_rescan_secs(),
            watch_extensions: default_watch_extensions(),
            git_recheck_secs: default_git_recheck_secs(),
        }
    }
}

fn default_watch_debounce_ms() -> u64 {
    2000
}

fn default_watch_max_dirs() -> usize {
    5
}

fn default_watch_rescan_secs() -> u64 {
    300
}

fn default_watch_extensions() -> Vec<String> {
    [
        "py", "js", "ts", "jsx", "tsx", "java", "c", "cpp", "h", "hpp", "go", "rs", "rb", "php",
        "md", "rst", "txt", "toml", "yaml", "yml", "json", "xml",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_git_recheck_secs() -> u64 {
    300
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/worklens/config.toml` (~/.config/worklens/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("worklens").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite database and socket)
    ///
    /// `$XDG_DATA_HOME/worklens/` (~/.local/share/worklens/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("worklens")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/worklens/` (~/.local/state/worklens/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("worklens")
    }

    /// Returns the database file path
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("worklens.db")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("worklens.log")
    }

    /// Returns the ingestion socket path, honoring the config override
    pub fn socket_path(&self) -> PathBuf {
        self.ingest
            .socket_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("worklensd.sock"))
    }
}
