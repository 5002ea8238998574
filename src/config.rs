//! Runtime configuration.
//!
//! Loading order, highest priority first: command line arguments, then
//! environment variables, then `config.toml`, then built-in defaults.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ingestion: IngestionConfig,
    pub syslog: SyslogConfig,
    pub index: IndexConfig,
    pub archive: ArchiveConfig,
    pub cache: CacheConfig,
    pub redaction: RedactionConfig,
    pub retention: RetentionConfig,
    pub alarm: AlarmConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8088 }
    }
}

/// One entry per configured `LOG_DIRS` directory, each a File Scanner
/// source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub log_dirs: Vec<LogDirConfig>,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub scan_period_secs: u64,
    pub buffer_capacity: usize,
    pub buffer_batch_threshold: usize,
    #[serde(deserialize_with = "deserialize_duration_ms")]
    pub drain_interval_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            log_dirs: Vec::new(),
            scan_period_secs: 5,
            buffer_capacity: 10_000,
            buffer_batch_threshold: 1_024,
            drain_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogDirConfig {
    pub directory: String,
    #[serde(default = "default_glob")]
    pub glob: String,
    #[serde(default)]
    pub recursive: bool,
}

fn default_glob() -> String {
    "*.log".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyslogConfig {
    pub enabled: bool,
    pub port: u16,
    pub proto: String,
    pub format: String,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self { enabled: false, port: 5514, proto: "UDP".to_string(), format: "RFC5424".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub dir: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { dir: "data/index".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub dir: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { dir: "data/archives".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    #[serde(deserialize_with = "deserialize_duration_ms")]
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, max_size: 1024, ttl_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub config_path: Option<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self { config_path: Some("data/redaction.json".to_string()) }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub state_path: String,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub run_period_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { state_path: "data/retention.json".to_string(), run_period_secs: 300 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    pub state_path: String,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub eval_period_secs: u64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self { state_path: "data/alarms.json".to_string(), eval_period_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,grepwise_core=debug".to_string(),
            file: Some("logs/grepwise.log".to_string()),
        }
    }
}

/// Command line argument overrides (highest priority in `Config::load`).
#[derive(Parser, Debug, Clone)]
#[command(name = "grepwise-server")]
#[command(version, about = "GrepWise - log analytics control plane")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Index storage directory (overrides config file)
    #[arg(long, value_name = "PATH")]
    pub index_dir: Option<String>,

    /// Archive storage directory (overrides config file)
    #[arg(long, value_name = "PATH")]
    pub archive_dir: Option<String>,

    /// Syslog listener port (overrides config file, 0 disables)
    #[arg(long, value_name = "PORT")]
    pub syslog_port: Option<u16>,

    /// Logging level (overrides config file, e.g. "info,grepwise_core=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Cache max size (overrides config file)
    #[arg(long, value_name = "N")]
    pub cache_max_size: Option<usize>,

    /// Cache TTL (overrides config file, e.g. "60s", "5m")
    #[arg(long, value_name = "DURATION")]
    pub cache_ttl: Option<String>,

    /// Enable/disable the search cache (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub cache_enabled: Option<bool>,
}

impl Config {
    /// Load configuration with command line, environment variable, and
    /// file support.
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables
    /// 3. Configuration file (`config.toml`)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - `GREPWISE_SERVER_HOST`, `GREPWISE_SERVER_PORT`
    /// - `LOG_DIRS`: comma-separated `directory[:glob[:recursive]]` entries
    /// - `SYSLOG_PORT`, `SYSLOG_PROTO`, `SYSLOG_FORMAT`
    /// - `INDEX_DIR`, `ARCHIVE_DIR`
    /// - `CACHE_MAX_SIZE`, `CACHE_TTL_MS`, `CACHE_ENABLED`
    /// - `REDACTION_CONFIG`
    /// - `GREPWISE_LOG_LEVEL`
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("GREPWISE_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }
        if let Ok(port) = std::env::var("GREPWISE_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            tracing::info!("Override server.port from env: {}", self.server.port);
        }

        if let Ok(dirs) = std::env::var("LOG_DIRS") {
            self.ingestion.log_dirs = dirs
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(parse_log_dir_entry)
                .collect();
            tracing::info!(
                "Override ingestion.log_dirs from env: {} entries",
                self.ingestion.log_dirs.len()
            );
        }

        if let Ok(port) = std::env::var("SYSLOG_PORT")
            && let Ok(port) = port.parse()
        {
            self.syslog.port = port;
            self.syslog.enabled = true;
            tracing::info!("Override syslog.port from env: {}", self.syslog.port);
        }
        if let Ok(proto) = std::env::var("SYSLOG_PROTO") {
            self.syslog.proto = proto;
            tracing::info!("Override syslog.proto from env: {}", self.syslog.proto);
        }
        if let Ok(format) = std::env::var("SYSLOG_FORMAT") {
            self.syslog.format = format;
            tracing::info!("Override syslog.format from env: {}", self.syslog.format);
        }

        if let Ok(dir) = std::env::var("INDEX_DIR") {
            self.index.dir = dir;
            tracing::info!("Override index.dir from env: {}", self.index.dir);
        }
        if let Ok(dir) = std::env::var("ARCHIVE_DIR") {
            self.archive.dir = dir;
            tracing::info!("Override archive.dir from env: {}", self.archive.dir);
        }

        if let Ok(size) = std::env::var("CACHE_MAX_SIZE")
            && let Ok(size) = size.parse()
        {
            self.cache.max_size = size;
            tracing::info!("Override cache.max_size from env: {}", self.cache.max_size);
        }
        if let Ok(ttl) = std::env::var("CACHE_TTL_MS") {
            match parse_duration_to_ms(&ttl) {
                Ok(val) => {
                    self.cache.ttl_ms = val;
                    tracing::info!("Override cache.ttl_ms from env: {}", self.cache.ttl_ms);
                },
                Err(e) => {
                    tracing::warn!("Invalid CACHE_TTL_MS '{}': {} (keep {})", ttl, e, self.cache.ttl_ms)
                },
            }
        }
        if let Ok(enabled) = std::env::var("CACHE_ENABLED")
            && let Ok(val) = enabled.parse()
        {
            self.cache.enabled = val;
            tracing::info!("Override cache.enabled from env: {}", self.cache.enabled);
        }

        if let Ok(path) = std::env::var("REDACTION_CONFIG") {
            self.redaction.config_path = Some(path);
            tracing::info!("Override redaction.config_path from env");
        }

        if let Ok(level) = std::env::var("GREPWISE_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }
    }

    /// Apply command line argument overrides (highest priority).
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }
        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }
        if let Some(dir) = &args.index_dir {
            self.index.dir = dir.clone();
            tracing::info!("Override index.dir from CLI: {}", self.index.dir);
        }
        if let Some(dir) = &args.archive_dir {
            self.archive.dir = dir.clone();
            tracing::info!("Override archive.dir from CLI: {}", self.archive.dir);
        }
        if let Some(port) = args.syslog_port {
            self.syslog.port = port;
            self.syslog.enabled = port != 0;
            tracing::info!("Override syslog.port from CLI: {}", self.syslog.port);
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }
        if let Some(size) = args.cache_max_size {
            self.cache.max_size = size;
            tracing::info!("Override cache.max_size from CLI: {}", self.cache.max_size);
        }
        if let Some(ttl) = &args.cache_ttl {
            match parse_duration_to_ms(ttl) {
                Ok(val) => {
                    self.cache.ttl_ms = val;
                    tracing::info!("Override cache.ttl_ms from CLI: {}", self.cache.ttl_ms);
                },
                Err(e) => tracing::warn!(
                    "Invalid --cache-ttl '{}': {} (keep {})",
                    ttl,
                    e,
                    self.cache.ttl_ms
                ),
            }
        }
        if let Some(enabled) = args.cache_enabled {
            self.cache.enabled = enabled;
            tracing::info!("Override cache.enabled from CLI: {}", self.cache.enabled);
        }
    }

    /// Validate configuration.
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be 0");
        }
        if self.index.dir.is_empty() {
            anyhow::bail!("index.dir cannot be empty");
        }
        if self.archive.dir.is_empty() {
            anyhow::bail!("archive.dir cannot be empty");
        }
        if self.cache.max_size == 0 {
            anyhow::bail!("cache.max_size must be > 0");
        }
        if self.syslog.enabled && !matches!(self.syslog.proto.to_uppercase().as_str(), "TCP" | "UDP")
        {
            anyhow::bail!("syslog.proto must be TCP or UDP");
        }
        if self.syslog.enabled
            && !matches!(self.syslog.format.to_uppercase().as_str(), "RFC5424" | "RFC3164")
        {
            anyhow::bail!("syslog.format must be RFC5424 or RFC3164");
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];
        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

fn parse_log_dir_entry(entry: &str) -> LogDirConfig {
    let mut parts = entry.splitn(3, ':');
    let directory = parts.next().unwrap_or_default().to_string();
    let glob = parts.next().filter(|s| !s.is_empty()).unwrap_or("*.log").to_string();
    let recursive = matches!(parts.next(), Some("true") | Some("recursive"));
    LogDirConfig { directory, glob, recursive }
}

// =========================
// Helpers for parsing values
// =========================

fn parse_duration_to_secs(input: &str) -> Result<u64, String> {
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }
    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60),
        "h" | "hr" | "hour" | "hours" => Ok(n * 60 * 60),
        "d" | "day" | "days" => Ok(n * 60 * 60 * 24),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

fn parse_duration_to_ms(input: &str) -> Result<u64, String> {
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }
    parse_duration_to_secs(input).map(|secs| secs * 1000)
}

// Custom serde deserializers to support numeric or human-friendly string values.
fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of seconds or a string like '30s', '5m', '1h'")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v >= 0 { Ok(v as u64) } else { Err(E::custom("negative not allowed")) }
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(&v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}

fn deserialize_duration_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of milliseconds or a string like '250ms', '5s', '1m'")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v >= 0 { Ok(v as u64) } else { Err(E::custom("negative not allowed")) }
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if let Some(stripped) = v.strip_suffix("ms") {
                return stripped.trim().parse().map_err(|_| E::custom("invalid number"));
            }
            parse_duration_to_ms(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            self.visit_str(&v)
        }
    }
    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_port_fails_validation() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_dir_entry_parses_directory_glob_and_recursive_flag() {
        let entry = parse_log_dir_entry("/var/log/app:*.log:true");
        assert_eq!(entry.directory, "/var/log/app");
        assert_eq!(entry.glob, "*.log");
        assert!(entry.recursive);
    }

    #[test]
    fn duration_parses_human_friendly_units() {
        assert_eq!(parse_duration_to_secs("30s").unwrap(), 30);
        assert_eq!(parse_duration_to_secs("5m").unwrap(), 300);
    }
}
