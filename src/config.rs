//! Daemon configuration loading.
//!
//! TOML is the sole config source. Default path: `/etc/edge-bridge/config.toml`.
//! A handful of fields are overridable by environment variable after parsing,
//! matching the contract in the wire protocol section of the project's
//! external-interfaces notes: `EDGE_SECRET`, `USER_PHONE`, `BACKEND_URL`.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (validated, defaulted)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub edge: EdgeConfig,
    pub backend: BackendConfig,
    pub websocket: WebsocketConfig,
    pub imessage: ImessageConfig,
    pub scheduler: SchedulerConfig,
    pub performance: PerformanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub agent_id: String,
    pub user_phone: String,
    /// The shared Bearer secret. Never logged.
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    pub sync_interval_seconds: u64,
    pub request_timeout_ms: u64,
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    pub enabled: bool,
    pub ping_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ImessageConfig {
    pub poll_interval_seconds: u64,
    pub db_path: String,
    pub attachments_path: String,
    pub enable_fast_check: bool,
    pub max_messages_per_poll: u32,
    /// Subprocess invoked for the chat-send action (`osascript` wrapping the
    /// platform's send/compose AppleScript on the real target).
    pub send_action_binary: String,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub check_interval_seconds: u64,
    pub adaptive_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceProfile {
    Balanced,
    LowLatency,
    LowResource,
}

#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    pub profile: PerformanceProfile,
    pub parallel_message_processing: usize,
    pub batch_applescript_sends: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (all-Option, validated/defaulted below)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    edge: Option<RawEdgeConfig>,
    backend: Option<RawBackendConfig>,
    websocket: Option<RawWebsocketConfig>,
    imessage: Option<RawImessageConfig>,
    scheduler: Option<RawSchedulerConfig>,
    performance: Option<RawPerformanceConfig>,
    logging: Option<RawLoggingConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct RawEdgeConfig {
    agent_id: Option<String>,
    user_phone: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawBackendConfig {
    url: Option<String>,
    sync_interval_seconds: Option<u64>,
    request_timeout_ms: Option<u64>,
    max_concurrent_requests: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RawWebsocketConfig {
    enabled: Option<bool>,
    ping_interval_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawImessageConfig {
    poll_interval_seconds: Option<u64>,
    db_path: Option<String>,
    attachments_path: Option<String>,
    enable_fast_check: Option<bool>,
    max_messages_per_poll: Option<u32>,
    send_action_binary: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSchedulerConfig {
    check_interval_seconds: Option<u64>,
    adaptive_mode: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawPerformanceConfig {
    profile: Option<String>,
    parallel_message_processing: Option<usize>,
    batch_applescript_sends: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawLoggingConfig {
    level: Option<String>,
    file: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path `/etc/edge-bridge/config.toml`.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/edge-bridge/config.toml"))
}

/// Load config from a TOML string, then apply the `EDGE_SECRET` /
/// `USER_PHONE` / `BACKEND_URL` environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    load_config_from_raw(raw, |name| std::env::var(name).ok())
}

fn load_config_from_raw(
    raw: RawConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let raw_edge = raw.edge.unwrap_or_default();
    let user_phone = env("USER_PHONE")
        .or(raw_edge.user_phone)
        .ok_or_else(|| ConfigError::MissingField("edge.user_phone".to_owned()))?;
    let agent_id = raw_edge
        .agent_id
        .unwrap_or_else(|| format!("edge_{}", digits_only(&user_phone)));
    let secret = env("EDGE_SECRET").ok_or_else(|| ConfigError::MissingField("EDGE_SECRET".to_owned()))?;

    let raw_backend = raw.backend.unwrap_or_default();
    let url = env("BACKEND_URL")
        .or(raw_backend.url)
        .ok_or_else(|| ConfigError::MissingField("backend.url".to_owned()))?;
    let backend = BackendConfig {
        url,
        sync_interval_seconds: raw_backend.sync_interval_seconds.unwrap_or(30),
        request_timeout_ms: raw_backend.request_timeout_ms.unwrap_or(60_000),
        max_concurrent_requests: raw_backend.max_concurrent_requests.unwrap_or(5),
    };

    let raw_ws = raw.websocket.unwrap_or_default();
    let websocket = WebsocketConfig {
        enabled: raw_ws.enabled.unwrap_or(true),
        ping_interval_seconds: raw_ws.ping_interval_seconds.unwrap_or(30),
    };

    let raw_imessage = raw.imessage.unwrap_or_default();
    let db_path = raw_imessage
        .db_path
        .ok_or_else(|| ConfigError::MissingField("imessage.db_path".to_owned()))?;
    let attachments_path = raw_imessage
        .attachments_path
        .ok_or_else(|| ConfigError::MissingField("imessage.attachments_path".to_owned()))?;
    let imessage = ImessageConfig {
        poll_interval_seconds: raw_imessage.poll_interval_seconds.unwrap_or(1),
        db_path,
        attachments_path,
        enable_fast_check: raw_imessage.enable_fast_check.unwrap_or(true),
        max_messages_per_poll: raw_imessage.max_messages_per_poll.unwrap_or(100),
        send_action_binary: raw_imessage
            .send_action_binary
            .unwrap_or_else(|| "osascript".to_owned()),
    };

    let raw_scheduler = raw.scheduler.unwrap_or_default();
    let scheduler = SchedulerConfig {
        check_interval_seconds: raw_scheduler.check_interval_seconds.unwrap_or(60),
        adaptive_mode: raw_scheduler.adaptive_mode.unwrap_or(true),
    };

    let raw_perf = raw.performance.unwrap_or_default();
    let profile = match raw_perf.profile.as_deref() {
        None | Some("balanced") => PerformanceProfile::Balanced,
        Some("low-latency") => PerformanceProfile::LowLatency,
        Some("low-resource") => PerformanceProfile::LowResource,
        Some(other) => {
            return Err(ConfigError::InvalidValue(format!(
                "performance.profile must be one of balanced/low-latency/low-resource, got '{other}'"
            )));
        }
    };
    let default_parallelism = match profile {
        PerformanceProfile::Balanced => 3,
        PerformanceProfile::LowLatency => 5,
        PerformanceProfile::LowResource => 1,
    };
    let performance = PerformanceConfig {
        profile,
        parallel_message_processing: raw_perf
            .parallel_message_processing
            .unwrap_or(default_parallelism),
        batch_applescript_sends: raw_perf.batch_applescript_sends.unwrap_or(true),
    };

    let raw_logging = raw.logging.unwrap_or_default();
    let logging = LoggingConfig {
        level: raw_logging.level.unwrap_or_else(|| "info".to_owned()),
        file: raw_logging.file,
    };

    Ok(Config {
        edge: EdgeConfig {
            agent_id,
            user_phone,
            secret,
        },
        backend,
        websocket,
        imessage,
        scheduler,
        performance,
        logging,
    })
}

fn digits_only(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}
