//! Configuration: defaults, YAML file, then `EDGEBOT_*` environment, in
//! ascending priority. CLI flags are applied by the binary on top.
//!
//! Nested keys map through the environment with `__` separators
//! (`EDGEBOT_SERVER__PORT=9000`), plus a few flat aliases kept for operator
//! muscle memory: `EDGEBOT_MOTHERSHIP_URL`, `EDGEBOT_AUTH_TOKEN`,
//! `EDGEBOT_LOG_LEVEL`.

mod byte_size;
mod log_level;

pub use byte_size::ByteSize;
pub use log_level::{LogFormat, LogLevel};

use crate::breaker::BreakerConfig;
use crate::limiter::RateMode;
use crate::retry::RetryPolicy;
use crate::supervisor::RestartPolicy;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("invalid configuration: {0}")]
    Parse(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub inputs: InputsConfig,
    pub output: OutputConfig,
    pub batching: BatchingConfig,
    pub buffer: BufferConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerSettings,
    pub rate_limit: RateLimitConfig,
    pub supervisor: SupervisorConfig,
    pub log: LogConfig,
    /// The edge node's identity string in outbound batches.
    pub node_id: String,
    /// Accepted forward skew of `event_ts` over `received_at`, in seconds.
    pub clock_skew_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            inputs: InputsConfig::default(),
            output: OutputConfig::default(),
            batching: BatchingConfig::default(),
            buffer: BufferConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerSettings::default(),
            rate_limit: RateLimitConfig::default(),
            supervisor: SupervisorConfig::default(),
            log: LogConfig::default(),
            node_id: "edgebot".to_string(),
            clock_skew_sec: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8081,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct InputsConfig {
    pub syslog: SyslogInputConfig,
    pub files: FilesInputConfig,
    pub snmp: SnmpInputConfig,
    pub weather: WeatherInputConfig,
    pub nmea: NmeaInputConfig,
    pub flows: FlowsInputConfig,
    pub discovery: DiscoveryInputConfig,
    pub sim: SimInputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyslogInputConfig {
    pub enabled: bool,
    pub host: String,
    pub udp_port: u16,
}

impl Default for SyslogInputConfig {
    fn default() -> Self {
        SyslogInputConfig {
            enabled: false,
            host: "0.0.0.0".to_string(),
            udp_port: 5514,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesInputConfig {
    pub enabled: bool,
    pub paths: Vec<PathBuf>,
    pub scan_interval_ms: u64,
    /// Read existing content on first registration instead of seeking to
    /// the end.
    pub from_beginning: bool,
}

impl Default for FilesInputConfig {
    fn default() -> Self {
        FilesInputConfig {
            enabled: false,
            paths: Vec::new(),
            scan_interval_ms: 2_000,
            from_beginning: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnmpInputConfig {
    pub enabled: bool,
    pub host: String,
    /// Trap/notification intake port. The standard port 162 needs elevated
    /// privileges; remap on locked-down hosts.
    pub trap_port: u16,
}

impl Default for SnmpInputConfig {
    fn default() -> Self {
        SnmpInputConfig {
            enabled: false,
            host: "0.0.0.0".to_string(),
            trap_port: 162,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherInputConfig {
    pub enabled: bool,
    pub url: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub interval_sec: u64,
    pub timeout_sec: u64,
}

impl Default for WeatherInputConfig {
    fn default() -> Self {
        WeatherInputConfig {
            enabled: false,
            url: "https://api.open-meteo.com/v1/forecast".to_string(),
            latitude: None,
            longitude: None,
            interval_sec: 3600,
            timeout_sec: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NmeaInputConfig {
    pub enabled: bool,
    pub host: String,
    pub udp_port: u16,
}

impl Default for NmeaInputConfig {
    fn default() -> Self {
        NmeaInputConfig {
            enabled: false,
            host: "0.0.0.0".to_string(),
            udp_port: 10110,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowsInputConfig {
    pub enabled: bool,
    pub host: String,
    pub netflow_ports: Vec<u16>,
    pub ipfix_ports: Vec<u16>,
    pub sflow_ports: Vec<u16>,
}

impl Default for FlowsInputConfig {
    fn default() -> Self {
        FlowsInputConfig {
            enabled: false,
            host: "0.0.0.0".to_string(),
            netflow_ports: vec![2055],
            ipfix_ports: vec![4739],
            sflow_ports: vec![6343],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryInputConfig {
    pub enabled: bool,
    pub interval_sec: u64,
    pub extra_logs: Vec<PathBuf>,
}

impl Default for DiscoveryInputConfig {
    fn default() -> Self {
        DiscoveryInputConfig {
            enabled: false,
            interval_sec: 300,
            extra_logs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimInputConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for SimInputConfig {
    fn default() -> Self {
        SimInputConfig {
            enabled: false,
            interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub primary: SinkConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Http,
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub url: String,
    pub auth_token: Option<String>,
    pub compression: bool,
    pub timeout_ms: u64,
    pub tls: TlsConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            kind: SinkKind::Http,
            url: String::new(),
            auth_token: None,
            compression: true,
            timeout_ms: 30_000,
            tls: TlsConfig::default(),
        }
    }
}

impl SinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub verify: bool,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_bundle: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            verify: true,
            client_cert: None,
            client_key: None,
            ca_bundle: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub max_size: usize,
    pub max_bytes: ByteSize,
    pub timeout_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        BatchingConfig {
            max_size: 100,
            max_bytes: ByteSize(1 << 20),
            timeout_ms: 5_000,
        }
    }
}

impl BatchingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Event cap for the in-memory spool.
    pub max_size: usize,
    /// Durable spool on local storage; in-memory only when disabled.
    pub disk_buffer: bool,
    pub disk_buffer_path: PathBuf,
    pub disk_buffer_max_size: ByteSize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            max_size: 10_000,
            disk_buffer: true,
            disk_buffer_path: PathBuf::from("/var/lib/edgebot"),
            disk_buffer_max_size: ByteSize(100 << 20),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_duration_sec: u64,
    pub half_open_max_inflight: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        BreakerSettings {
            failure_threshold: 5,
            open_duration_sec: 60,
            half_open_max_inflight: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub mode: RateMode,
    pub capacity: u64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            mode: RateMode::Events,
            capacity: 1_000,
            refill_per_sec: 500.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub shutdown_grace_sec: u64,
    pub max_restart_attempts: u32,
    pub restart_window_sec: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            shutdown_grace_sec: 30,
            max_restart_attempts: 10,
            restart_window_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Config {
    /// Loads file + environment and validates. The file must exist; a
    /// missing path is an operator error, not a silent default.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                reason: "file not found".to_string(),
            });
        }

        let mut config: Config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("EDGEBOT_").split("__"))
            .extract()
            .map_err(Box::new)?;

        config.apply_env_aliases();
        config.validate()?;
        Ok(config)
    }

    /// Flat environment aliases that win over the file, matching the
    /// documented `EDGEBOT_<UPPER_SNAKE>` surface.
    fn apply_env_aliases(&mut self) {
        if let Ok(url) = std::env::var("EDGEBOT_MOTHERSHIP_URL") {
            self.output.primary.url = url;
        }
        if let Ok(token) = std::env::var("EDGEBOT_AUTH_TOKEN") {
            self.output.primary.auth_token = Some(token);
        }
        if let Ok(level) = std::env::var("EDGEBOT_LOG_LEVEL") {
            match level.parse() {
                Ok(level) => self.log.level = level,
                Err(reason) => warn!("ignoring EDGEBOT_LOG_LEVEL: {reason}"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output.primary.url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "output.primary.url must be set".to_string(),
            ));
        }
        match self.output.primary.kind {
            SinkKind::Http => {
                let url = &self.output.primary.url;
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ConfigError::Invalid(format!(
                        "output.primary.url must be http(s) for the http sink, got '{url}'"
                    )));
                }
            }
            SinkKind::File => {
                if !self.output.primary.url.starts_with("file://") {
                    return Err(ConfigError::Invalid(
                        "output.primary.url must be a file:// URL for the file sink".to_string(),
                    ));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter_factor must be within [0, 1], got {}",
                self.retry.jitter_factor
            )));
        }
        if self.batching.max_size == 0 {
            return Err(ConfigError::Invalid(
                "batching.max_size must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.capacity == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.capacity must be at least 1".to_string(),
            ));
        }
        if self.breaker.half_open_max_inflight == 0 {
            return Err(ConfigError::Invalid(
                "breaker.half_open_max_inflight must be at least 1".to_string(),
            ));
        }
        if self.inputs.weather.enabled
            && (self.inputs.weather.latitude.is_none() || self.inputs.weather.longitude.is_none())
        {
            return Err(ConfigError::Invalid(
                "inputs.weather requires latitude and longitude when enabled".to_string(),
            ));
        }
        if self.inputs.flows.enabled
            && self.inputs.flows.netflow_ports.is_empty()
            && self.inputs.flows.ipfix_ports.is_empty()
            && self.inputs.flows.sflow_ports.is_empty()
        {
            return Err(ConfigError::Invalid(
                "inputs.flows requires at least one port when enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| {
                ConfigError::Invalid(format!(
                    "server.host/server.port do not form a bind address: {e}"
                ))
            })
    }

    pub fn clock_skew_bound(&self) -> Duration {
        if self.clock_skew_sec == 0 {
            crate::envelope::DEFAULT_CLOCK_SKEW_BOUND
        } else {
            Duration::from_secs(self.clock_skew_sec)
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            jitter_factor: self.retry.jitter_factor,
            attempt_timeout: self.output.primary.timeout(),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            open_duration: Duration::from_secs(self.breaker.open_duration_sec),
            half_open_max_inflight: self.breaker.half_open_max_inflight,
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.supervisor.max_restart_attempts,
            window: Duration::from_secs(self.supervisor.restart_window_sec),
            ..RestartPolicy::default()
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.supervisor.shutdown_grace_sec)
    }

    /// Claim lease: five times the per-attempt timeout.
    pub fn claim_lease(&self) -> Duration {
        self.output.primary.timeout() * 5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
output:
  primary:
    kind: http
    url: https://mothership.example/ingest
"#;

    #[test]
    fn defaults_fill_unset_sections() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("edgebot.yaml", MINIMAL_YAML)?;
            let config = Config::load(Path::new("edgebot.yaml")).expect("loads");

            assert_eq!(config.server.port, 8081);
            assert_eq!(config.batching.max_size, 100);
            assert_eq!(config.buffer.disk_buffer_max_size.as_u64(), 100 << 20);
            assert_eq!(config.retry.max_retries, 5);
            assert_eq!(config.breaker.failure_threshold, 5);
            assert_eq!(config.supervisor.shutdown_grace_sec, 30);
            assert_eq!(config.log.level, LogLevel::Info);
            assert_eq!(config.node_id, "edgebot");
            assert_eq!(config.clock_skew_sec, 86_400);
            Ok(())
        });
    }

    #[test]
    fn yaml_sections_parse() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "edgebot.yaml",
                r#"
server:
  host: 0.0.0.0
  port: 9090
output:
  primary:
    kind: file
    url: file:///var/spool/edgebot
    compression: false
batching:
  max_size: 250
  max_bytes: "2MB"
  timeout_ms: 1000
buffer:
  disk_buffer: false
  max_size: 500
rate_limit:
  mode: bytes
  capacity: 65536
  refill_per_sec: 32768
log:
  level: debug
  format: json
node_id: buoy-7
"#,
            )?;
            let config = Config::load(Path::new("edgebot.yaml")).expect("loads");

            assert_eq!(config.server.port, 9090);
            assert_eq!(config.output.primary.kind, SinkKind::File);
            assert!(!config.output.primary.compression);
            assert_eq!(config.batching.max_size, 250);
            assert_eq!(config.batching.max_bytes.as_u64(), 2 << 20);
            assert!(!config.buffer.disk_buffer);
            assert_eq!(config.rate_limit.mode, RateMode::Bytes);
            assert_eq!(config.log.level, LogLevel::Debug);
            assert_eq!(config.log.format, LogFormat::Json);
            assert_eq!(config.node_id, "buoy-7");
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("edgebot.yaml", MINIMAL_YAML)?;
            jail.set_env("EDGEBOT_SERVER__PORT", "7070");
            jail.set_env("EDGEBOT_MOTHERSHIP_URL", "https://other.example/ingest");
            jail.set_env("EDGEBOT_AUTH_TOKEN", "sekrit");
            jail.set_env("EDGEBOT_LOG_LEVEL", "error");

            let config = Config::load(Path::new("edgebot.yaml")).expect("loads");
            assert_eq!(config.server.port, 7070);
            assert_eq!(config.output.primary.url, "https://other.example/ingest");
            assert_eq!(config.output.primary.auth_token.as_deref(), Some("sekrit"));
            assert_eq!(config.log.level, LogLevel::Error);
            Ok(())
        });
    }

    #[test]
    fn input_sections_parse() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "edgebot.yaml",
                r#"
output:
  primary:
    kind: http
    url: https://mothership.example/ingest
inputs:
  syslog:
    enabled: true
    udp_port: 1514
  files:
    enabled: true
    paths: ["/var/log/nginx/access.log"]
  snmp:
    enabled: true
    trap_port: 1162
  weather:
    enabled: true
    latitude: 59.33
    longitude: 18.06
    interval_sec: 900
  nmea:
    enabled: true
    udp_port: 10110
  flows:
    enabled: true
    netflow_ports: [2055, 9995]
    sflow_ports: []
  discovery:
    enabled: true
    interval_sec: 120
    extra_logs: ["/srv/app/app.log"]
"#,
            )?;
            let config = Config::load(Path::new("edgebot.yaml")).expect("loads");

            assert_eq!(config.inputs.syslog.udp_port, 1514);
            assert_eq!(config.inputs.files.paths.len(), 1);
            assert_eq!(config.inputs.snmp.trap_port, 1162);
            assert_eq!(config.inputs.weather.latitude, Some(59.33));
            assert_eq!(config.inputs.weather.interval_sec, 900);
            assert_eq!(config.inputs.nmea.udp_port, 10110);
            assert_eq!(config.inputs.flows.netflow_ports, vec![2055, 9995]);
            assert!(config.inputs.flows.sflow_ports.is_empty());
            assert_eq!(config.inputs.discovery.interval_sec, 120);
            Ok(())
        });
    }

    #[test]
    fn weather_requires_coordinates() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "edgebot.yaml",
                r#"
output:
  primary:
    kind: http
    url: https://mothership.example/ingest
inputs:
  weather:
    enabled: true
"#,
            )?;
            let result = Config::load(Path::new("edgebot.yaml"));
            assert!(matches!(result, Err(ConfigError::Invalid(_))));
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let result = Config::load(Path::new("/nonexistent/edgebot.yaml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn validation_catches_bad_urls() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "edgebot.yaml",
                r#"
output:
  primary:
    kind: http
    url: ftp://mothership.example
"#,
            )?;
            let result = Config::load(Path::new("edgebot.yaml"));
            assert!(matches!(result, Err(ConfigError::Invalid(_))));
            Ok(())
        });
    }

    #[test]
    fn validation_requires_file_url_for_file_sink() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "edgebot.yaml",
                r#"
output:
  primary:
    kind: file
    url: /var/spool/edgebot
"#,
            )?;
            let result = Config::load(Path::new("edgebot.yaml"));
            assert!(matches!(result, Err(ConfigError::Invalid(_))));
            Ok(())
        });
    }

    #[test]
    fn validation_bounds_jitter() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("edgebot.yaml", MINIMAL_YAML)?;
            jail.set_env("EDGEBOT_RETRY__JITTER_FACTOR", "1.5");
            let result = Config::load(Path::new("edgebot.yaml"));
            assert!(matches!(result, Err(ConfigError::Invalid(_))));
            Ok(())
        });
    }

    #[test]
    fn derived_policies_reflect_settings() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("edgebot.yaml", MINIMAL_YAML)?;
            jail.set_env("EDGEBOT_RETRY__MAX_RETRIES", "2");
            jail.set_env("EDGEBOT_OUTPUT__PRIMARY__TIMEOUT_MS", "10000");

            let config = Config::load(Path::new("edgebot.yaml")).expect("loads");
            let policy = config.retry_policy();
            assert_eq!(policy.max_retries, 2);
            assert_eq!(policy.attempt_timeout, Duration::from_secs(10));
            // Lease is 5x the per-attempt timeout.
            assert_eq!(config.claim_lease(), Duration::from_secs(50));
            Ok(())
        });
    }
}
