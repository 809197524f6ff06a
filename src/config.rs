//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `EDGEGATE_BACKEND_URL`, `EDGEGATE_DEVICE_ID`,
//!    `EDGEGATE_LISTEN`, `EDGEGATE_API_KEY`, `EDGEGATE_GATEWAY`
//! 2. **Config file**: path via `--config <path>`, or `edgegate.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:2050"
//! max_connections = 64
//! request_timeout_ms = 15000
//!
//! [portal]
//! gateway_address = "192.168.4.1"
//! port = 2050
//! splash_path = "/splash"
//!
//! [backend]
//! url = "http://localhost:5835"
//! timeout_ms = 10000
//! validate_path = "/api/session/validate"
//! device_id = "edge-0001"
//!
//! [firewall]
//! mode = "iptables"            # or "dry-run"
//! iptables = "iptables"
//! ip6tables = "ip6tables"
//! sysctl = "sysctl"
//! use_sudo = false
//! lan_interface = "wlan0"
//! wan_interface = "eth0"
//! command_timeout_ms = 5000
//! manage_base_rules = true
//!
//! [sweeper]
//! interval_secs = 60
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [logging]
//! level = "info"
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "edgegate.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub portal: PortalConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:2050`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum requests in flight (default 64).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-request timeout in milliseconds (default 15 000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Where unauthenticated clients are sent.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    /// LAN-side address of this gateway (default `192.168.4.1`).
    #[serde(default = "default_gateway_address")]
    pub gateway_address: String,
    /// Port the portal is reachable on from the LAN (default 2050).
    #[serde(default = "default_portal_port")]
    pub port: u16,
    /// Path of the splash page (default `/splash`).
    #[serde(default = "default_splash_path")]
    pub splash_path: String,
}

/// Token validation backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL (default `http://localhost:5835`). Override with `EDGEGATE_BACKEND_URL`.
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Request timeout in milliseconds (default 10 000).
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
    /// Validation endpoint, appended to `url`.
    #[serde(default = "default_validate_path")]
    pub validate_path: String,
    /// Identity of this edge device, sent as `X-Edge-Device`.
    /// Override with `EDGEGATE_DEVICE_ID`.
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

/// Which enforcement backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum FirewallMode {
    #[default]
    #[serde(rename = "iptables")]
    Iptables,
    /// Track rules in memory; nothing on the host changes.
    #[serde(rename = "dry-run")]
    DryRun,
}

/// Host firewall settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallConfig {
    #[serde(default)]
    pub mode: FirewallMode,
    #[serde(default = "default_iptables")]
    pub iptables: String,
    #[serde(default = "default_ip6tables")]
    pub ip6tables: String,
    #[serde(default = "default_sysctl")]
    pub sysctl: String,
    /// Prefix firewall commands with `sudo -n` (default false).
    #[serde(default)]
    pub use_sudo: bool,
    /// Interface clients connect on (default `wlan0`).
    #[serde(default = "default_lan_interface")]
    pub lan_interface: String,
    /// Uplink interface (default `eth0`).
    #[serde(default = "default_wan_interface")]
    pub wan_interface: String,
    /// Per-command timeout in milliseconds (default 5000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Install the portal's global rules at startup and remove them on
    /// shutdown (default true). Disable when something else owns them.
    #[serde(default = "default_manage_base_rules")]
    pub manage_base_rules: bool,
}

/// Expiry sweeper settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between sweeps (default 60).
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

/// Supervisor settings for `edgegate supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

/// Operator API authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token for `/status` and `/api/*`. Override with
    /// `EDGEGATE_API_KEY`. Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:2050".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_request_timeout_ms() -> u64 {
    15000
}
fn default_gateway_address() -> String {
    "192.168.4.1".to_string()
}
fn default_portal_port() -> u16 {
    2050
}
fn default_splash_path() -> String {
    "/splash".to_string()
}
fn default_backend_url() -> String {
    "http://localhost:5835".to_string()
}
fn default_backend_timeout_ms() -> u64 {
    10000
}
fn default_validate_path() -> String {
    "/api/session/validate".to_string()
}
fn default_device_id() -> String {
    "edge-0001".to_string()
}
fn default_iptables() -> String {
    "iptables".to_string()
}
fn default_ip6tables() -> String {
    "ip6tables".to_string()
}
fn default_sysctl() -> String {
    "sysctl".to_string()
}
fn default_lan_interface() -> String {
    "wlan0".to_string()
}
fn default_wan_interface() -> String {
    "eth0".to_string()
}
fn default_command_timeout_ms() -> u64 {
    5000
}
fn default_manage_base_rules() -> bool {
    true
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            gateway_address: default_gateway_address(),
            port: default_portal_port(),
            splash_path: default_splash_path(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            timeout_ms: default_backend_timeout_ms(),
            validate_path: default_validate_path(),
            device_id: default_device_id(),
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            mode: FirewallMode::default(),
            iptables: default_iptables(),
            ip6tables: default_ip6tables(),
            sysctl: default_sysctl(),
            use_sudo: false,
            lan_interface: default_lan_interface(),
            wan_interface: default_wan_interface(),
            command_timeout_ms: default_command_timeout_ms(),
            manage_base_rules: default_manage_base_rules(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl PortalConfig {
    /// Absolute splash URL unauthenticated probes are redirected to.
    pub fn splash_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.gateway_address, self.port, self.splash_path
        )
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `edgegate.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply environment overrides through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("EDGEGATE_BACKEND_URL") {
            self.backend.url = url;
        }
        if let Some(id) = lookup("EDGEGATE_DEVICE_ID") {
            self.backend.device_id = id;
        }
        if let Some(listen) = lookup("EDGEGATE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(key) = lookup("EDGEGATE_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(gateway) = lookup("EDGEGATE_GATEWAY") {
            self.portal.gateway_address = gateway;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid {
                key: "server.listen",
                value: self.server.listen.clone(),
            });
        }
        if self.portal.gateway_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid {
                key: "portal.gateway_address",
                value: self.portal.gateway_address.clone(),
            });
        }
        if !self.portal.splash_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                key: "portal.splash_path",
                value: self.portal.splash_path.clone(),
            });
        }
        if !(self.backend.url.starts_with("http://") || self.backend.url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "backend.url",
                value: self.backend.url.clone(),
            });
        }
        let zero_checks = [
            (
                "server.max_connections",
                u64::try_from(self.server.max_connections).unwrap_or(u64::MAX),
            ),
            ("server.request_timeout_ms", self.server.request_timeout_ms),
            ("backend.timeout_ms", self.backend.timeout_ms),
            ("firewall.command_timeout_ms", self.firewall.command_timeout_ms),
            ("sweeper.interval_secs", self.sweeper.interval_secs),
        ];
        if let Some(&(key, _)) = zero_checks.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}
