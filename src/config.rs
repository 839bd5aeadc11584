//! Configuration loading with Figment.
//!
//! Configuration is merged from:
//! 1. a TOML file (default `config/race-timer.toml`)
//! 2. environment variables prefixed with `RACE_TIMER_`, using `__` between
//!    nesting levels
//!
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! # Example
//! ```no_run
//! use race_timer::config::TimerConfig;
//!
//! let config = TimerConfig::load()?;
//! config.validate()?;
//! println!("Polling every {} ms", config.polling.update_interval_ms);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! `RACE_TIMER_APPLICATION__LOG_LEVEL=debug` overrides
//! `application.log_level`.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use timer_core::calibration::CalibrationPolicy;
use timer_core::codec::ChecksumScope;
use timer_hardware::{CaptureConfig, DiscoveryConfig, PollConfig, RetryPolicy, TransportPolicy};

use crate::logging::{parse_log_level, OutputFormat};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/race-timer.toml";

/// Maximum number of bus addresses a scan may probe.
pub const MAX_BUS_ADDRESSES: usize = 8;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Link transport settings.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Poll loop settings.
    #[serde(default)]
    pub polling: PollConfig,
    /// Calibration and level capture settings.
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Node discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Links to open.
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Transport settings shared by every link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Minimum gap between exchanges on one link.
    #[serde(default = "default_chill_time_ms")]
    pub chill_time_ms: u64,
    /// Response timeout.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Retries for configuration reads and writes.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retries for sub-node selection.
    #[serde(default = "default_select_max_retries")]
    pub select_max_retries: u32,
    /// Delay between retries.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Bytes covered by outgoing checksums.
    #[serde(default)]
    pub checksum_scope: ChecksumScope,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chill_time_ms: default_chill_time_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_retries: default_max_retries(),
            select_max_retries: default_select_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            checksum_scope: ChecksumScope::default(),
        }
    }
}

impl TransportConfig {
    /// Per-node transport policy.
    pub fn policy(&self) -> TransportPolicy {
        TransportPolicy {
            retry: RetryPolicy {
                max_attempts: self.max_retries,
                backoff_delay: Duration::from_millis(self.retry_backoff_ms),
            },
            select_max_retries: self.select_max_retries,
            checksum_scope: self.checksum_scope,
        }
    }

    /// Chill time as a duration.
    pub fn chill_time(&self) -> Duration {
        Duration::from_millis(self.chill_time_ms)
    }

    /// Read timeout as a duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Calibration policy plus manual capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Enter level as a fraction from floor to peak.
    #[serde(default = "default_enter_fraction")]
    pub enter_fraction: f64,
    /// Exit level as a fraction from floor to peak.
    #[serde(default = "default_exit_fraction")]
    pub exit_fraction: f64,
    /// Blend factor toward the calibrated levels.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Smallest peak-to-floor span worth calibrating on.
    #[serde(default = "default_min_break_width")]
    pub min_break_width: i32,
    /// Capture averaging window.
    #[serde(default = "default_capture_duration_ms")]
    pub capture_duration_ms: i64,
    /// Minimum distance from a captured enter level to the node peak.
    #[serde(default = "default_enter_at_peak_margin")]
    pub enter_at_peak_margin: i32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        let policy = CalibrationPolicy::default();
        let capture = CaptureConfig::default();
        Self {
            enter_fraction: policy.enter_fraction,
            exit_fraction: policy.exit_fraction,
            learning_rate: policy.learning_rate,
            min_break_width: policy.min_break_width,
            capture_duration_ms: capture.capture_duration_ms,
            enter_at_peak_margin: capture.enter_at_peak_margin,
        }
    }
}

impl CalibrationConfig {
    /// Race-stop calibration policy.
    pub fn policy(&self) -> CalibrationPolicy {
        CalibrationPolicy {
            enter_fraction: self.enter_fraction,
            exit_fraction: self.exit_fraction,
            learning_rate: self.learning_rate,
            min_break_width: self.min_break_width,
        }
    }

    /// Manual capture settings.
    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            capture_duration_ms: self.capture_duration_ms,
            enter_at_peak_margin: self.enter_at_peak_margin,
        }
    }
}

/// Physical link kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Serial port (USB or UART).
    Serial,
    /// TCP connection to a node bridge.
    Socket,
}

/// One link to open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Unique link identifier, used in logs.
    pub id: String,
    /// Link kind.
    #[serde(rename = "type")]
    pub kind: LinkKind,
    /// Serial device path.
    #[serde(default)]
    pub path: Option<String>,
    /// Socket address (`host:port`).
    #[serde(default)]
    pub address: Option<String>,
    /// Serial baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Whether frames carry a device address byte (bus links).
    #[serde(default)]
    pub addressable: bool,
    /// Whether this link is opened.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_name() -> String {
    "race-timer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_chill_time_ms() -> u64 {
    10
}

fn default_read_timeout_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    4
}

fn default_select_max_retries() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_enter_fraction() -> f64 {
    0.5
}

fn default_exit_fraction() -> f64 {
    0.25
}

fn default_learning_rate() -> f64 {
    0.5
}

fn default_min_break_width() -> i32 {
    2
}

fn default_capture_duration_ms() -> i64 {
    3000
}

fn default_enter_at_peak_margin() -> i32 {
    5
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_enabled() -> bool {
    true
}

impl TimerConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file yields the
    /// defaults overlaid with the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RACE_TIMER_").split("__"))
            .extract()
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        parse_log_level(&self.application.log_level)
            .map_err(|e| format!("application.log_level: {}", e))?;

        if self.transport.read_timeout_ms == 0 {
            return Err("transport.read_timeout_ms must be greater than 0".to_string());
        }
        if self.polling.update_interval_ms == 0 {
            return Err("polling.update_interval_ms must be greater than 0".to_string());
        }
        if self.polling.realtime_window == 0 {
            return Err("polling.realtime_window must be greater than 0".to_string());
        }

        let cal = &self.calibration;
        for (name, value) in [("enter_fraction", cal.enter_fraction), ("exit_fraction", cal.exit_fraction)] {
            if !(value > 0.0 && value < 1.0) {
                return Err(format!("calibration.{} {} must be within (0, 1)", name, value));
            }
        }
        if cal.exit_fraction >= cal.enter_fraction {
            return Err(format!(
                "calibration.exit_fraction {} must be below enter_fraction {}",
                cal.exit_fraction, cal.enter_fraction
            ));
        }
        if !(cal.learning_rate > 0.0 && cal.learning_rate <= 1.0) {
            return Err(format!(
                "calibration.learning_rate {} must be within (0, 1]",
                cal.learning_rate
            ));
        }
        if cal.capture_duration_ms <= 0 {
            return Err("calibration.capture_duration_ms must be greater than 0".to_string());
        }

        if self.discovery.bus_addresses.len() > MAX_BUS_ADDRESSES {
            return Err(format!(
                "discovery.bus_addresses lists {} addresses; at most {} are supported",
                self.discovery.bus_addresses.len(),
                MAX_BUS_ADDRESSES
            ));
        }

        let mut ids = HashSet::new();
        for link in &self.links {
            if !ids.insert(link.id.as_str()) {
                return Err(format!("Duplicate link ID: {}", link.id));
            }
            match link.kind {
                LinkKind::Serial if link.path.is_none() => {
                    return Err(format!("Serial link '{}' has no path", link.id));
                }
                LinkKind::Socket if link.address.is_none() => {
                    return Err(format!("Socket link '{}' has no address", link.id));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Links with `enabled = true`.
    pub fn enabled_links(&self) -> Vec<&LinkConfig> {
        self.links.iter().filter(|link| link.enabled).collect()
    }

    /// The effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let file = write_config("");
        let config = TimerConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.transport.chill_time_ms, 10);
        assert_eq!(config.transport.max_retries, 4);
        assert_eq!(config.polling.update_interval_ms, 100);
        assert_eq!(config.discovery.bus_addresses, vec![8, 10, 12, 14, 16, 18, 20, 22]);
        assert!(config.links.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_full_file() {
        let file = write_config(
            r#"
            [application]
            name = "Track A"
            log_level = "debug"
            log_format = "json"

            [transport]
            chill_time_ms = 5
            checksum_scope = "payload"

            [polling]
            min_lap_time_ms = 4000

            [calibration]
            learning_rate = 1.0

            [discovery]
            bus_addresses = [8, 10]
            stop_after_first_miss = false

            [[links]]
            id = "usb0"
            type = "serial"
            path = "/dev/ttyUSB0"

            [[links]]
            id = "bridge"
            type = "socket"
            address = "192.168.4.1:5000"
            addressable = true
            enabled = false
            "#,
        );
        let config = TimerConfig::load_from(file.path()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.application.name, "Track A");
        assert_eq!(config.application.log_format, OutputFormat::Json);
        assert_eq!(config.transport.policy().checksum_scope, ChecksumScope::Payload);
        assert_eq!(config.transport.chill_time(), Duration::from_millis(5));
        assert_eq!(config.polling.min_lap_time_ms, 4000);
        assert_eq!(config.calibration.policy().learning_rate, 1.0);
        assert!(!config.discovery.stop_after_first_miss);

        assert_eq!(config.links.len(), 2);
        assert_eq!(config.links[0].kind, LinkKind::Serial);
        assert_eq!(config.links[0].baud_rate, 115_200);
        assert!(!config.links[0].addressable);

        let enabled = config.enabled_links();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "usb0");
    }

    #[test]
    fn test_transport_policy_conversion() {
        let transport = TransportConfig {
            max_retries: 2,
            retry_backoff_ms: 40,
            ..Default::default()
        };
        let policy = transport.policy();
        assert_eq!(policy.retry.max_attempts, 2);
        assert_eq!(policy.retry.backoff_delay, Duration::from_millis(40));
        assert_eq!(policy.select_max_retries, 10);
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = TimerConfig::load_from(path).unwrap();
        config.validate().unwrap();

        assert_eq!(config.links.len(), 3);
        assert_eq!(config.enabled_links().len(), 1);
        assert_eq!(config.links[1].kind, LinkKind::Serial);
        assert!(config.links[1].addressable);
        assert_eq!(config.links[2].address.as_deref(), Some("192.168.4.1:5005"));
    }

    #[test]
    fn test_effective_config_reloads() {
        let mut config = TimerConfig::default();
        config.polling.update_interval_ms = 50;
        config.transport.checksum_scope = ChecksumScope::Payload;
        config.links.push(LinkConfig {
            id: "usb0".to_string(),
            kind: LinkKind::Serial,
            path: Some("/dev/ttyUSB0".to_string()),
            address: None,
            baud_rate: 115_200,
            addressable: false,
            enabled: true,
        });

        let text = config.to_toml().unwrap();
        assert!(text.contains("[[links]]"));
        assert!(text.contains("type = \"serial\""));

        let file = write_config(&text);
        let reloaded = TimerConfig::load_from(file.path()).unwrap();
        assert_eq!(reloaded.polling, config.polling);
        assert_eq!(reloaded.transport.checksum_scope, ChecksumScope::Payload);
        assert_eq!(reloaded.links[0].path.as_deref(), Some("/dev/ttyUSB0"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = TimerConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = TimerConfig::default();
        config.transport.read_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = TimerConfig::default();
        config.polling.update_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fraction_bounds() {
        let mut config = TimerConfig::default();
        config.calibration.enter_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = TimerConfig::default();
        config.calibration.exit_fraction = 0.6;
        let err = config.validate().unwrap_err();
        assert!(err.contains("exit_fraction"), "{}", err);
    }

    #[test]
    fn test_too_many_bus_addresses() {
        let mut config = TimerConfig::default();
        config.discovery.bus_addresses = (8..=26).step_by(2).collect();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_link_ids() {
        let link = LinkConfig {
            id: "usb0".to_string(),
            kind: LinkKind::Serial,
            path: Some("/dev/ttyUSB0".to_string()),
            address: None,
            baud_rate: 115_200,
            addressable: false,
            enabled: true,
        };
        let config = TimerConfig {
            links: vec![link.clone(), link],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("Duplicate link ID"));
    }

    #[test]
    fn test_socket_link_needs_address() {
        let config = TimerConfig {
            links: vec![LinkConfig {
                id: "bridge".to_string(),
                kind: LinkKind::Socket,
                path: None,
                address: None,
                baud_rate: 115_200,
                addressable: true,
                enabled: true,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
