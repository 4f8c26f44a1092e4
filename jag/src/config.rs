//! Tool configuration: defaults, JSON file and `JAG_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// UDP port devices and proxies announce themselves on.
pub const DISCOVERY_PORT: u16 = 1990;

/// Settings consumed by discovery, the transports and the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Also scan for BLE devices.
    pub use_ble: bool,
    /// UDP discovery port.
    pub discovery_port: u16,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Network/BLE scan window in milliseconds.
    pub scan_timeout_ms: u64,
    /// Direct identify timeout in milliseconds.
    pub identify_timeout_ms: u64,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// HTTP port for the UART proxy (0 picks a free port).
    pub proxy_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_ble: false,
            discovery_port: DISCOVERY_PORT,
            baud_rate: 115_200,
            scan_timeout_ms: 600,
            identify_timeout_ms: 2_000,
            request_timeout_ms: 10_000,
            proxy_port: 0,
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg
    }

    /// Reads a JSON config file, then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut cfg: Self = serde_json::from_str(&data)?;
        cfg.apply_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// Applies `JAG_*` overrides looked up through `var`.
    ///
    /// Unparsable values are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.trim().parse().ok())
        }

        if let Some(v) = var("JAG_USE_BLE") {
            self.use_ble = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = parse(var("JAG_DISCOVERY_PORT")) {
            self.discovery_port = v;
        }
        if let Some(v) = parse(var("JAG_BAUD_RATE")) {
            self.baud_rate = v;
        }
        if let Some(v) = parse(var("JAG_SCAN_TIMEOUT_MS")) {
            self.scan_timeout_ms = v;
        }
        if let Some(v) = parse(var("JAG_IDENTIFY_TIMEOUT_MS")) {
            self.identify_timeout_ms = v;
        }
        if let Some(v) = parse(var("JAG_REQUEST_TIMEOUT_MS")) {
            self.request_timeout_ms = v;
        }
        if let Some(v) = parse(var("JAG_PROXY_PORT")) {
            self.proxy_port = v;
        }
    }

    /// Scan window.
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Direct identify timeout.
    pub const fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    /// Per-request timeout.
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let mut cfg = Config::default();
        cfg.apply_overrides(|key| match key {
            "JAG_USE_BLE" => Some("true".into()),
            "JAG_BAUD_RATE" => Some("921600".into()),
            "JAG_DISCOVERY_PORT" => Some("not-a-port".into()),
            _ => None,
        });
        assert!(cfg.use_ble);
        assert_eq!(cfg.baud_rate, 921_600);
        assert_eq!(cfg.discovery_port, DISCOVERY_PORT);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jag.json");
        std::fs::write(&path, r#"{"scan_timeout_ms": 1500, "use_ble": true}"#).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.scan_timeout(), Duration::from_millis(1500));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
    }
}
