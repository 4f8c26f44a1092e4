//! Process-wide context handed to discovery and device constructors.

use btleplug::platform::Adapter;

use crate::Result;
use crate::ble::BleAdapter;
use crate::config::Config;

/// Configuration plus the lazily enabled BLE adapter.
#[derive(Debug, Default)]
pub struct Session {
    config: Config,
    ble: BleAdapter,
}

impl Session {
    /// Creates a session; BLE is not touched until first needed.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ble: BleAdapter::new(),
        }
    }

    /// Active configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the BLE adapter, enabling it on first use.
    pub async fn ble(&self) -> Result<&Adapter> {
        self.ble.ensure_enabled().await
    }
}
