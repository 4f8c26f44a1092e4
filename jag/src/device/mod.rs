//! Transport-independent device handle.
//!
//! [`Device::open`] is the only place that looks at
//! [`DeviceIdentity::transport`]; everything above it calls the same
//! capability methods whatever the link is.

mod ble;
mod network;
mod uart;

use std::collections::BTreeMap;
use std::time::Duration;

use jag_proto::upload::{DEFINE_DISABLED, DEFINE_TIMEOUT};
use jag_proto::{CodeKind, DefineValue, Defines};
use tracing::debug;

use crate::identity::{DeviceIdentity, Transport};
use crate::session::Session;
use crate::{Error, Result};

pub use ble::BleDevice;
pub use network::NetworkDevice;
pub use uart::UartDevice;

/// Options that travel with a code push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// SDK version the image was compiled with.
    pub sdk_version: String,
    /// Container name; required for installs.
    pub name: Option<String>,
    /// Install the container disabled.
    pub disabled: bool,
    /// Kill the container after this long.
    pub timeout: Option<Duration>,
    /// Additional program defines.
    pub defines: Defines,
}

impl PushOptions {
    /// Merges the well-known options into the define map.
    pub fn to_defines(&self) -> Defines {
        let mut defines = self.defines.clone();
        if self.disabled {
            defines.insert(DEFINE_DISABLED.to_owned(), DefineValue::Bool(true));
        }
        if let Some(timeout) = self.timeout {
            let secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
            defines.insert(DEFINE_TIMEOUT.to_owned(), DefineValue::Int(secs));
        }
        defines
    }

    /// Reads options back from a define map (the inverse of [`to_defines`](Self::to_defines)).
    pub fn from_defines(sdk_version: &str, name: Option<&str>, mut defines: Defines) -> Self {
        let disabled = matches!(defines.remove(DEFINE_DISABLED), Some(DefineValue::Bool(true)));
        let timeout = match defines.remove(DEFINE_TIMEOUT) {
            Some(DefineValue::Int(secs)) => u64::try_from(secs).ok().map(Duration::from_secs),
            _ => None,
        };
        Self {
            sdk_version: sdk_version.to_owned(),
            name: name.map(str::to_owned),
            disabled,
            timeout,
            defines,
        }
    }

    /// Container name, required when installing.
    fn install_name(&self, kind: CodeKind) -> Result<Option<&str>> {
        match (kind, self.name.as_deref()) {
            (CodeKind::Install, None | Some("")) => {
                Err(Error::Device("installing a container requires a name".into()))
            }
            (CodeKind::Install, name) => Ok(name),
            (CodeKind::Run, _) => Ok(None),
        }
    }
}

/// A device reachable through one of the supported transports.
#[derive(Debug)]
#[non_exhaustive]
pub enum Device {
    /// HTTP over the local network, including UART proxies.
    Network(NetworkDevice),
    /// GATT over Bluetooth Low Energy.
    Ble(BleDevice),
    /// A serial cable driven by this process.
    UartProxy(UartDevice),
}

impl Device {
    /// Connects to `identity` over its transport.
    pub async fn open(identity: DeviceIdentity, session: &Session) -> Result<Self> {
        debug!(name = %identity.name, transport = %identity.transport, "opening device");
        let config = session.config();
        Ok(match identity.transport {
            Transport::Network => {
                Self::Network(NetworkDevice::new(identity, config.request_timeout()))
            }
            Transport::Ble => {
                let adapter = session.ble().await?;
                Self::Ble(BleDevice::connect(identity, adapter, config.identify_timeout()).await?)
            }
            Transport::UartProxy => {
                let timeout = config.request_timeout();
                Self::UartProxy(UartDevice::open(identity, config.baud_rate, timeout).await?)
            }
        })
    }

    /// Identity the device was opened with.
    pub const fn identity(&self) -> &DeviceIdentity {
        match self {
            Self::Network(d) => d.identity(),
            Self::Ble(d) => d.identity(),
            Self::UartProxy(d) => d.identity(),
        }
    }

    /// Returns `true` if the device answers. Never fails.
    pub async fn ping(&self) -> bool {
        let res = match self {
            Self::Network(d) => d.ping().await,
            Self::Ble(d) => d.ping().await,
            Self::UartProxy(d) => d.ping().await,
        };
        if let Err(e) = &res {
            debug!(name = %self.identity().name, error = %e, "ping failed");
        }
        res.is_ok()
    }

    /// Runs or installs a compiled image.
    pub async fn send_code(
        &self,
        kind: CodeKind,
        image: &[u8],
        options: &PushOptions,
    ) -> Result<()> {
        match self {
            Self::Network(d) => d.send_code(kind, image, options).await,
            Self::Ble(d) => d.send_code(kind, image, options).await,
            Self::UartProxy(d) => d.send_code(kind, image, options).await,
        }
    }

    /// Installed containers, id to name.
    pub async fn container_list(&self) -> Result<BTreeMap<String, String>> {
        match self {
            Self::Network(d) => d.container_list().await,
            Self::Ble(d) => d.container_list().await,
            Self::UartProxy(d) => d.container_list().await,
        }
    }

    /// Removes the container called `name`.
    pub async fn container_uninstall(&self, name: &str) -> Result<()> {
        match self {
            Self::Network(d) => d.container_uninstall(name).await,
            Self::Ble(d) => d.container_uninstall(name).await,
            Self::UartProxy(d) => d.container_uninstall(name).await,
        }
    }

    /// Replaces the device firmware.
    pub async fn update_firmware(&self, image: &[u8]) -> Result<()> {
        match self {
            Self::Network(d) => d.update_firmware(image).await,
            Self::Ble(d) => d.update_firmware(image),
            Self::UartProxy(d) => d.update_firmware(image).await,
        }
    }

    /// Releases the connection.
    pub async fn close(self) {
        match self {
            Self::Network(_) => {}
            Self::Ble(d) => d.close().await,
            Self::UartProxy(d) => d.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_roundtrip_through_defines() {
        let mut extra = Defines::new();
        extra.insert("led".into(), DefineValue::Text("on".into()));
        let opts = PushOptions {
            sdk_version: "v2.0.0".into(),
            name: Some("blink".into()),
            disabled: true,
            timeout: Some(Duration::from_secs(30)),
            defines: extra,
        };
        let defines = opts.to_defines();
        assert_eq!(defines.get(DEFINE_DISABLED), Some(&DefineValue::Bool(true)));
        assert_eq!(defines.get(DEFINE_TIMEOUT), Some(&DefineValue::Int(30)));

        let back = PushOptions::from_defines("v2.0.0", Some("blink"), defines);
        assert_eq!(back, opts);
    }

    #[test]
    fn install_requires_name() {
        let opts = PushOptions::default();
        assert!(opts.install_name(CodeKind::Install).is_err());
        assert_eq!(opts.install_name(CodeKind::Run).unwrap(), None);
    }
}
