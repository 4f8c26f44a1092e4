//! Device identities produced by discovery and handshakes.

use jag_proto::IdentifyPayload;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Chip id reported by old firmware regardless of the actual variant.
const LEGACY_CHIP: &str = "esp32";

/// How a device is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// HTTP over the local network.
    Network,
    /// GATT over Bluetooth Low Energy.
    Ble,
    /// A serial cable driven by this process.
    UartProxy,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Ble => "ble",
            Self::UartProxy => "uart",
        })
    }
}

/// Identity of a discovered device. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device UUID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Chip family.
    pub chip: String,
    /// SDK version of the running firmware.
    pub sdk_version: String,
    /// Machine word size in bytes (4 or 8).
    pub word_size: u8,
    /// HTTP base URL, BLE peripheral id, or serial port path.
    pub address: String,
    /// Transport used to reach the device.
    pub transport: Transport,
    /// Set when the device sits behind a UART proxy.
    pub proxied: bool,
}

impl DeviceIdentity {
    /// Builds an identity from a wire payload.
    ///
    /// An empty `address` in the payload is replaced by `fallback_address`.
    pub fn from_payload(
        payload: IdentifyPayload,
        transport: Transport,
        fallback_address: &str,
    ) -> Result<Self> {
        if payload.word_size != 4 && payload.word_size != 8 {
            return Err(Error::Device(format!(
                "device reported word size {}",
                payload.word_size
            )));
        }
        let address = if payload.address.is_empty() {
            fallback_address.to_owned()
        } else {
            payload.address
        };
        Ok(Self {
            id: payload.id,
            name: payload.name,
            chip: payload.chip,
            sdk_version: payload.sdk_version,
            word_size: payload.word_size,
            address,
            transport,
            proxied: payload.proxied,
        })
    }

    /// Converts back into the wire payload.
    pub fn to_payload(&self) -> IdentifyPayload {
        IdentifyPayload {
            id: self.id.clone(),
            name: self.name.clone(),
            chip: self.chip.clone(),
            sdk_version: self.sdk_version.clone(),
            word_size: self.word_size,
            address: self.address.clone(),
            proxied: self.proxied,
        }
    }

    /// Checks that firmware built for `firmware_chip` can run on this device.
    ///
    /// Old firmware reports the generic `esp32` chip for every variant; those
    /// devices accept any `esp32*` firmware with a warning.
    pub fn check_chip(&self, firmware_chip: &str) -> Result<()> {
        if self.chip == firmware_chip {
            return Ok(());
        }
        if self.chip == LEGACY_CHIP && firmware_chip.starts_with(LEGACY_CHIP) {
            warn!(
                device = %self.name,
                firmware_chip,
                "device reports the generic esp32 chip; assuming it matches"
            );
            return Ok(());
        }
        Err(Error::ChipMismatch {
            device: self.chip.clone(),
            firmware: firmware_chip.to_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) fn sample(id: &str, name: &str, address: &str) -> DeviceIdentity {
    DeviceIdentity {
        id: id.into(),
        name: name.into(),
        chip: "esp32s3".into(),
        sdk_version: "v2.0.0".into(),
        word_size: 4,
        address: address.into(),
        transport: Transport::Network,
        proxied: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip_and_fallback_address() {
        let mut payload = sample("a", "n", "").to_payload();
        let id = DeviceIdentity::from_payload(payload.clone(), Transport::UartProxy, "/dev/ttyUSB0")
            .unwrap();
        assert_eq!(id.address, "/dev/ttyUSB0");
        assert_eq!(id.transport, Transport::UartProxy);

        payload.word_size = 2;
        assert!(DeviceIdentity::from_payload(payload, Transport::Network, "").is_err());
    }

    #[test]
    fn chip_checks() {
        let mut dev = sample("a", "n", "x");
        assert!(dev.check_chip("esp32s3").is_ok());
        assert!(matches!(
            dev.check_chip("esp32c3"),
            Err(Error::ChipMismatch { .. })
        ));

        dev.chip = LEGACY_CHIP.into();
        assert!(dev.check_chip("esp32c3").is_ok());
        assert!(dev.check_chip("rp2040").is_err());
    }
}
