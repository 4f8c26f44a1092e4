use std::collections::BTreeMap;
use std::time::Duration;

use btleplug::platform::Adapter;
use jag_proto::{CodeKind, UploadHeader, UploadStatus};
use tracing::warn;

use super::PushOptions;
use crate::ble::BleConnection;
use crate::identity::DeviceIdentity;
use crate::{Error, Result};

/// A device driven over BLE.
#[derive(Debug)]
pub struct BleDevice {
    identity: DeviceIdentity,
    conn: BleConnection,
}

impl BleDevice {
    /// Connects to the peripheral at `identity.address`.
    pub async fn connect(
        identity: DeviceIdentity,
        adapter: &Adapter,
        timeout: Duration,
    ) -> Result<Self> {
        let conn = BleConnection::connect(adapter, &identity.address, timeout).await?;
        Ok(Self { identity, conn })
    }

    pub(super) const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub(super) async fn ping(&self) -> Result<()> {
        self.conn.ping().await
    }

    pub(super) async fn send_code(
        &self,
        kind: CodeKind,
        image: &[u8],
        options: &PushOptions,
    ) -> Result<()> {
        let name = options.install_name(kind)?;
        let defines = options.to_defines();
        let header = UploadHeader::new(kind, &options.sdk_version, name, defines, image)?;
        match self.conn.upload(&header, image).await? {
            UploadStatus::Ok => Ok(()),
            UploadStatus::SdkMismatch => Err(Error::SdkVersionMismatch {
                device: self.identity.sdk_version.clone(),
                image: options.sdk_version.clone(),
            }),
            UploadStatus::Rejected(code) => Err(Error::UploadRejected(code)),
        }
    }

    pub(super) async fn container_list(&self) -> Result<BTreeMap<String, String>> {
        let entries = self.conn.list_containers().await?;
        Ok(entries.into_iter().map(|e| (e.id, e.name)).collect())
    }

    pub(super) async fn container_uninstall(&self, name: &str) -> Result<()> {
        self.conn.uninstall(name).await
    }

    pub(super) fn update_firmware(&self, image: &[u8]) -> Result<()> {
        self.conn.update_firmware(image)
    }

    pub(super) async fn close(self) {
        if let Err(e) = self.conn.disconnect().await {
            warn!(error = %e, "BLE disconnect failed");
        }
    }
}
