use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jag_proto::ack::Progress;
use jag_proto::{ChanReader, CodeKind};
use tracing::info;

use super::PushOptions;
use crate::identity::{DeviceIdentity, Transport};
use crate::uart::{self, Uart};
use crate::{Error, Result};

/// A device on a serial cable attached to this machine.
#[derive(Debug, Clone)]
pub struct UartDevice {
    identity: DeviceIdentity,
    uart: Arc<Uart>,
}

impl UartDevice {
    /// Wraps an engine that is already synced.
    pub const fn new(identity: DeviceIdentity, uart: Arc<Uart>) -> Self {
        Self { identity, uart }
    }

    /// Opens the serial port at `identity.address`. Device logs are discarded.
    pub async fn open(identity: DeviceIdentity, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let session = uart::open_serial(&identity.address, baud_rate, timeout).await?;
        drop(session.logs);
        Ok(Self::new(identity, session.uart))
    }

    /// Opens `path`, asks the device who it is and keeps the log stream.
    pub async fn attach(
        path: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<(Self, ChanReader)> {
        let session = uart::open_serial(path, baud_rate, timeout).await?;
        let payload = session.uart.identify().await?;
        let mut identity = DeviceIdentity::from_payload(payload, Transport::UartProxy, path)?;
        identity.address = path.to_owned();
        info!(name = %identity.name, path, "serial device identified");
        Ok((Self::new(identity, session.uart), session.logs))
    }

    pub(super) const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub(super) async fn ping(&self) -> Result<()> {
        self.uart.ping().await
    }

    pub(super) async fn send_code(
        &self,
        kind: CodeKind,
        image: &[u8],
        options: &PushOptions,
    ) -> Result<()> {
        let name = options.install_name(kind)?;
        if !options.sdk_version.is_empty() && options.sdk_version != self.identity.sdk_version {
            return Err(Error::SdkVersionMismatch {
                device: self.identity.sdk_version.clone(),
                image: options.sdk_version.clone(),
            });
        }
        let defines = options.to_defines();
        let progress = match name {
            Some(name) => self.uart.install(name, &defines, image).await?,
            None => self.uart.run(&defines, image).await?,
        };
        finished(&progress)
    }

    pub(super) async fn container_list(&self) -> Result<BTreeMap<String, String>> {
        let entries = self.uart.list_containers().await?;
        Ok(entries.into_iter().map(|e| (e.id, e.name)).collect())
    }

    pub(super) async fn container_uninstall(&self, name: &str) -> Result<()> {
        self.uart.uninstall(name).await
    }

    pub(super) async fn update_firmware(&self, image: &[u8]) -> Result<()> {
        finished(&self.uart.update_firmware(image).await?)
    }

    pub(super) fn close(&self) {
        self.uart.close();
    }
}

fn finished(progress: &Progress) -> Result<()> {
    if progress.is_complete() {
        Ok(())
    } else {
        Err(Error::Device(format!(
            "transfer stopped at {} of {} bytes",
            progress.acked, progress.total
        )))
    }
}
