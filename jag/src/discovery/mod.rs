//! Finding devices: network and BLE scans, direct identify and selection.

pub mod announce;
pub mod network;
pub mod select;

use std::time::Duration;

use btleplug::api::{Central, ScanFilter};
use tracing::{debug, info, warn};

use crate::ble::{self, BleConnection};
use crate::cancel::Cancel;
use crate::identity::{DeviceIdentity, Transport};
use crate::session::Session;
use crate::{Error, Result};

pub use announce::Announcer;
pub use select::{Criterion, Picker, select};

/// Scans the network (and BLE when enabled) for one scan window.
///
/// Both scans run concurrently. A failing BLE scan is logged and leaves
/// the network results intact.
pub async fn scan(session: &Session, cancel: &Cancel) -> Result<Vec<DeviceIdentity>> {
    let config = session.config();
    let window = config.scan_timeout();
    let net = network::listen(config.discovery_port, window, cancel.clone());
    let air = async {
        if config.use_ble {
            Some(scan_ble(session, window, cancel.clone()).await)
        } else {
            None
        }
    };
    let (net, air) = tokio::join!(net, air);

    let mut devices = net?;
    match air {
        Some(Ok(found)) => devices.extend(found),
        Some(Err(Error::Cancelled)) => return Err(Error::Cancelled),
        Some(Err(e)) => warn!(error = %e, "BLE scan failed"),
        None => {}
    }
    dedupe(&mut devices);
    info!(count = devices.len(), "scan finished");
    Ok(devices)
}

/// Drops later entries that repeat an earlier `(transport, address)`.
fn dedupe(devices: &mut Vec<DeviceIdentity>) {
    let mut seen = Vec::new();
    devices.retain(|d| {
        let key = (d.transport, d.address.clone());
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
}

/// Scans BLE for advertising devices and reads each one's identity.
pub async fn scan_ble(
    session: &Session,
    window: Duration,
    mut cancel: Cancel,
) -> Result<Vec<DeviceIdentity>> {
    let adapter = session.ble().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::select! {
        () = cancel.cancelled() => {
            adapter.stop_scan().await?;
            return Err(Error::Cancelled);
        }
        () = tokio::time::sleep(window) => {}
    }
    let candidates = ble::advertising_peripherals(adapter).await;
    adapter.stop_scan().await?;

    let mut found = Vec::new();
    for peripheral in candidates? {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let address = ble::peripheral_address(&peripheral);
        let read = async {
            let conn = BleConnection::attach(peripheral).await?;
            let payload = conn.identify().await;
            conn.disconnect().await?;
            payload
        };
        match tokio::time::timeout(session.config().identify_timeout(), read).await {
            Ok(Ok(payload)) => {
                let mut device = DeviceIdentity::from_payload(payload, Transport::Ble, &address)?;
                device.address = address;
                debug!(name = %device.name, address = %device.address, "BLE device identified");
                found.push(device);
            }
            Ok(Err(e)) => warn!(%address, error = %e, "cannot identify BLE device"),
            Err(_) => warn!(%address, "BLE identify timed out"),
        }
    }
    Ok(found)
}

/// Finds one device for `selector`.
///
/// An address selector is identified directly over HTTP; if that fails the
/// regular scan runs. Otherwise the scan results go through [`select`].
pub async fn discover(
    session: &Session,
    selector: Option<&str>,
    required: bool,
    picker: &mut dyn Picker,
    cancel: &Cancel,
) -> Result<DeviceIdentity> {
    let criterion = selector.map(Criterion::parse);
    if let Some(Criterion::Address(address)) = &criterion {
        let timeout = session.config().identify_timeout();
        match network::identify(address, timeout, cancel.clone()).await {
            Ok(device) => return Ok(device),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => debug!(%address, error = %e, "direct identify failed; scanning"),
        }
    }
    let devices = scan(session, cancel).await?;
    select(&devices, criterion.as_ref(), required, picker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::sample;

    #[test]
    fn dedupe_keeps_first_per_transport_and_address() {
        let mut ble = sample("2", "b", "AA:BB");
        ble.transport = Transport::Ble;
        let mut devices = vec![
            sample("1", "a", "http://10.0.0.1"),
            sample("1", "a-again", "http://10.0.0.1"),
            ble.clone(),
            ble,
            sample("3", "c", "http://10.0.0.2"),
        ];
        dedupe(&mut devices);
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
