//! Network discovery: UDP identify listener and direct HTTP identify.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use jag_proto::Announcement;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::cancel::Cancel;
use crate::http;
use crate::identity::{DeviceIdentity, Transport};
use crate::{Error, Result};

/// Largest identify datagram accepted.
const MAX_DATAGRAM: usize = 2048;

/// Binds the discovery port on all interfaces.
pub async fn bind(port: u16) -> Result<UdpSocket> {
    Ok(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?)
}

/// Collects identify announcements on `port` until `window` elapses.
pub async fn listen(port: u16, window: Duration, cancel: Cancel) -> Result<Vec<DeviceIdentity>> {
    listen_on(bind(port).await?, window, cancel).await
}

/// Like [`listen`] on an already bound socket.
///
/// Devices are unique by address; the first announcement from each wins.
pub async fn listen_on(
    socket: UdpSocket,
    window: Duration,
    mut cancel: Cancel,
) -> Result<Vec<DeviceIdentity>> {
    let mut found: Vec<DeviceIdentity> = Vec::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = &mut deadline => break,
            received = socket.recv_from(&mut buf) => {
                let (n, from) = received?;
                match parse_datagram(&buf[..n], from) {
                    Ok(device) if !found.iter().any(|d| d.address == device.address) => {
                        debug!(name = %device.name, address = %device.address, "device announced");
                        found.push(device);
                    }
                    Ok(_) => {}
                    Err(e) => trace!(%from, error = %e, "ignored datagram"),
                }
            }
        }
    }
    Ok(found)
}

/// Parses one identify datagram received from `from`.
pub(crate) fn parse_datagram(bytes: &[u8], from: SocketAddr) -> Result<DeviceIdentity> {
    let announcement = Announcement::decode(bytes)?;
    DeviceIdentity::from_payload(
        announcement.payload,
        Transport::Network,
        &format!("http://{}", from.ip()),
    )
}

/// Asks the device at `address` for its identity over HTTP.
///
/// Cancelling returns [`Error::Cancelled`] at once. The request itself runs
/// on a blocking thread and is not interrupted; it ends on its own within
/// `timeout`.
pub async fn identify(
    address: &str,
    timeout: Duration,
    mut cancel: Cancel,
) -> Result<DeviceIdentity> {
    let base = http::base_url(address);
    let url = format!("{base}/identify");
    let request = http::blocking(move || {
        let reply = http::get(&http::agent(timeout), &url, &[])?;
        if !reply.is_success() {
            return Err(Error::Http(format!("{url}: HTTP {}", reply.status)));
        }
        Ok(reply.body)
    });

    let body = tokio::select! {
        () = cancel.cancelled() => return Err(Error::Cancelled),
        body = request => body?,
    };
    let announcement = Announcement::decode(&body)?;
    DeviceIdentity::from_payload(announcement.payload, Transport::Network, &base)
}
