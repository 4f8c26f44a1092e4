//! Periodic identify broadcasts for the UART proxy.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use jag_proto::Announcement;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Result;
use crate::cancel::{self, Cancel, CancelHandle};
use crate::identity::DeviceIdentity;

/// Interval between broadcasts.
const INTERVAL: Duration = Duration::from_millis(200);

/// Pause before rebuilding the socket after a send failure.
const BACKOFF: Duration = Duration::from_secs(5);

/// Background broadcaster. Stops when dropped.
#[derive(Debug)]
pub struct Announcer {
    stop: CancelHandle,
    task: JoinHandle<()>,
}

impl Announcer {
    /// Broadcasts `identity` on `port` of the limited broadcast address.
    pub fn spawn(identity: &DeviceIdentity, port: u16) -> Result<Self> {
        Self::spawn_to(identity, SocketAddr::from((Ipv4Addr::BROADCAST, port)))
    }

    /// Sends `identity` to `target` every [`INTERVAL`].
    pub fn spawn_to(identity: &DeviceIdentity, target: SocketAddr) -> Result<Self> {
        let datagram = Announcement::identify(identity.to_payload()).to_compact()?;
        let (stop, signal) = cancel::pair();
        let task = tokio::spawn(run(datagram, target, signal));
        debug!(%target, name = %identity.name, "announcer started");
        Ok(Self { stop, task })
    }

    /// Stops broadcasting and waits for the task to end.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

async fn open_socket(target: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    if target.ip().is_ipv4() && !target.ip().is_loopback() {
        socket.set_broadcast(true)?;
    }
    Ok(socket)
}

async fn run(datagram: Vec<u8>, target: SocketAddr, mut stop: Cancel) {
    loop {
        match open_socket(target).await {
            Ok(socket) => {
                let mut tick = tokio::time::interval(INTERVAL);
                loop {
                    tokio::select! {
                        () = stop.cancelled() => return,
                        _ = tick.tick() => {
                            if let Err(e) = socket.send_to(&datagram, target).await {
                                warn!(error = %e, "announce failed; backing off");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "cannot open announce socket; backing off"),
        }
        tokio::select! {
            () = stop.cancelled() => return,
            () = tokio::time::sleep(BACKOFF) => {}
        }
    }
}
