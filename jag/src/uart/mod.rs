//! Protocol engine for a device on a serial line.
//!
//! Requests are written raw to the line. Responses and chunk acks come back
//! on the out-of-band stream produced by [`jag_proto::mux`]. One mutex
//! guards the link, so exactly one exchange (or sync) is in flight at a
//! time, including the periodic background re-sync.

mod sync;
mod transfer;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::{Arc, Weak};
use std::time::Duration;

use jag_proto::ack::Progress;
use jag_proto::chan::ChanReader;
use jag_proto::packet::{self, Command};
use jag_proto::sync::SyncState;
use jag_proto::{ContainerEntry, Defines, IdentifyPayload, identity, mux, upload};
use tokio::io::{AsyncWrite, BufReader};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cancel::{self, Cancel, CancelHandle};
use crate::{Error, Result, serial};

/// Interval of the background re-sync.
const RESYNC_INTERVAL: Duration = Duration::from_secs(5);

/// One serial connection to a device.
#[derive(Debug)]
pub struct Uart {
    link: Mutex<Link>,
    request_timeout: Duration,
    /// Stops the background re-sync when the engine is dropped or closed.
    resync: CancelHandle,
}

/// Connection state guarded by [`Uart::link`].
struct Link {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    reader: BufReader<ChanReader>,
    sync: SyncState,
    /// Set after a failed exchange; the next request re-syncs first.
    dirty: bool,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("sync", &self.sync)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

/// A serial port opened and synced, plus its plain log stream.
#[derive(Debug)]
pub struct SerialSession {
    /// Protocol engine.
    pub uart: Arc<Uart>,
    /// Device log output with protocol traffic removed.
    pub logs: ChanReader,
}

/// Opens `path`, splits its stream and syncs with the device.
pub async fn open_serial(
    path: &str,
    baud_rate: u32,
    request_timeout: Duration,
) -> Result<SerialSession> {
    let (source, sink) = serial::open(path, baud_rate)?;
    let (logs, oob) = mux::multiplex(source);
    let uart = Uart::connect(oob, sink, request_timeout).await?;
    Ok(SerialSession { uart, logs })
}

impl Uart {
    /// Creates an engine over an out-of-band response stream and a raw sink.
    ///
    /// Starts the periodic re-sync; it stops when the engine is dropped or
    /// [`close`](Self::close)d.
    pub fn new(
        responses: ChanReader,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let (resync, signal) = cancel::pair();
        let uart = Arc::new(Self {
            link: Mutex::new(Link {
                writer: Box::new(writer),
                reader: BufReader::new(responses),
                sync: SyncState::default(),
                dirty: false,
            }),
            request_timeout,
            resync,
        });
        tokio::spawn(resync_loop(Arc::downgrade(&uart), signal));
        uart
    }

    /// Like [`new`](Self::new), then runs the initial sync.
    pub async fn connect(
        responses: ChanReader,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let uart = Self::new(responses, writer, request_timeout);
        uart.sync().await?;
        info!("serial link synced");
        Ok(uart)
    }

    /// Stops the background re-sync.
    pub fn close(&self) {
        self.resync.cancel();
    }

    /// Runs the sync handshake now.
    pub async fn sync(&self) -> Result<()> {
        self.link.lock().await.sync().await
    }

    /// Checks that the device answers.
    pub async fn ping(&self) -> Result<()> {
        let body = self.exchange(Command::Ping, &[]).await?;
        if !body.is_empty() {
            return Err(Error::Device(format!(
                "ping answered with {} unexpected bytes",
                body.len()
            )));
        }
        Ok(())
    }

    /// Queries the device identity.
    pub async fn identify(&self) -> Result<IdentifyPayload> {
        let body = self.exchange(Command::Identify, &[]).await?;
        Ok(identity::decode_identify(&body)?)
    }

    /// Lists installed containers.
    pub async fn list_containers(&self) -> Result<Vec<ContainerEntry>> {
        let body = self.exchange(Command::ListContainers, &[]).await?;
        Ok(upload::decode_containers(&body)?)
    }

    /// Removes the container called `name`.
    pub async fn uninstall(&self, name: &str) -> Result<()> {
        self.exchange(Command::Uninstall, name.as_bytes()).await?;
        Ok(())
    }

    /// Streams a firmware image to the device.
    pub async fn update_firmware(&self, image: &[u8]) -> Result<Progress> {
        let request = upload::firmware_request(image.len())?;
        self.exchange_then_stream(Command::Firmware, &request, image)
            .await
    }

    /// Installs `image` as the container `name`.
    pub async fn install(&self, name: &str, defines: &Defines, image: &[u8]) -> Result<Progress> {
        let request = upload::install_request(name, defines, image)?;
        self.exchange_then_stream(Command::Install, &request, image)
            .await
    }

    /// Runs `image` once.
    pub async fn run(&self, defines: &Defines, image: &[u8]) -> Result<Progress> {
        let request = upload::run_request(defines, image)?;
        self.exchange_then_stream(Command::Run, &request, image)
            .await
    }

    async fn exchange(&self, command: Command, payload: &[u8]) -> Result<Vec<u8>> {
        let mut link = self.link.lock().await;
        link.request(command, payload, self.request_timeout).await
    }

    async fn exchange_then_stream(
        &self,
        command: Command,
        payload: &[u8],
        data: &[u8],
    ) -> Result<Progress> {
        let mut link = self.link.lock().await;
        link.request(command, payload, self.request_timeout).await?;
        let progress = link.stream_chunked(data, self.request_timeout).await;
        if progress.is_err() {
            link.dirty = true;
        }
        progress
    }
}

impl Link {
    /// Returns `true` if bytes from an earlier exchange are still pending.
    fn is_stale(&self) -> bool {
        self.dirty || !self.reader.buffer().is_empty() || self.reader.get_ref().has_data()
    }

    /// Writes one request and reads its response.
    async fn request(
        &mut self,
        command: Command,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if self.is_stale() {
            debug!(?command, "stale link; re-syncing before request");
            self.sync().await?;
        }
        let result = self.request_once(command, payload, timeout).await;
        if result.is_err() {
            self.dirty = true;
        }
        result
    }

    async fn request_once(
        &mut self,
        command: Command,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        packet::send(&mut self.writer, command.code(), payload).await?;
        let (echo, body) = tokio::time::timeout(timeout, packet::recv(&mut self.reader))
            .await
            .map_err(|_| Error::Timeout("device response"))??;
        if echo != command.code() {
            return Err(jag_proto::Error::UnmatchedResponse {
                expected: command.code(),
                actual: echo,
            }
            .into());
        }
        debug!(?command, len = body.len(), "response");
        Ok(body)
    }
}

async fn resync_loop(uart: Weak<Uart>, mut stop: Cancel) {
    let mut tick = tokio::time::interval_at(Instant::now() + RESYNC_INTERVAL, RESYNC_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = tick.tick() => {
                let Some(uart) = uart.upgrade() else { break };
                let mut link = uart.link.lock().await;
                if let Err(e) = link.sync().await {
                    warn!(error = %e, "periodic re-sync failed");
                }
            }
        }
    }
    debug!("re-sync task stopped");
}
