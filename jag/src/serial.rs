//! Serial port bridge.
//!
//! `serialport` is blocking, so each open port gets a reader thread that
//! feeds a [`ChanReader`] and a writer thread draining a queue behind
//! [`SerialWriter`]. Both threads exit once their async side is dropped.

use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use jag_proto::chan::{self, ChanReader, ChanWriter};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::Result;

/// Read timeout; bounds how long the reader thread takes to notice a close.
const READ_POLL: Duration = Duration::from_millis(50);

/// Chunks buffered between the reader thread and the async side.
const READ_DEPTH: usize = 64;

/// Opens `path` at `baud_rate` (8N1, no flow control).
///
/// Returns the raw byte source and the sink for the port.
pub fn open(path: &str, baud_rate: u32) -> Result<(ChanReader, SerialWriter)> {
    let port = serialport::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_POLL)
        .open()?;
    info!(path, baud_rate, "opened serial port");

    let rx_port = port.try_clone()?;
    let (chan_tx, chan_rx) = chan::channel(READ_DEPTH);
    std::thread::Builder::new()
        .name("jag-serial-rx".into())
        .spawn(move || read_loop(rx_port, &chan_tx))?;

    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("jag-serial-tx".into())
        .spawn(move || write_loop(port, rx))?;

    Ok((chan_rx, SerialWriter { tx }))
}

/// Lists serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

/// Async sink for an open serial port.
///
/// Writes are queued to the writer thread; delivery is confirmed by the
/// protocol layer, not by `flush`.
#[derive(Debug)]
pub struct SerialWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl AsyncWrite for SerialWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(
            self.tx
                .send(buf.to_vec())
                .map(|()| buf.len())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "serial port closed")),
        )
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn read_loop(mut port: Box<dyn SerialPort>, tx: &ChanWriter) {
    let mut buf = [0u8; 1024];
    loop {
        match port.read(&mut buf) {
            Ok(0) => {
                if tx.is_closed() {
                    break;
                }
            }
            Ok(n) => {
                if !tx.blocking_send(buf[..n].to_vec()) {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "serial read failed");
                tx.blocking_fail(e);
                break;
            }
        }
    }
    debug!("serial reader stopped");
}

fn write_loop(mut port: Box<dyn SerialPort>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(chunk) = rx.blocking_recv() {
        if let Err(e) = port.write_all(&chunk).and_then(|()| port.flush()) {
            warn!(error = %e, "serial write failed");
            break;
        }
    }
    debug!("serial writer stopped");
}
