//! Length-prefixed packet codec for the serial link.
//!
//! Each frame is: `[u16 little-endian length][command byte][payload][\n]`,
//! where the length counts the command byte plus the payload.

use std::io::{self, Read};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Maximum frame content (command byte included).
pub const MAX_FRAME: usize = u16::MAX as usize;

/// Frame terminator.
pub const TERMINATOR: u8 = b'\n';

/// Command codes understood by the device firmware.
///
/// Fixed by the firmware and not versioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Sync handshake.
    Sync = 0,
    /// Liveness check.
    Ping = 1,
    /// Identity query.
    Identify = 2,
    /// Installed container listing.
    ListContainers = 3,
    /// Container removal.
    Uninstall = 4,
    /// Firmware update, followed by a chunked transfer.
    Firmware = 5,
    /// Container install, followed by a chunked transfer.
    Install = 6,
    /// One-shot program run, followed by a chunked transfer.
    Run = 7,
    /// Chunk acknowledgment.
    Ack = 255,
}

impl Command {
    /// Wire code of this command.
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::Sync,
            1 => Self::Ping,
            2 => Self::Identify,
            3 => Self::ListContainers,
            4 => Self::Uninstall,
            5 => Self::Firmware,
            6 => Self::Install,
            7 => Self::Run,
            255 => Self::Ack,
            other => return Err(Error::Decode(format!("unknown command code {other}"))),
        })
    }
}

/// Encodes `command` and `payload` into a complete frame.
pub fn encode(command: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let len = payload.len() + 1;
    let len16 = u16::try_from(len).map_err(|_| Error::PayloadTooLarge(len))?;
    let mut frame = Vec::with_capacity(len + 3);
    frame.extend_from_slice(&len16.to_le_bytes());
    frame.push(command);
    frame.extend_from_slice(payload);
    frame.push(TERMINATOR);
    Ok(frame)
}

/// Reads one frame from `r`, returning the command byte and payload.
pub fn decode(r: &mut impl Read) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    r.read_exact(&mut header)?;
    let len = usize::from(u16::from_le_bytes(header));
    if len == 0 {
        return Err(Error::EmptyPayload);
    }
    let mut body = vec![0u8; len + 1];
    r.read_exact(&mut body).map_err(truncated)?;
    split_body(body)
}

/// Async counterpart of [`decode`].
pub async fn recv(r: &mut (impl AsyncRead + Unpin)) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    r.read_exact(&mut header).await?;
    let len = usize::from(u16::from_le_bytes(header));
    if len == 0 {
        return Err(Error::EmptyPayload);
    }
    let mut body = vec![0u8; len + 1];
    r.read_exact(&mut body).await.map_err(truncated)?;
    split_body(body)
}

/// Encodes a frame and writes it to `w`, flushing afterwards.
pub async fn send(w: &mut (impl AsyncWrite + Unpin), command: u8, payload: &[u8]) -> Result<()> {
    let frame = encode(command, payload)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Splits `[command][payload][terminator]` into its parts.
fn split_body(mut body: Vec<u8>) -> Result<(u8, Vec<u8>)> {
    match body.pop() {
        Some(TERMINATOR) => {}
        Some(other) => return Err(Error::InvalidTerminator(other)),
        None => return Err(Error::Truncated),
    }
    let command = body.remove(0);
    Ok((command, body))
}

fn truncated(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::Truncated
    } else {
        Error::Io(e)
    }
}
