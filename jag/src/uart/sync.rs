//! Sync handshake.
//!
//! A sender repeats sync requests with a fresh id every [`RESEND`]; a
//! receiver reads response lines and accepts only the exact response for
//! the id most recently sent. Whichever finishes first ends the handshake.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use jag_proto::chan::ChanReader;
use jag_proto::sync::{self, SyncState};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use super::Link;
use crate::{Error, Result};

/// Overall deadline for one handshake.
const DEADLINE: Duration = Duration::from_secs(10);

/// Delay between repeated sync requests.
const RESEND: Duration = Duration::from_secs(2);

impl Link {
    /// Discards pending input, then runs the handshake.
    pub(super) async fn sync(&mut self) -> Result<()> {
        self.drain().await?;

        let current = AtomicU16::new(self.sync.id());
        let Self {
            writer,
            reader,
            sync: state,
            ..
        } = &mut *self;
        let outcome = tokio::time::timeout(DEADLINE, async {
            tokio::select! {
                r = send_requests(writer, state, &current) => r,
                r = await_response(reader, &current) => r,
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.dirty = false;
                debug!(id = self.sync.id(), "synced");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::SyncFailed),
        }
    }

    /// Drops bytes already buffered or queued on the response stream.
    async fn drain(&mut self) -> Result<()> {
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);
        let mut scratch = [0u8; 512];
        let mut dropped = buffered;
        while self.reader.get_ref().has_data() {
            let n = self.reader.get_mut().read(&mut scratch).await?;
            if n == 0 {
                break;
            }
            dropped += n;
        }
        if dropped > 0 {
            debug!(dropped, "drained stale input");
        }
        Ok(())
    }
}

async fn send_requests(
    writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
    state: &mut SyncState,
    current: &AtomicU16,
) -> Result<()> {
    loop {
        let id = state.advance();
        // Publish before writing so the receiver never waits on an older id.
        current.store(id, Ordering::SeqCst);
        writer.write_all(&sync::sync_request(id)?).await?;
        writer.flush().await?;
        trace!(id, "sync request sent");
        tokio::time::sleep(RESEND).await;
    }
}

async fn await_response(reader: &mut BufReader<ChanReader>, current: &AtomicU16) -> Result<()> {
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        let id = current.load(Ordering::SeqCst);
        if line == sync::expected_sync_response(id)? {
            return Ok(());
        }
        trace!(len = line.len(), "discarded non-matching line during sync");
    }
}
