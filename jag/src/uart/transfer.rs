//! Ack-gated chunked transfer.

use std::time::Duration;

use jag_proto::ack::{self, ACK_LEN, ChunkAcks, Progress, SERIAL_CHUNK_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::Link;
use crate::{Error, Result};

impl Link {
    /// Writes `data` in [`SERIAL_CHUNK_SIZE`] chunks, waiting for each chunk
    /// to be fully acknowledged before sending the next.
    pub(super) async fn stream_chunked(
        &mut self,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Progress> {
        let mut progress = Progress::new(data.len());
        for chunk in data.chunks(SERIAL_CHUNK_SIZE) {
            self.writer.write_all(chunk).await?;
            self.writer.flush().await?;
            progress.wrote(chunk.len());

            let mut acks = ChunkAcks::new(chunk.len());
            while !acks.is_complete() {
                let mut record = [0u8; ACK_LEN];
                tokio::time::timeout(timeout, self.reader.read_exact(&mut record))
                    .await
                    .map_err(|_| Error::Timeout("chunk acknowledgment"))??;
                acks.record(ack::parse_ack(record)?)?;
            }
            progress.confirm(chunk.len());
            trace!(acked = progress.acked, total = progress.total, "chunk acked");
        }
        debug!(bytes = progress.acked, "transfer complete");
        Ok(progress)
    }
}
