//! Acknowledgment records and chunk accounting for bulk transfers.
//!
//! After each chunk the device reports received bytes as one or more
//! `[0xFF][count u16 LE]` records. A chunk is delivered once its records
//! sum to exactly the chunk length.

use crate::{Error, Result};

/// First byte of every ack record.
pub const ACK: u8 = 0xFF;

/// Size of one ack record.
pub const ACK_LEN: usize = 3;

/// Chunk size for serial transfers.
pub const SERIAL_CHUNK_SIZE: usize = 512;

/// Chunk size for BLE transfers, bounded by the BLE MTU.
pub const BLE_CHUNK_SIZE: usize = 252;

/// Builds an ack record for `count` bytes.
pub const fn ack_record(count: u16) -> [u8; ACK_LEN] {
    let [lo, hi] = count.to_le_bytes();
    [ACK, lo, hi]
}

/// Parses an ack record, returning the acknowledged byte count.
pub fn parse_ack(record: [u8; ACK_LEN]) -> Result<u16> {
    if record[0] != ACK {
        return Err(Error::InvalidAck(format!(
            "record starts with {:#04x}",
            record[0]
        )));
    }
    Ok(u16::from_le_bytes([record[1], record[2]]))
}

/// Ack accounting for a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAcks {
    len: usize,
    acked: usize,
}

impl ChunkAcks {
    /// Starts accounting for a chunk of `len` bytes.
    pub const fn new(len: usize) -> Self {
        Self { len, acked: 0 }
    }

    /// Records an ack of `count` bytes; returns `true` once the chunk is fully acked.
    pub fn record(&mut self, count: u16) -> Result<bool> {
        let acked = self.acked + usize::from(count);
        if acked > self.len {
            return Err(Error::InvalidAck(format!(
                "acked {acked} bytes of a {}-byte chunk",
                self.len
            )));
        }
        self.acked = acked;
        Ok(self.is_complete())
    }

    /// Returns `true` when every byte of the chunk has been acked.
    pub const fn is_complete(&self) -> bool {
        self.acked == self.len
    }
}

/// Progress of a whole transfer.
///
/// Invariant: `acked <= written <= total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Total bytes to transfer.
    pub total: usize,
    /// Bytes written to the link.
    pub written: usize,
    /// Bytes the device confirmed.
    pub acked: usize,
}

impl Progress {
    /// Starts a transfer of `total` bytes.
    pub const fn new(total: usize) -> Self {
        Self {
            total,
            written: 0,
            acked: 0,
        }
    }

    /// Records `n` more bytes written.
    pub fn wrote(&mut self, n: usize) {
        self.written = (self.written + n).min(self.total);
    }

    /// Records `n` more bytes acknowledged.
    pub fn confirm(&mut self, n: usize) {
        self.acked = (self.acked + n).min(self.written);
    }

    /// The transfer is complete only when every byte is acknowledged.
    pub const fn is_complete(&self) -> bool {
        self.acked == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        assert_eq!(ack_record(0x0201), [0xFF, 0x01, 0x02]);
        assert_eq!(parse_ack(ack_record(512)).unwrap(), 512);
    }

    #[test]
    fn exact_sum_completes_chunk() {
        let mut acks = ChunkAcks::new(512);
        assert!(!acks.record(100).unwrap());
        assert!(!acks.record(50).unwrap());
        assert!(acks.record(362).unwrap());
    }

    #[test]
    fn overshoot_is_invalid() {
        let mut acks = ChunkAcks::new(512);
        acks.record(500).unwrap();
        let err = acks.record(13).unwrap_err();
        assert!(matches!(err, Error::InvalidAck(_)));
        assert!(err.is_framing());
    }

    #[test]
    fn wrong_lead_byte_is_invalid() {
        assert!(matches!(
            parse_ack([0xFE, 0x00, 0x02]),
            Err(Error::InvalidAck(_))
        ));
    }

    #[test]
    fn progress_never_acks_more_than_written() {
        let mut p = Progress::new(1000);
        p.wrote(512);
        p.confirm(600);
        assert_eq!(p.acked, 512);
        assert!(!p.is_complete());
        p.wrote(488);
        p.confirm(488);
        assert!(p.is_complete());
    }
}
