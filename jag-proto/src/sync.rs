//! Sync handshake packets.
//!
//! The host sends `[sync_id LE][magic - 1]`; the device answers with
//! `[sync_id LE][magic]`. Decrementing the magic on the way out means a
//! line that merely echoes the request never passes for a response.

use crate::packet::{self, Command};
use crate::Result;

/// Magic sequence shared with the device firmware.
pub const SYNC_MAGIC: [u8; 8] = *b"jagsync!";

/// Per-connection sync counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncState {
    id: u16,
}

impl SyncState {
    /// Current sync id.
    pub const fn id(&self) -> u16 {
        self.id
    }

    /// Advances to the next usable id and returns it.
    pub fn advance(&mut self) -> u16 {
        self.id = next_sync_id(self.id);
        self.id
    }
}

/// Returns the id following `id`, skipping ids that contain a `\n` byte.
///
/// Sync frames are matched line by line, so an id whose encoding contains the
/// terminator would split its own response.
pub const fn next_sync_id(id: u16) -> u16 {
    let mut next = id.wrapping_add(1);
    while has_newline(next) {
        next = next.wrapping_add(1);
    }
    next
}

const fn has_newline(id: u16) -> bool {
    let [lo, hi] = id.to_le_bytes();
    lo == packet::TERMINATOR || hi == packet::TERMINATOR
}

/// Builds the sync request frame for `id`.
pub fn sync_request(id: u16) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(10);
    payload.extend_from_slice(&id.to_le_bytes());
    payload.extend(SYNC_MAGIC.iter().map(|b| b.wrapping_sub(1)));
    packet::encode(Command::Sync.code(), &payload)
}

/// Builds the exact frame a device sends in response to sync `id`.
pub fn expected_sync_response(id: u16) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(10);
    payload.extend_from_slice(&id.to_le_bytes());
    payload.extend_from_slice(&SYNC_MAGIC);
    packet::encode(Command::Sync.code(), &payload)
}

/// Device side: turns a sync request payload into the response payload.
///
/// Returns `None` if the payload is not a well-formed sync request.
pub fn answer_sync(request_payload: &[u8]) -> Option<Vec<u8>> {
    let (id, magic) = request_payload.split_first_chunk::<2>()?;
    if magic.len() != SYNC_MAGIC.len() {
        return None;
    }
    let restored: Vec<u8> = magic.iter().map(|b| b.wrapping_add(1)).collect();
    if restored != SYNC_MAGIC {
        return None;
    }
    let mut out = id.to_vec();
    out.extend_from_slice(&restored);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_reply(request: &[u8]) -> Vec<u8> {
        let (cmd, payload) = packet::decode(&mut std::io::Cursor::new(request)).unwrap();
        assert_eq!(cmd, Command::Sync.code());
        let answer = answer_sync(&payload).unwrap();
        packet::encode(cmd, &answer).unwrap()
    }

    #[test]
    fn response_matches_only_its_own_id() {
        for id in [1u16, 2, 200, 0x0B0B, u16::MAX - 1] {
            let reply = device_reply(&sync_request(id).unwrap());
            assert_eq!(reply, expected_sync_response(id).unwrap());
            assert_ne!(reply, expected_sync_response(id.wrapping_add(1)).unwrap());
            assert_ne!(reply, expected_sync_response(id.wrapping_sub(1)).unwrap());
        }
    }

    #[test]
    fn echoed_request_is_not_a_response() {
        let request = sync_request(7).unwrap();
        assert_ne!(request, expected_sync_response(7).unwrap());
    }

    #[test]
    fn ids_skip_newline_bytes() {
        assert_eq!(next_sync_id(9), 11);
        assert_eq!(next_sync_id(0x09FF), 0x0B00);
        let mut state = SyncState::default();
        for _ in 0..5000 {
            let id = state.advance();
            assert!(!id.to_le_bytes().contains(&b'\n'));
            let frame = expected_sync_response(id).unwrap();
            assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);
        }
    }

    #[test]
    fn rejects_garbage_sync_payload() {
        assert!(answer_sync(b"").is_none());
        assert!(answer_sync(b"\x01\x00jagsync!").is_none());
    }
}
