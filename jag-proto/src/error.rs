//! Error types for wire-level operations.

use std::io;

/// Alias for `Result<T, jag_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while encoding or decoding protocol data.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Frame content (command byte + payload) exceeds the 16-bit length field.
    #[error("payload of {0} bytes exceeds the 65535-byte frame limit")]
    PayloadTooLarge(usize),

    /// A frame declared zero length, so it carries no command byte.
    #[error("frame carries no command byte")]
    EmptyPayload,

    /// The byte after the declared frame content was not `\n`.
    #[error("invalid frame terminator {0:#04x}")]
    InvalidTerminator(u8),

    /// The stream ended before the declared frame content and terminator arrived.
    #[error("stream ended inside a frame")]
    Truncated,

    /// The response echoed a different command than the request.
    #[error("unmatched response: sent command {expected}, got {actual}")]
    UnmatchedResponse {
        /// Command code of the request.
        expected: u8,
        /// Command code echoed by the device.
        actual: u8,
    },

    /// An acknowledgment record was malformed or over-counted.
    #[error("invalid ack: {0}")]
    InvalidAck(String),

    /// A structured payload could not be decoded.
    #[error("malformed payload: {0}")]
    Decode(String),

    /// I/O error from the underlying stream.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns `true` for errors that mean the byte stream lost alignment.
    ///
    /// The current request must be abandoned; a fresh sync realigns the link.
    pub const fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::PayloadTooLarge(_)
                | Self::EmptyPayload
                | Self::InvalidTerminator(_)
                | Self::Truncated
                | Self::UnmatchedResponse { .. }
                | Self::InvalidAck(_)
        )
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
