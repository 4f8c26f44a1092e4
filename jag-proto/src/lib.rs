//! Wire protocol for jag workstation↔device communication.
//!
//! Covers the length-prefixed serial packet format, the sync handshake,
//! chunk acknowledgments, upload headers, identity announcements and the
//! escape-token multiplexer that separates device logs from protocol
//! traffic on a shared serial line.

pub mod ack;
pub mod chan;
mod error;
pub mod identity;
pub mod mux;
pub mod packet;
pub mod sync;
pub mod upload;

pub use chan::{ChanReader, ChanWriter, Offer};
pub use error::{Error, Result};
pub use identity::{Announcement, IDENTIFY_METHOD, IdentifyPayload};
pub use packet::Command;
pub use upload::{CodeKind, ContainerEntry, DefineValue, Defines, UploadHeader, UploadStatus};
