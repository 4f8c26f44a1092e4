//! Request payloads for code pushes, firmware updates and container queries.
//!
//! Integers are little-endian. Structured fields (defines, container
//! entries) are postcard-encoded.

use std::collections::BTreeMap;

use crc::{CRC_32_ISO_HDLC, Crc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// CRC-32 used for image integrity (the zlib/IEEE polynomial).
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Define key that marks an installed container as disabled.
pub const DEFINE_DISABLED: &str = "jag.disabled";

/// Define key holding a container run timeout in seconds.
pub const DEFINE_TIMEOUT: &str = "jag.timeout";

/// Computes the CRC-32 of an image.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Value of a single define.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefineValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// String value.
    Text(String),
}

/// Key/value options passed to a pushed program.
pub type Defines = BTreeMap<String, DefineValue>;

/// Encodes a defines map.
pub fn encode_defines(defines: &Defines) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(defines)?)
}

/// Decodes a defines map.
pub fn decode_defines(bytes: &[u8]) -> Result<Defines> {
    if bytes.is_empty() {
        return Ok(Defines::new());
    }
    Ok(postcard::from_bytes(bytes)?)
}

/// What a code push does on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodeKind {
    /// Run once, without persisting.
    Run = 0,
    /// Install as a named container.
    Install = 1,
}

impl TryFrom<u8> for CodeKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Run),
            1 => Ok(Self::Install),
            other => Err(Error::Decode(format!("unknown code kind {other}"))),
        }
    }
}

/// One installed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEntry {
    /// Container image id.
    pub id: String,
    /// Container name.
    pub name: String,
}

/// Encodes a container listing.
pub fn encode_containers(entries: &[ContainerEntry]) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(entries)?)
}

/// Decodes a container listing.
pub fn decode_containers(bytes: &[u8]) -> Result<Vec<ContainerEntry>> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Decodes one container entry (BLE listings return entries one at a time).
pub fn decode_container(bytes: &[u8]) -> Result<ContainerEntry> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Encodes one container entry.
pub fn encode_container(entry: &ContainerEntry) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(entry)?)
}

/// Serial `Firmware` request: `[length u32]`.
pub fn firmware_request(image_len: usize) -> Result<Vec<u8>> {
    Ok(len32(image_len)?.to_le_bytes().to_vec())
}

/// Serial `Install` request: `[length u32][crc32 u32][name_len u16][name][defines]`.
pub fn install_request(name: &str, defines: &Defines, image: &[u8]) -> Result<Vec<u8>> {
    let mut out = image_prefix(image)?;
    put_str16(&mut out, name)?;
    out.extend(encode_defines(defines)?);
    Ok(out)
}

/// Serial `Run` request: `[length u32][crc32 u32][defines]`.
pub fn run_request(defines: &Defines, image: &[u8]) -> Result<Vec<u8>> {
    let mut out = image_prefix(image)?;
    out.extend(encode_defines(defines)?);
    Ok(out)
}

/// Header written to the BLE start-upload characteristic.
///
/// Layout: `[kind u8][sdk_len u16][sdk][image_len u32][crc32 u32]`
/// followed, for installs only, by `[name_len u16][name]`, then the
/// encoded defines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHeader {
    /// Run or install.
    pub kind: CodeKind,
    /// SDK version the image was compiled with.
    pub sdk_version: String,
    /// Image length in bytes.
    pub image_len: u32,
    /// CRC-32 of the image.
    pub crc32: u32,
    /// Container name (installs only).
    pub name: Option<String>,
    /// Program options.
    pub defines: Defines,
}

impl UploadHeader {
    /// Builds the header describing `image`.
    pub fn new(
        kind: CodeKind,
        sdk_version: &str,
        name: Option<&str>,
        defines: Defines,
        image: &[u8],
    ) -> Result<Self> {
        Ok(Self {
            kind,
            sdk_version: sdk_version.to_owned(),
            image_len: len32(image.len())?,
            crc32: crc32(image),
            name: name.map(str::to_owned),
            defines,
        })
    }

    /// Serializes the header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![self.kind as u8];
        put_str16(&mut out, &self.sdk_version)?;
        out.extend_from_slice(&self.image_len.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        if self.kind == CodeKind::Install {
            put_str16(&mut out, self.name.as_deref().unwrap_or_default())?;
        }
        out.extend(encode_defines(&self.defines)?);
        Ok(out)
    }

    /// Parses a header (device side).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader(bytes);
        let kind = CodeKind::try_from(r.u8()?)?;
        let sdk_version = r.str16()?;
        let image_len = r.u32()?;
        let crc32 = r.u32()?;
        let name = match kind {
            CodeKind::Install => Some(r.str16()?),
            CodeKind::Run => None,
        };
        let defines = decode_defines(r.0)?;
        Ok(Self {
            kind,
            sdk_version,
            image_len,
            crc32,
            name,
            defines,
        })
    }

    /// Returns `true` if `image` matches the declared length and checksum.
    pub fn verifies(&self, image: &[u8]) -> bool {
        image.len() == self.image_len as usize && crc32(image) == self.crc32
    }
}

/// Status byte returned after an upload header is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// Device is ready to receive the image.
    Ok,
    /// The image was built for a different SDK version.
    SdkMismatch,
    /// Any other device-side refusal.
    Rejected(u8),
}

impl From<u8> for UploadStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Ok,
            2 => Self::SdkMismatch,
            other => Self::Rejected(other),
        }
    }
}

fn len32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::PayloadTooLarge(len))
}

fn image_prefix(image: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&len32(image.len())?.to_le_bytes());
    out.extend_from_slice(&crc32(image).to_le_bytes());
    Ok(out)
}

fn put_str16(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| Error::PayloadTooLarge(s.len()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Little-endian cursor over a borrowed payload.
struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.0.len() < n {
            return Err(Error::Decode("payload ends early".into()));
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str16(&mut self) -> Result<String> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defines() -> Defines {
        let mut d = Defines::new();
        d.insert(DEFINE_DISABLED.into(), DefineValue::Bool(true));
        d.insert(DEFINE_TIMEOUT.into(), DefineValue::Int(30));
        d
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn install_header_layout() {
        let image = vec![7u8; 1000];
        let header =
            UploadHeader::new(CodeKind::Install, "v2.0", Some("blink"), defines(), &image).unwrap();
        let bytes = header.encode().unwrap();
        assert_eq!(bytes[0], CodeKind::Install as u8);
        assert_eq!(&bytes[1..3], &4u16.to_le_bytes());
        assert_eq!(&bytes[3..7], b"v2.0");
        assert_eq!(&bytes[7..11], &1000u32.to_le_bytes());
        assert_eq!(&bytes[11..15], &crc32(&image).to_le_bytes());
        assert_eq!(&bytes[15..17], &5u16.to_le_bytes());
        assert_eq!(&bytes[17..22], b"blink");
        assert_eq!(UploadHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn run_header_has_no_name() {
        let header = UploadHeader::new(CodeKind::Run, "v2.0", None, Defines::new(), b"x").unwrap();
        let decoded = UploadHeader::decode(&header.encode().unwrap()).unwrap();
        assert_eq!(decoded.name, None);
        assert!(decoded.defines.is_empty());
    }

    #[test]
    fn corrupted_image_fails_declared_crc() {
        let mut image: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 256) as u8).collect();
        let header = UploadHeader::new(CodeKind::Run, "v2.0", None, defines(), &image).unwrap();
        let declared = UploadHeader::decode(&header.encode().unwrap()).unwrap();
        assert!(declared.verifies(&image));

        image[1234] ^= 0x40;
        assert_ne!(crc32(&image), declared.crc32);
        assert!(!declared.verifies(&image));
    }

    #[test]
    fn serial_install_request_layout() {
        let image = b"abc";
        let req = install_request("app", &Defines::new(), image).unwrap();
        assert_eq!(&req[0..4], &3u32.to_le_bytes());
        assert_eq!(&req[4..8], &crc32(image).to_le_bytes());
        assert_eq!(&req[8..10], &3u16.to_le_bytes());
        assert_eq!(&req[10..13], b"app");
        assert_eq!(decode_defines(&req[13..]).unwrap(), Defines::new());
    }

    #[test]
    fn status_codes() {
        assert_eq!(UploadStatus::from(0), UploadStatus::Ok);
        assert_eq!(UploadStatus::from(2), UploadStatus::SdkMismatch);
        assert_eq!(UploadStatus::from(1), UploadStatus::Rejected(1));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let header = UploadHeader::new(CodeKind::Install, "v2.0", Some("x"), Defines::new(), b"1")
            .unwrap()
            .encode()
            .unwrap();
        assert!(UploadHeader::decode(&header[..9]).is_err());
    }
}
