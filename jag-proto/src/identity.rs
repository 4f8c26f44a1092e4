//! Identity messages exchanged during discovery and identify requests.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Method tag carried by every identity announcement.
pub const IDENTIFY_METHOD: &str = "jaguar.identify";

/// Identity fields reported by a device or proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyPayload {
    /// Device UUID.
    pub id: String,
    /// Human-readable device name.
    pub name: String,
    /// Chip family (e.g. `esp32s3`).
    #[serde(default)]
    pub chip: String,
    /// SDK version the firmware was built with.
    pub sdk_version: String,
    /// Machine word size in bytes (4 or 8).
    pub word_size: u8,
    /// Address the device is reachable at (empty over a raw serial link).
    #[serde(default)]
    pub address: String,
    /// Set when the device is reached through a UART proxy.
    #[serde(default)]
    pub proxied: bool,
}

/// Envelope broadcast over UDP and returned by `GET /identify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Always [`IDENTIFY_METHOD`].
    pub method: String,
    /// Identity fields.
    pub payload: IdentifyPayload,
}

impl Announcement {
    /// Wraps `payload` in an identify envelope.
    pub fn identify(payload: IdentifyPayload) -> Self {
        Self {
            method: IDENTIFY_METHOD.to_owned(),
            payload,
        }
    }

    /// Compact binary encoding used for UDP datagrams.
    pub fn to_compact(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Plain JSON encoding used by the HTTP surface.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Decodes an announcement, trying the compact form first and JSON second.
    ///
    /// Fails if neither form yields a [`IDENTIFY_METHOD`] envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if let Ok(msg) = postcard::from_bytes::<Self>(bytes)
            && msg.method == IDENTIFY_METHOD
        {
            return Ok(msg);
        }
        let msg: Self = serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))?;
        if msg.method != IDENTIFY_METHOD {
            return Err(Error::Decode(format!("unexpected method '{}'", msg.method)));
        }
        Ok(msg)
    }
}

/// Encodes an identify response payload for the serial and BLE links.
pub fn encode_identify(payload: &IdentifyPayload) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(payload)?)
}

/// Decodes an identify response payload from the serial and BLE links.
pub fn decode_identify(bytes: &[u8]) -> Result<IdentifyPayload> {
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IdentifyPayload {
        IdentifyPayload {
            id: "5b9c4f9e-53a3-4c4e-9a4e-7d2b1f0a6c11".into(),
            name: "kitchen".into(),
            chip: "esp32s3".into(),
            sdk_version: "v2.0.0-alpha.150".into(),
            word_size: 4,
            address: "http://192.168.1.20:9000".into(),
            proxied: false,
        }
    }

    #[test]
    fn compact_datagram_decodes() {
        let msg = Announcement::identify(sample());
        let bytes = msg.to_compact().unwrap();
        assert_eq!(Announcement::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn plain_json_is_accepted() {
        let json = concat!(
            r#"{"method":"jaguar.identify","payload":{"id":"abc","name":"n","#,
            r#""sdkVersion":"v1","wordSize":8,"address":"http://10.0.0.2:9000"}}"#,
        );
        let msg = Announcement::decode(json.as_bytes()).unwrap();
        assert_eq!(msg.payload.word_size, 8);
        assert_eq!(msg.payload.chip, "");
        assert!(!msg.payload.proxied);
    }

    #[test]
    fn json_field_names_are_camel_case() {
        let json = String::from_utf8(Announcement::identify(sample()).to_json().unwrap()).unwrap();
        assert!(json.contains("\"sdkVersion\""));
        assert!(json.contains("\"wordSize\":4"));
        assert!(json.starts_with("{\"method\":\"jaguar.identify\""));
    }

    #[test]
    fn other_methods_are_rejected() {
        let json = concat!(
            r#"{"method":"jaguar.other","#,
            r#""payload":{"id":"a","name":"n","sdkVersion":"v","wordSize":4}}"#,
        );
        assert!(Announcement::decode(json.as_bytes()).is_err());
        assert!(Announcement::decode(b"garbage").is_err());
    }
}
