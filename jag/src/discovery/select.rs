//! Matching a user's device selector against discovered devices.

use std::fmt;

use uuid::Uuid;

use crate::identity::DeviceIdentity;
use crate::{Error, Result};

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// A device UUID.
    Id(String),
    /// A device name.
    Name(String),
    /// A network address, with or without scheme and port.
    Address(String),
}

impl Criterion {
    /// Classifies a free-form selector.
    ///
    /// UUIDs are ids; anything that looks like a host or URL is an address
    /// (and may be identified directly); the rest is a name.
    pub fn parse(selector: &str) -> Self {
        if Uuid::parse_str(selector).is_ok() {
            Self::Id(selector.to_owned())
        } else if is_address(selector) {
            Self::Address(selector.to_owned())
        } else {
            Self::Name(selector.to_owned())
        }
    }

    /// The selector text as given.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Id(s) | Self::Name(s) | Self::Address(s) => s,
        }
    }

    /// Returns the best matching device.
    ///
    /// An id selector tries ids first. Every selector then tries exact
    /// names, then address prefixes, so a dotted name such as `lab.esp32`
    /// still selects by name.
    pub fn find<'a>(&self, devices: &'a [DeviceIdentity]) -> Option<&'a DeviceIdentity> {
        let text = self.as_str();
        let by_id = || match self {
            Self::Id(id) => devices.iter().find(|d| d.id == *id),
            Self::Name(_) | Self::Address(_) => None,
        };
        let by_name = || devices.iter().find(|d| d.name == text);
        let by_address = || {
            let prefixes = address_prefixes(text);
            devices
                .iter()
                .find(|d| prefixes.iter().any(|p| has_address_prefix(&d.address, p)))
        };
        by_id().or_else(by_name).or_else(by_address)
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_address(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.contains('.') || s.contains(':')
}

/// Candidate prefixes for an address: as given, with `http://`, and both
/// again without an explicit port.
fn address_prefixes(address: &str) -> Vec<String> {
    let bare = address
        .strip_prefix("http://")
        .or_else(|| address.strip_prefix("https://"))
        .unwrap_or(address)
        .trim_end_matches('/');
    let mut out = vec![address.trim_end_matches('/').to_owned(), format!("http://{bare}")];
    if let Some((host, port)) = bare.rsplit_once(':')
        && !port.is_empty()
        && port.bytes().all(|b| b.is_ascii_digit())
    {
        out.push(host.to_owned());
        out.push(format!("http://{host}"));
    }
    out.dedup();
    out
}

/// Prefix match that stops at a host boundary, so `10.0.0.1` does not
/// match `10.0.0.10`.
fn has_address_prefix(address: &str, prefix: &str) -> bool {
    address
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(':') || rest.starts_with('/'))
}

/// Interactive chooser used when no selector matches.
pub trait Picker {
    /// Returns the index of the chosen device, or `None` if the user declined.
    fn pick(&mut self, devices: &[DeviceIdentity]) -> Option<usize>;
}

/// Picks a device from `devices`.
///
/// A matching `criterion` wins. Without a match, a `required` criterion
/// fails with [`Error::DeviceNotFound`]; otherwise `picker` decides.
pub fn select(
    devices: &[DeviceIdentity],
    criterion: Option<&Criterion>,
    required: bool,
    picker: &mut dyn Picker,
) -> Result<DeviceIdentity> {
    if devices.is_empty() {
        return Err(Error::NoDevicesFound);
    }
    if let Some(criterion) = criterion {
        if let Some(device) = criterion.find(devices) {
            return Ok(device.clone());
        }
        if required {
            return Err(Error::DeviceNotFound(criterion.to_string()));
        }
    }
    picker
        .pick(devices)
        .and_then(|i| devices.get(i))
        .cloned()
        .ok_or(Error::Cancelled)
}
