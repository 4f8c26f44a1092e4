//! Device transports for the jag workstation tool.
//!
//! A device is reached over the local network (HTTP), Bluetooth Low Energy
//! (GATT) or a serial cable (length-prefixed packets multiplexed with the
//! device's log output). [`Device`] hides which one is in use; discovery
//! finds devices and [`discovery::select`] picks one.
//!
//! # Quick start
//!
//! ```no_run
//! use jag::{Cancel, Config, Device, Session, discovery};
//!
//! # struct First;
//! # impl discovery::Picker for First {
//! #     fn pick(&mut self, _: &[jag::DeviceIdentity]) -> Option<usize> { Some(0) }
//! # }
//! # async fn demo() -> jag::Result<()> {
//! let session = Session::new(Config::from_env());
//! let cancel = Cancel::never();
//! let picker = &mut First;
//! let identity = discovery::discover(&session, Some("kitchen"), false, picker, &cancel).await?;
//! let device = Device::open(identity, &session).await?;
//! if device.ping().await {
//!     println!("{:?}", device.container_list().await?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod ble;
pub mod cancel;
pub mod config;
pub mod device;
pub mod discovery;
mod error;
mod http;
pub mod identity;
pub mod proxy;
pub mod serial;
pub mod session;
pub mod uart;

pub use cancel::{Cancel, CancelHandle};
pub use config::Config;
pub use device::{Device, PushOptions};
pub use error::{Error, Result};
pub use http::{
    CONTAINER_NAME_HEADER, CONTAINER_TIMEOUT_HEADER, CRC32_HEADER, DEVICE_ID_HEADER,
    DISABLED_HEADER, SDK_VERSION_HEADER,
};
pub use identity::{DeviceIdentity, Transport};
pub use jag_proto::CodeKind;
pub use session::Session;
pub use uart::{SerialSession, Uart, open_serial};
