//! Error types for jag device operations.

/// Alias for `Result<T, jag::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by device transports, discovery and the proxy.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Framing or encoding failure on the wire.
    #[error(transparent)]
    Proto(#[from] jag_proto::Error),

    /// An I/O error from a socket, serial port or file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened or configured.
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),

    /// The BLE stack reported an error.
    #[error("bluetooth: {0}")]
    Ble(#[from] btleplug::Error),

    /// No usable BLE adapter on this machine.
    #[error("no bluetooth adapter available")]
    AdapterUnavailable,

    /// HTTP request to a device or proxy failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON document could not be parsed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An operation did not finish before its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The operation was cancelled by its owner.
    #[error("operation cancelled")]
    Cancelled,

    /// The sync handshake never completed.
    #[error("failed to sync with the device; check the cable and that the device is running")]
    SyncFailed,

    /// The device refused a request addressed to another device id.
    #[error("device id mismatch (expected {expected}); rescan to refresh the device list")]
    DeviceIdMismatch {
        /// Id the request was addressed to.
        expected: String,
    },

    /// The image was compiled with a different SDK than the device runs.
    #[error(
        "SDK version mismatch: device runs {device}, image built with {image}; \
         update the device firmware or switch SDK"
    )]
    SdkVersionMismatch {
        /// SDK version on the device.
        device: String,
        /// SDK version of the pushed image.
        image: String,
    },

    /// The firmware targets a different chip than the device has.
    #[error("firmware built for {firmware} cannot run on a {device} device")]
    ChipMismatch {
        /// Chip reported by the device.
        device: String,
        /// Chip the firmware was built for.
        firmware: String,
    },

    /// The device refused an upload header.
    #[error("device rejected the upload (status {0})")]
    UploadRejected(u8),

    /// The device answered with something other than what was asked.
    #[error("device error: {0}")]
    Device(String),

    /// The transport cannot perform this operation.
    #[error("{0}")]
    Unsupported(&'static str),

    /// Discovery finished without finding any device.
    #[error("no devices found; make sure the device is powered and on the same network")]
    NoDevicesFound,

    /// The requested device was not among those discovered.
    #[error("device '{0}' not found")]
    DeviceNotFound(String),
}
