//! Protocol engine for a device reached over Bluetooth Low Energy.
//!
//! Each command has its own GATT characteristic under one service. Replies
//! are read back from the characteristic that was written.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use jag_proto::ack::BLE_CHUNK_SIZE;
use jag_proto::{ContainerEntry, IdentifyPayload, UploadHeader, UploadStatus, identity, upload};
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::{Error, Result};

/// Primary service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x7017_0000_6a61_6775_6172_0000_0000_0000);
/// Nonce echo.
pub const PING_UUID: Uuid = Uuid::from_u128(0x7017_0001_6a61_6775_6172_0000_0000_0000);
/// Postcard identify payload.
pub const IDENTIFY_UUID: Uuid = Uuid::from_u128(0x7017_0002_6a61_6775_6172_0000_0000_0000);
/// Container count and entries by index.
pub const CONTAINER_LIST_UUID: Uuid = Uuid::from_u128(0x7017_0003_6a61_6775_6172_0000_0000_0000);
/// Container name to remove.
pub const UNINSTALL_UUID: Uuid = Uuid::from_u128(0x7017_0004_6a61_6775_6172_0000_0000_0000);
/// Upload header and status byte.
pub const UPLOAD_START_UUID: Uuid = Uuid::from_u128(0x7017_0005_6a61_6775_6172_0000_0000_0000);
/// Image bytes.
pub const UPLOAD_DATA_UUID: Uuid = Uuid::from_u128(0x7017_0006_6a61_6775_6172_0000_0000_0000);

/// Company id under which devices advertise [`MANUFACTURER_TOKEN`].
pub const MANUFACTURER_ID: u16 = 0xFFFF;

/// Manufacturer data marking a jag device.
pub const MANUFACTURER_TOKEN: &[u8] = b"Jaguar";

/// Container-list index that asks for the entry count.
const COUNT_INDEX: u16 = 0xFFFF;

/// Delay between peripheral list polls while scanning.
const SCAN_POLL: Duration = Duration::from_millis(250);

/// Lazily enabled handle on the host's BLE adapter.
///
/// Created once per process and passed to everything that needs BLE.
#[derive(Default)]
pub struct BleAdapter {
    adapter: OnceCell<Adapter>,
}

impl std::fmt::Debug for BleAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleAdapter")
            .field("enabled", &self.adapter.initialized())
            .finish()
    }
}

impl BleAdapter {
    /// Creates an adapter handle; nothing is touched until first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the adapter, enabling it on first call.
    pub async fn ensure_enabled(&self) -> Result<&Adapter> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter = manager
                    .adapters()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(Error::AdapterUnavailable)?;
                let info = adapter.adapter_info().await?;
                info!(adapter = %info, "bluetooth adapter enabled");
                Ok::<_, Error>(adapter)
            })
            .await
    }
}

/// Returns `true` if advertised manufacturer data carries the jag token.
pub fn advertises_jag(manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool {
    manufacturer_data
        .get(&MANUFACTURER_ID)
        .is_some_and(|data| data.starts_with(MANUFACTURER_TOKEN))
}

/// Address used to identify a peripheral across scans.
pub fn peripheral_address(peripheral: &Peripheral) -> String {
    peripheral.address().to_string()
}

fn matches_address(peripheral: &Peripheral, address: &str) -> bool {
    peripheral_address(peripheral).eq_ignore_ascii_case(address)
        || peripheral.id().to_string() == address
}

/// The characteristics of the jag service, one per command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattChar {
    /// Nonce echo.
    Ping,
    /// Identify payload.
    Identify,
    /// Container count and entries.
    ContainerList,
    /// Container removal.
    Uninstall,
    /// Upload header and status.
    UploadStart,
    /// Image bytes.
    UploadData,
}

impl GattChar {
    /// Every characteristic the service must expose.
    pub const ALL: [Self; 6] = [
        Self::Ping,
        Self::Identify,
        Self::ContainerList,
        Self::Uninstall,
        Self::UploadStart,
        Self::UploadData,
    ];

    /// UUID of this characteristic.
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Ping => PING_UUID,
            Self::Identify => IDENTIFY_UUID,
            Self::ContainerList => CONTAINER_LIST_UUID,
            Self::Uninstall => UNINSTALL_UUID,
            Self::UploadStart => UPLOAD_START_UUID,
            Self::UploadData => UPLOAD_DATA_UUID,
        }
    }
}

/// Reads and writes on the jag service characteristics.
pub trait Gatt {
    /// Writes `data` to `target`.
    fn write(
        &self,
        target: GattChar,
        data: &[u8],
        mode: WriteType,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Reads the current value of `target`.
    fn read(&self, target: GattChar) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// A connected btleplug peripheral with the service characteristics resolved.
#[derive(Debug)]
pub struct PeripheralGatt {
    peripheral: Peripheral,
    chars: HashMap<GattChar, Characteristic>,
}

fn resolve(found: &BTreeSet<Characteristic>) -> Result<HashMap<GattChar, Characteristic>> {
    GattChar::ALL
        .into_iter()
        .map(|target| {
            let uuid = target.uuid();
            found
                .iter()
                .find(|c| c.uuid == uuid && c.service_uuid == SERVICE_UUID)
                .cloned()
                .map(|c| (target, c))
                .ok_or_else(|| Error::Device(format!("missing BLE characteristic {uuid}")))
        })
        .collect()
}

impl PeripheralGatt {
    fn characteristic(&self, target: GattChar) -> Result<&Characteristic> {
        self.chars
            .get(&target)
            .ok_or_else(|| Error::Device(format!("missing BLE characteristic {}", target.uuid())))
    }
}

impl Gatt for PeripheralGatt {
    async fn write(&self, target: GattChar, data: &[u8], mode: WriteType) -> Result<()> {
        let characteristic = self.characteristic(target)?;
        self.peripheral.write(characteristic, data, mode).await?;
        Ok(())
    }

    async fn read(&self, target: GattChar) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(target)?;
        Ok(self.peripheral.read(characteristic).await?)
    }
}

/// A connected BLE device.
#[derive(Debug)]
pub struct BleConnection<G = PeripheralGatt> {
    gatt: G,
}

impl BleConnection {
    /// Scans until `address` is seen, then connects and discovers the service.
    ///
    /// Some BLE stacks refuse a direct connect to a peripheral they have not
    /// seen advertise in the current session, hence the scan.
    pub async fn connect(adapter: &Adapter, address: &str, timeout: Duration) -> Result<Self> {
        let Ok(found) = tokio::time::timeout(timeout, find_peripheral(adapter, address)).await
        else {
            adapter.stop_scan().await?;
            return Err(Error::Timeout("BLE peripheral"));
        };
        Self::attach(found?).await
    }

    /// Connects to an already observed peripheral.
    pub async fn attach(peripheral: Peripheral) -> Result<Self> {
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;
        let chars = resolve(&peripheral.characteristics())?;
        debug!(address = %peripheral_address(&peripheral), "BLE services resolved");
        Ok(Self::new(PeripheralGatt { peripheral, chars }))
    }

    /// Disconnects from the peripheral.
    pub async fn disconnect(&self) -> Result<()> {
        self.gatt.peripheral.disconnect().await?;
        Ok(())
    }
}

impl<G: Gatt> BleConnection<G> {
    /// Wraps a GATT link.
    pub const fn new(gatt: G) -> Self {
        Self { gatt }
    }

    /// Writes a random nonce and checks that the device echoes it.
    pub async fn ping(&self) -> Result<()> {
        let nonce: [u8; 4] = rand::random();
        self.gatt
            .write(GattChar::Ping, &nonce, WriteType::WithoutResponse)
            .await?;
        let echo = self.gatt.read(GattChar::Ping).await?;
        if echo != nonce {
            return Err(Error::Device("ping echo did not match nonce".into()));
        }
        Ok(())
    }

    /// Reads the identity characteristic.
    pub async fn identify(&self) -> Result<IdentifyPayload> {
        let raw = self.gatt.read(GattChar::Identify).await?;
        Ok(identity::decode_identify(&raw)?)
    }

    /// Reads the container count, then each entry by index.
    pub async fn list_containers(&self) -> Result<Vec<ContainerEntry>> {
        let count = decode_count(&self.query_index(COUNT_INDEX).await?)?;
        let mut entries = Vec::with_capacity(usize::from(count));
        for index in 0..count {
            let raw = self.query_index(index).await?;
            entries.push(upload::decode_container(&raw)?);
        }
        Ok(entries)
    }

    async fn query_index(&self, index: u16) -> Result<Vec<u8>> {
        self.gatt
            .write(GattChar::ContainerList, &index.to_le_bytes(), WriteType::WithResponse)
            .await?;
        self.gatt.read(GattChar::ContainerList).await
    }

    /// Removes the container called `name`.
    pub async fn uninstall(&self, name: &str) -> Result<()> {
        self.gatt
            .write(GattChar::Uninstall, name.as_bytes(), WriteType::WithResponse)
            .await
    }

    /// Writes `header`, reads the status byte and, if accepted, streams `image`.
    pub async fn upload(&self, header: &UploadHeader, image: &[u8]) -> Result<UploadStatus> {
        self.gatt
            .write(GattChar::UploadStart, &header.encode()?, WriteType::WithResponse)
            .await?;
        let status = decode_status(&self.gatt.read(GattChar::UploadStart).await?)?;
        if status != UploadStatus::Ok {
            return Ok(status);
        }

        for chunk in image.chunks(BLE_CHUNK_SIZE) {
            self.gatt
                .write(GattChar::UploadData, chunk, WriteType::WithoutResponse)
                .await?;
            trace!(len = chunk.len(), "BLE chunk written");
        }
        debug!(bytes = image.len(), "BLE upload complete");
        Ok(status)
    }

    /// Firmware updates are not carried over BLE.
    pub fn update_firmware(&self, _image: &[u8]) -> Result<()> {
        Err(Error::Unsupported(
            "firmware updates over BLE are not supported; use the network or a serial cable",
        ))
    }
}

fn decode_count(raw: &[u8]) -> Result<u16> {
    <[u8; 2]>::try_from(raw)
        .map(u16::from_le_bytes)
        .map_err(|_| Error::Device(format!("container count of {} bytes", raw.len())))
}

fn decode_status(raw: &[u8]) -> Result<UploadStatus> {
    raw.first()
        .copied()
        .map(UploadStatus::from)
        .ok_or_else(|| Error::Device("empty upload status".into()))
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Peripheral> {
    adapter.start_scan(ScanFilter::default()).await?;
    loop {
        if let Some(found) = adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| matches_address(p, address))
        {
            adapter.stop_scan().await?;
            return Ok(found);
        }
        tokio::time::sleep(SCAN_POLL).await;
    }
}

/// Peripherals currently known to the adapter that advertise the jag token.
pub async fn advertising_peripherals(adapter: &Adapter) -> Result<Vec<Peripheral>> {
    let mut out = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let Some(props) = peripheral.properties().await? else {
            continue;
        };
        if advertises_jag(&props.manufacturer_data) {
            out.push(peripheral);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn manufacturer_token_filter() {
        let mut data = HashMap::new();
        assert!(!advertises_jag(&data));

        data.insert(0x004C, b"Jaguar".to_vec());
        assert!(!advertises_jag(&data));

        data.insert(MANUFACTURER_ID, b"Jaguar\x01\x02".to_vec());
        assert!(advertises_jag(&data));

        data.insert(MANUFACTURER_ID, b"Jag".to_vec());
        assert!(!advertises_jag(&data));
    }

    #[test]
    fn characteristic_uuids_share_service_family() {
        let all = [
            PING_UUID,
            IDENTIFY_UUID,
            CONTAINER_LIST_UUID,
            UNINSTALL_UUID,
            UPLOAD_START_UUID,
            UPLOAD_DATA_UUID,
        ];
        for (i, uuid) in all.iter().enumerate() {
            assert_eq!(uuid.as_u128() >> 96, 0x7017_0000 + i as u128 + 1);
            assert_eq!(uuid.as_u128() & ((1 << 96) - 1), SERVICE_UUID.as_u128() & ((1 << 96) - 1));
        }
    }

    #[test]
    fn missing_characteristic_is_reported() {
        let err = resolve(&BTreeSet::new()).unwrap_err();
        assert!(matches!(err, Error::Device(msg) if msg.contains("70170001")));
    }

    /// In-memory service answering the way device firmware does.
    #[derive(Debug, Default)]
    struct FakeGatt {
        containers: Vec<ContainerEntry>,
        /// Replaces the two-byte count reply.
        count_reply: Option<Vec<u8>>,
        upload_status: u8,
        corrupt_echo: bool,
        log: Mutex<FakeLog>,
    }

    #[derive(Debug, Default)]
    struct FakeLog {
        writes: Vec<(GattChar, Vec<u8>, WriteType)>,
        nonce: Vec<u8>,
        index: u16,
    }

    impl Gatt for FakeGatt {
        async fn write(&self, target: GattChar, data: &[u8], mode: WriteType) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            match target {
                GattChar::Ping => log.nonce = data.to_vec(),
                GattChar::ContainerList => log.index = u16::from_le_bytes([data[0], data[1]]),
                _ => {}
            }
            log.writes.push((target, data.to_vec(), mode));
            Ok(())
        }

        async fn read(&self, target: GattChar) -> Result<Vec<u8>> {
            let log = self.log.lock().unwrap();
            Ok(match target {
                GattChar::Ping if self.corrupt_echo => log.nonce.iter().map(|b| !b).collect(),
                GattChar::Ping => log.nonce.clone(),
                GattChar::Identify => {
                    identity::encode_identify(&crate::uart::mock::identity()).unwrap()
                }
                GattChar::ContainerList if log.index == COUNT_INDEX => {
                    self.count_reply.clone().unwrap_or_else(|| {
                        u16::try_from(self.containers.len()).unwrap().to_le_bytes().to_vec()
                    })
                }
                GattChar::ContainerList => {
                    upload::encode_container(&self.containers[usize::from(log.index)]).unwrap()
                }
                GattChar::UploadStart => vec![self.upload_status],
                GattChar::Uninstall | GattChar::UploadData => Vec::new(),
            })
        }
    }

    fn writes(conn: &BleConnection<FakeGatt>, target: GattChar) -> Vec<(Vec<u8>, WriteType)> {
        conn.gatt
            .log
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(t, ..)| *t == target)
            .map(|(_, data, mode)| (data.clone(), *mode))
            .collect()
    }

    fn entry(id: &str, name: &str) -> ContainerEntry {
        ContainerEntry {
            id: id.into(),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn ping_checks_the_echoed_nonce() {
        let conn = BleConnection::new(FakeGatt::default());
        conn.ping().await.unwrap();
        let sent = writes(&conn, GattChar::Ping);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.len(), 4);
        assert_eq!(sent[0].1, WriteType::WithoutResponse);

        let broken = BleConnection::new(FakeGatt {
            corrupt_echo: true,
            ..FakeGatt::default()
        });
        let err = broken.ping().await.unwrap_err();
        assert!(matches!(err, Error::Device(msg) if msg.contains("echo")));
    }

    #[tokio::test]
    async fn identify_decodes_payload() {
        let conn = BleConnection::new(FakeGatt::default());
        assert_eq!(conn.identify().await.unwrap().name, "bench");
    }

    #[tokio::test]
    async fn list_asks_for_count_then_each_index() {
        let conn = BleConnection::new(FakeGatt {
            containers: vec![entry("c0", "jaguar"), entry("c1", "blink"), entry("c2", "fan")],
            ..FakeGatt::default()
        });
        let list = conn.list_containers().await.unwrap();
        assert_eq!(list, [entry("c0", "jaguar"), entry("c1", "blink"), entry("c2", "fan")]);

        let indexes: Vec<u16> = writes(&conn, GattChar::ContainerList)
            .into_iter()
            .map(|(data, _)| u16::from_le_bytes([data[0], data[1]]))
            .collect();
        assert_eq!(indexes, [COUNT_INDEX, 0, 1, 2]);
    }

    #[tokio::test]
    async fn malformed_count_is_a_device_error() {
        let conn = BleConnection::new(FakeGatt {
            count_reply: Some(vec![3]),
            ..FakeGatt::default()
        });
        let err = conn.list_containers().await.unwrap_err();
        assert!(matches!(err, Error::Device(msg) if msg == "container count of 1 bytes"));
    }

    #[tokio::test]
    async fn accepted_upload_streams_252_byte_chunks() {
        let conn = BleConnection::new(FakeGatt::default());
        let image: Vec<u8> = (0..600u32).map(|i| (i % 256) as u8).collect();
        let header = UploadHeader::new(
            jag_proto::CodeKind::Install,
            "v2.0.0",
            Some("app"),
            jag_proto::Defines::new(),
            &image,
        )
        .unwrap();

        assert_eq!(conn.upload(&header, &image).await.unwrap(), UploadStatus::Ok);

        let start = writes(&conn, GattChar::UploadStart);
        assert_eq!(UploadHeader::decode(&start[0].0).unwrap(), header);
        let chunks = writes(&conn, GattChar::UploadData);
        let sizes: Vec<usize> = chunks.iter().map(|(data, _)| data.len()).collect();
        assert_eq!(sizes, [252, 252, 96]);
        assert!(chunks.iter().all(|(_, mode)| *mode == WriteType::WithoutResponse));
        let streamed: Vec<u8> = chunks.into_iter().flat_map(|(data, _)| data).collect();
        assert_eq!(streamed, image);
    }

    #[tokio::test]
    async fn refused_upload_sends_no_data() {
        for (byte, status) in [(2, UploadStatus::SdkMismatch), (5, UploadStatus::Rejected(5))] {
            let conn = BleConnection::new(FakeGatt {
                upload_status: byte,
                ..FakeGatt::default()
            });
            let header = UploadHeader::new(
                jag_proto::CodeKind::Run,
                "v1.0.0",
                None,
                jag_proto::Defines::new(),
                b"img",
            )
            .unwrap();
            assert_eq!(conn.upload(&header, b"img").await.unwrap(), status);
            assert!(writes(&conn, GattChar::UploadData).is_empty());
        }
    }

    #[test]
    fn empty_status_is_an_error() {
        assert!(decode_status(&[]).is_err());
        assert_eq!(decode_status(&[0, 9]).unwrap(), UploadStatus::Ok);
    }

    #[test]
    fn firmware_is_unsupported() {
        let conn = BleConnection::new(FakeGatt::default());
        assert!(matches!(conn.update_firmware(b"fw"), Err(Error::Unsupported(_))));
    }
}
