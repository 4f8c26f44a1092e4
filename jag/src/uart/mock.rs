//! In-process device speaking the serial protocol over duplex pipes.

use std::sync::Arc;
use std::time::Duration;

use jag_proto::ack::{SERIAL_CHUNK_SIZE, ack_record};
use jag_proto::packet::{self, Command};
use jag_proto::sync::answer_sync;
use jag_proto::{ContainerEntry, Defines, IdentifyPayload, identity, mux, upload};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

use super::Uart;

/// How the device acknowledges received chunks.
pub(crate) enum AckMode {
    /// Acks each chunk in pieces of these sizes (cycled), summing to the chunk.
    Split(Vec<u16>),
    /// Sends these records after the first chunk, then stops.
    Raw(Vec<[u8; 3]>),
}

pub(crate) struct MockConfig {
    pub acks: AckMode,
    /// Answer the first ping with the wrong command code.
    pub wrong_echo_once: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            acks: AckMode::Split(vec![200]),
            wrong_echo_once: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Upload {
    pub command: Command,
    pub name: Option<String>,
    pub defines: Defines,
    pub data: Vec<u8>,
    pub crc_ok: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceState {
    pub syncs: usize,
    pub uninstalled: Vec<String>,
    pub uploads: Vec<Upload>,
    pub containers: Vec<ContainerEntry>,
}

pub(crate) type Shared = Arc<std::sync::Mutex<DeviceState>>;

pub(crate) struct MockDevice {
    pub uart: Arc<Uart>,
    state: Shared,
    out: Arc<Mutex<DuplexStream>>,
}

pub(crate) fn identity() -> IdentifyPayload {
    IdentifyPayload {
        id: "0f5a3c2e-8d4b-4c1a-9e7f-2b6d1a0c9e33".into(),
        name: "bench".into(),
        chip: "esp32".into(),
        sdk_version: "v2.0.0".into(),
        word_size: 4,
        address: String::new(),
        proxied: false,
    }
}

impl MockDevice {
    /// Spawns the device and returns a synced engine talking to it.
    pub async fn start(cfg: MockConfig) -> Self {
        let (host_w, dev_r) = tokio::io::duplex(1 << 16);
        let (dev_w, host_r) = tokio::io::duplex(1 << 16);
        let (logs, oob) = mux::multiplex(host_r);
        drop(logs);

        let state: Shared = Arc::new(std::sync::Mutex::new(DeviceState {
            containers: vec![
                ContainerEntry {
                    id: "c0".into(),
                    name: "jaguar".into(),
                },
                ContainerEntry {
                    id: "c1".into(),
                    name: "blink".into(),
                },
            ],
            ..DeviceState::default()
        }));
        let out = Arc::new(Mutex::new(dev_w));
        tokio::spawn(device_loop(cfg, dev_r, Arc::clone(&out), Arc::clone(&state)));

        let uart = Uart::connect(oob, host_w, Duration::from_secs(2))
            .await
            .unwrap();
        Self {
            uart,
            state,
            out,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state.lock().unwrap().clone()
    }

    /// Device state that outlives the engine.
    pub fn shared_state(&self) -> Shared {
        Arc::clone(&self.state)
    }

    /// Pushes an unsolicited out-of-band message towards the host.
    pub async fn inject_oob(&self, payload: &[u8]) {
        self.out
            .lock()
            .await
            .write_all(&mux::encode_oob(payload))
            .await
            .unwrap();
    }
}

async fn device_loop(
    mut cfg: MockConfig,
    mut rx: DuplexStream,
    out: Arc<Mutex<DuplexStream>>,
    state: Shared,
) {
    loop {
        let Ok((code, payload)) = packet::recv(&mut rx).await else {
            return;
        };
        let Ok(command) = Command::try_from(code) else {
            continue;
        };
        log(&out, command).await;
        match command {
            Command::Sync => {
                state.lock().unwrap().syncs += 1;
                if let Some(answer) = answer_sync(&payload) {
                    reply(&out, code, &answer).await;
                }
            }
            Command::Ping => {
                let echo = if std::mem::take(&mut cfg.wrong_echo_once) {
                    Command::Identify
                } else {
                    Command::Ping
                };
                reply(&out, echo.code(), &[]).await;
            }
            Command::Identify => {
                reply(&out, code, &identity::encode_identify(&identity()).unwrap()).await;
            }
            Command::ListContainers => {
                let list = state.lock().unwrap().containers.clone();
                reply(&out, code, &upload::encode_containers(&list).unwrap()).await;
            }
            Command::Uninstall => {
                let name = String::from_utf8_lossy(&payload).into_owned();
                state.lock().unwrap().uninstalled.push(name);
                reply(&out, code, &[]).await;
            }
            Command::Firmware | Command::Install | Command::Run => {
                let (len, crc, name, defines) = parse_upload(command, &payload);
                reply(&out, code, &[]).await;
                let Some(data) = receive(&mut rx, &out, len, &cfg.acks).await else {
                    return;
                };
                let crc_ok = crc.is_none_or(|c| upload::crc32(&data) == c);
                state.lock().unwrap().uploads.push(Upload {
                    command,
                    name,
                    defines,
                    data,
                    crc_ok,
                });
            }
            Command::Ack => {}
        }
    }
}

fn parse_upload(
    command: Command,
    payload: &[u8],
) -> (usize, Option<u32>, Option<String>, Defines) {
    let len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    if command == Command::Firmware {
        return (len, None, None, Defines::new());
    }
    let crc = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    let mut rest = &payload[8..];
    let mut name = None;
    if command == Command::Install {
        let n = usize::from(u16::from_le_bytes([rest[0], rest[1]]));
        name = Some(String::from_utf8(rest[2..2 + n].to_vec()).unwrap());
        rest = &rest[2 + n..];
    }
    (len, Some(crc), name, upload::decode_defines(rest).unwrap())
}

async fn receive(
    rx: &mut DuplexStream,
    out: &Mutex<DuplexStream>,
    len: usize,
    acks: &AckMode,
) -> Option<Vec<u8>> {
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        let n = (len - data.len()).min(SERIAL_CHUNK_SIZE);
        let mut chunk = vec![0u8; n];
        rx.read_exact(&mut chunk).await.ok()?;
        data.extend_from_slice(&chunk);
        match acks {
            AckMode::Split(pattern) => {
                let mut left = n;
                for &piece in pattern.iter().cycle() {
                    if left == 0 {
                        break;
                    }
                    let count = left.min(usize::from(piece.max(1)));
                    send_oob(out, &ack_record(u16::try_from(count).unwrap())).await;
                    left -= count;
                }
            }
            AckMode::Raw(records) => {
                for record in records {
                    send_oob(out, record).await;
                }
                return None;
            }
        }
    }
    Some(data)
}

async fn log(out: &Mutex<DuplexStream>, command: Command) {
    let line = format!("I (42) device: handling {command:?}\n");
    out.lock().await.write_all(line.as_bytes()).await.unwrap();
}

async fn reply(out: &Mutex<DuplexStream>, code: u8, payload: &[u8]) {
    send_oob(out, &packet::encode(code, payload).unwrap()).await;
}

async fn send_oob(out: &Mutex<DuplexStream>, payload: &[u8]) {
    out.lock()
        .await
        .write_all(&mux::encode_oob(payload))
        .await
        .unwrap();
}
