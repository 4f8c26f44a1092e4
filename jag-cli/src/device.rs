//! Device commands: scan, ping, container, run, install, firmware.

use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use jag::device::UartDevice;
use jag::discovery::{self, Picker};
use jag::{CodeKind, Device, DeviceIdentity, PushOptions, Session};
use jag_proto::{DefineValue, Defines};

use crate::OutputFormat;

/// Which device to talk to.
#[derive(clap::Args)]
pub struct Target {
    /// Device id, name or address.
    #[arg(short = 'd', long)]
    pub device: Option<String>,

    /// Serial port of a cabled device (skips discovery).
    #[arg(short = 'p', long, conflicts_with = "device")]
    pub port: Option<String>,
}

/// Subcommands for `jag container`.
#[derive(clap::Subcommand)]
pub enum ContainerAction {
    /// List installed containers.
    #[command(visible_alias = "ls")]
    List {
        #[command(flatten)]
        target: Target,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// Remove an installed container.
    #[command(visible_alias = "rm")]
    Uninstall {
        #[command(flatten)]
        target: Target,
        /// Container name.
        name: String,
    },
}

/// Options shared by `run` and `install`.
#[derive(clap::Args)]
pub struct PushArgs {
    #[command(flatten)]
    pub target: Target,

    /// SDK version the image was built with (checked against the device).
    #[arg(long)]
    pub sdk_version: Option<String>,

    /// Define passed to the program (`key=value`).
    #[arg(short = 'D', long = "define")]
    pub defines: Vec<String>,

    /// Compiled image.
    pub image: String,
}

/// Arguments for `jag run`.
#[derive(clap::Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub push: PushArgs,

    /// Stop the program after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Arguments for `jag install`.
#[derive(clap::Args)]
pub struct InstallArgs {
    /// Container name.
    pub name: String,

    #[command(flatten)]
    pub push: PushArgs,

    /// Install without starting at boot.
    #[arg(long)]
    pub disabled: bool,

    /// Stop the container after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Arguments for `jag firmware`.
#[derive(clap::Args)]
pub struct FirmwareArgs {
    #[command(flatten)]
    pub target: Target,

    /// Chip the firmware was built for (checked against the device).
    #[arg(long)]
    pub chip: Option<String>,

    /// Firmware image.
    pub image: String,
}

/// Numbered prompt on stderr, answer read from stdin.
struct StdinPicker;

impl Picker for StdinPicker {
    fn pick(&mut self, devices: &[DeviceIdentity]) -> Option<usize> {
        let mut err = std::io::stderr().lock();
        for (i, d) in devices.iter().enumerate() {
            let _ = writeln!(err, "  {}) {} [{}] {}", i + 1, d.name, d.transport, d.address);
        }
        let _ = write!(err, "Choose a device [1-{}]: ", devices.len());
        let _ = err.flush();

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).ok()?;
        let choice: usize = line.trim().parse().ok()?;
        choice.checked_sub(1).filter(|i| *i < devices.len())
    }
}

async fn open(session: &Session, target: &Target) -> Result<Device> {
    let config = session.config();
    if let Some(path) = &target.port {
        let (device, logs) = UartDevice::attach(path, config.baud_rate, config.request_timeout())
            .await
            .with_context(|| format!("cannot open serial device on {path}"))?;
        drop(logs);
        return Ok(Device::UartProxy(device));
    }
    let cancel = crate::interrupt();
    let identity = discovery::discover(
        session,
        target.device.as_deref(),
        target.device.is_some(),
        &mut StdinPicker,
        &cancel,
    )
    .await?;
    Ok(Device::open(identity, session).await?)
}

pub async fn scan(session: &Session, format: OutputFormat) -> Result<()> {
    let devices = discovery::scan(session, &crate::interrupt()).await?;
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No devices.");
        return Ok(());
    }
    println!("{:<20} {:<10} {:<12} {:<36} ADDRESS", "NAME", "TRANSPORT", "SDK", "ID");
    for d in &devices {
        let transport = if d.proxied {
            format!("{} (proxy)", d.transport)
        } else {
            d.transport.to_string()
        };
        println!(
            "{:<20} {:<10} {:<12} {:<36} {}",
            d.name, transport, d.sdk_version, d.id, d.address
        );
    }
    Ok(())
}

pub async fn ping(session: &Session, target: &Target) -> Result<()> {
    let device = open(session, target).await?;
    let name = device.identity().name.clone();
    let alive = device.ping().await;
    device.close().await;
    if !alive {
        bail!("{name} did not answer; rescan to refresh its address");
    }
    println!("{name} is alive");
    Ok(())
}

pub async fn container(session: &Session, action: ContainerAction) -> Result<()> {
    match action {
        ContainerAction::List { target, format } => {
            let device = open(session, &target).await?;
            let list = device.container_list().await;
            device.close().await;
            let list = list?;
            if matches!(format, OutputFormat::Json) {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if list.is_empty() {
                println!("No containers.");
            } else {
                println!("{:<36} NAME", "ID");
                for (id, name) in &list {
                    println!("{id:<36} {name}");
                }
            }
        }
        ContainerAction::Uninstall { target, name } => {
            let device = open(session, &target).await?;
            let res = device.container_uninstall(&name).await;
            device.close().await;
            res?;
            println!("{name}");
        }
    }
    Ok(())
}

pub async fn run(session: &Session, args: RunArgs) -> Result<()> {
    let timeout = args.timeout.map(Duration::from_secs);
    push(session, CodeKind::Run, args.push, None, false, timeout).await
}

pub async fn install(session: &Session, args: InstallArgs) -> Result<()> {
    let timeout = args.timeout.map(Duration::from_secs);
    push(session, CodeKind::Install, args.push, Some(args.name), args.disabled, timeout).await
}

async fn push(
    session: &Session,
    kind: CodeKind,
    args: PushArgs,
    name: Option<String>,
    disabled: bool,
    timeout: Option<Duration>,
) -> Result<()> {
    let image = std::fs::read(&args.image).with_context(|| format!("cannot read {}", args.image))?;
    let defines = parse_defines(&args.defines)?;
    let device = open(session, &args.target).await?;
    let options = PushOptions {
        sdk_version: args
            .sdk_version
            .unwrap_or_else(|| device.identity().sdk_version.clone()),
        name,
        disabled,
        timeout,
        defines,
    };
    let res = device.send_code(kind, &image, &options).await;
    let target = device.identity().name.clone();
    device.close().await;
    res?;
    eprintln!("{} bytes sent to {target}", image.len());
    Ok(())
}

pub async fn firmware(session: &Session, args: FirmwareArgs) -> Result<()> {
    let image = std::fs::read(&args.image).with_context(|| format!("cannot read {}", args.image))?;
    let device = open(session, &args.target).await?;
    if let Some(chip) = &args.chip {
        device.identity().check_chip(chip)?;
    }
    let res = device.update_firmware(&image).await;
    let target = device.identity().name.clone();
    device.close().await;
    res?;
    eprintln!("firmware updated on {target}; the device restarts now");
    Ok(())
}

fn parse_defines(raw: &[String]) -> Result<Defines> {
    let mut defines = Defines::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("define '{entry}' is not key=value"))?;
        let value = match value {
            "true" => DefineValue::Bool(true),
            "false" => DefineValue::Bool(false),
            v => v
                .parse()
                .map_or_else(|_| DefineValue::Text(v.to_owned()), DefineValue::Int),
        };
        defines.insert(key.to_owned(), value);
    }
    Ok(defines)
}
