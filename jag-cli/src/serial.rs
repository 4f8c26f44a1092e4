//! Serial commands: monitor, serve, ports.

use anyhow::{Context, Result};
use jag::device::UartDevice;
use jag::{Device, Session, proxy, serial};
use jag_proto::ChanReader;
use tokio::net::TcpListener;

/// Arguments for `jag monitor`.
#[derive(clap::Args)]
pub struct MonitorArgs {
    /// Serial port the device is attached to.
    #[arg(short = 'p', long)]
    pub port: String,

    /// Baud rate (defaults to the configured one).
    #[arg(short = 'b', long)]
    pub baud: Option<u32>,
}

/// Arguments for `jag serve`.
#[derive(clap::Args)]
pub struct ServeArgs {
    /// Serial port the device is attached to.
    #[arg(short = 'p', long)]
    pub port: String,

    /// HTTP port (defaults to the configured one; 0 picks a free port).
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Do not broadcast the proxy on the discovery port.
    #[arg(long)]
    pub no_announce: bool,

    /// Do not echo device logs.
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

pub async fn monitor(session: &Session, args: &MonitorArgs) -> Result<()> {
    let config = session.config();
    let baud = args.baud.unwrap_or(config.baud_rate);
    let mut serial = jag::open_serial(&args.port, baud, config.request_timeout())
        .await
        .with_context(|| format!("cannot open {}", args.port))?;
    eprintln!("monitoring {} at {baud} baud; Ctrl-C to stop", args.port);

    let mut stop = crate::interrupt();
    tokio::select! {
        res = echo(&mut serial.logs) => res?,
        () = stop.cancelled() => {}
    }
    serial.uart.close();
    Ok(())
}

pub async fn serve(session: &Session, args: &ServeArgs) -> Result<()> {
    let config = session.config();
    let timeout = config.request_timeout();
    let (device, mut logs) = UartDevice::attach(&args.port, config.baud_rate, timeout)
        .await
        .with_context(|| format!("cannot open serial device on {}", args.port))?;
    let port = args.http_port.unwrap_or(config.proxy_port);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    eprintln!(
        "serving {} on http://{}; Ctrl-C to stop",
        args.port,
        listener.local_addr()?
    );

    if args.quiet {
        drop(logs);
    } else {
        tokio::spawn(async move {
            if let Err(e) = echo(&mut logs).await {
                tracing::warn!(error = %e, "device log stream ended");
            }
        });
    }

    let announce = (!args.no_announce).then_some(config.discovery_port);
    proxy::serve(Device::UartProxy(device), listener, announce, crate::interrupt()).await?;
    Ok(())
}

pub fn ports() -> Result<()> {
    let ports = serial::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports.");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

async fn echo(logs: &mut ChanReader) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    tokio::io::copy(logs, &mut stdout).await?;
    Ok(())
}
