//! CLI for pushing code to embedded devices.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod device;
mod serial;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use jag::{Cancel, Config, Session};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "jag",
    version,
    about = "Push code to embedded devices over network, BLE or serial"
)]
struct Cli {
    /// JSON config file (JAG_* variables still override it).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Also scan for BLE devices.
    #[arg(long, global = true)]
    ble: bool,

    /// Log debug output (JAG_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List devices announcing themselves nearby.
    Scan {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Check that a device answers.
    Ping(device::Target),

    /// Manage installed containers.
    #[command(subcommand)]
    Container(device::ContainerAction),

    /// Run a compiled image once.
    Run(device::RunArgs),

    /// Install a compiled image as a named container.
    Install(device::InstallArgs),

    /// Replace the device firmware.
    Firmware(device::FirmwareArgs),

    /// Print the log output of a serial device.
    Monitor(serial::MonitorArgs),

    /// Expose a serial device on the network.
    Serve(serial::ServeArgs),

    /// List serial ports.
    Ports,

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for list commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch().await {
        eprintln!("jag: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env("JAG_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    fn session(&self) -> Result<Session> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::from_env(),
        };
        config.use_ble |= self.ble;
        Ok(Session::new(config))
    }

    async fn dispatch(self) -> Result<()> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "jag", &mut std::io::stdout());
            return Ok(());
        }
        let session = self.session()?;
        match self.command {
            Command::Scan { format } => device::scan(&session, format).await,
            Command::Ping(target) => device::ping(&session, &target).await,
            Command::Container(action) => device::container(&session, action).await,
            Command::Run(args) => device::run(&session, args).await,
            Command::Install(args) => device::install(&session, args).await,
            Command::Firmware(args) => device::firmware(&session, args).await,
            Command::Monitor(args) => serial::monitor(&session, &args).await,
            Command::Serve(args) => serial::serve(&session, &args).await,
            Command::Ports => serial::ports(),
            Command::Completion { .. } => Ok(()),
        }
    }
}

/// Returns a signal that fires on Ctrl-C.
pub(crate) fn interrupt() -> Cancel {
    let (handle, signal) = jag::cancel::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        } else {
            // No signal handler; keep the handle so the signal never fires.
            std::future::pending::<()>().await;
        }
    });
    signal
}
