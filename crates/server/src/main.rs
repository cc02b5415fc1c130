//! pixelbridge server binary
//!
//! Wires the pieces together: configuration, logging, the USB worker
//! thread, the OPC listener, and the core dispatch loop.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use common::{create_usb_bridge, setup_logging, UsbCommand};
use server::config::Config;
use server::core::ServerCore;
use server::mapping::Mapping;
use server::network::Listener;
use server::usb::spawn_usb_worker;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pixelbridge")]
#[command(
    author,
    version,
    about = "Open Pixel Control server for Fadecandy and Enttec DMX hardware"
)]
struct Args {
    /// Path to the JSON configuration file (built-in defaults apply
    /// without one)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); overrides --verbose
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configuration problems are fatal here, before anything starts.
    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    let default_level = if args.verbose || config.verbose {
        "debug"
    } else {
        "info"
    };
    let log_level = args.log_level.as_deref().unwrap_or(default_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("pixelbridge v{}", env!("CARGO_PKG_VERSION"));

    let mapping = Mapping::compile(&config);
    if mapping.is_empty() {
        info!("no device bindings configured; devices will attach idle");
    }

    // Bind before spawning anything; a taken port is a startup failure.
    let listener = Listener::bind(&config.listen_addr()).await?;

    let (usb_bridge, usb_worker) = create_usb_bridge();
    let usb_handle = spawn_usb_worker(usb_worker);

    let (net_tx, net_rx) = mpsc::channel(1024);
    tokio::spawn(listener.run(net_tx));

    let mut core = ServerCore::new(&config, mapping, usb_bridge.clone(), args.config.clone());
    let core_task = tokio::spawn(async move {
        if let Err(e) = core.run(net_rx).await {
            error!("server core error: {:#}", e);
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c, shutting down"),
        Err(e) => error!("error waiting for ctrl-c: {}", e),
    }

    core_task.abort();

    if let Err(e) = usb_bridge.send_command(UsbCommand::Shutdown).await {
        error!("error shutting down USB worker: {}", e);
    }
    if let Err(e) = usb_handle.join() {
        error!("USB worker thread panicked: {:?}", e);
    }

    Ok(())
}
