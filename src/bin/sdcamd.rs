//! sdcamd - SD camera board daemon
//!
//! This daemon:
//! 1. Loads configuration (SDCAM_CONFIG, SDCAM_* overrides)
//! 2. Connects the camera and brings up the card transport
//! 3. Serves stream, capture and file endpoints from a single worker
//!
//! A card that is missing at startup is not fatal; every request retries.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use sdcam::{
    api::{ApiConfig, ApiServer},
    Device, SdcamConfig,
};

#[derive(Parser, Debug)]
#[command(name = "sdcamd", about = "SD camera board HTTP daemon")]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "SDCAM_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address; overrides the configuration file.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = SdcamConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let mut device = Device::from_config(&config)?;
    let capture = device.capture.config();
    let stream = device.streamer.config();
    log::info!(
        "captures saved to {} as {}_<millis>.jpg; stream chunk {} bytes every {:?}",
        capture.directory,
        capture.prefix,
        stream.chunk_size,
        stream.frame_interval
    );
    if device.transport.initialize() {
        if let Some(mode) = device.transport.active_mode() {
            log::info!(
                "card mounted in {} mode ({})",
                mode,
                device.transport.pin_summary(mode)
            );
        }
    } else {
        log::warn!("no card available at startup; requests will retry");
    }

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, device).spawn()?;
    log::info!("sdcamd running. http api on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping http api...");
    api_handle.stop()?;

    Ok(())
}
