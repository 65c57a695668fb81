//! sdcam_info - one-shot card report
//!
//! Brings up the card transport with the daemon's configuration, prints the
//! active mode, pins and capacity, then lists the root directory.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use sdcam::{Device, SdcamConfig};

#[derive(Parser, Debug)]
#[command(name = "sdcam_info", about = "Report SD card status and root listing")]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "SDCAM_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to list.
    #[arg(long, default_value = "/")]
    path: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let config = SdcamConfig::load_from(args.config.as_deref())?;
    let mut device = Device::from_config(&config)?;

    if !device.transport.initialize() {
        return Err(anyhow!("card initialization failed in both MMC and SPI mode"));
    }
    let mode = device
        .transport
        .active_mode()
        .ok_or_else(|| anyhow!("card initialized without an active mode"))?;

    println!("Mode: {}", mode);
    println!("Pins: {}", device.transport.pin_summary(mode));
    if let Some(card) = device.transport.card_info() {
        println!("Card Type: {:?}", card.card_type);
        println!("Card Size: {} MB", card.total_mb());
        println!("Used: {} MB", card.used_mb());
    }

    let listing = device.files.list(&mut device.transport, &args.path)?;
    println!("\n{} ({} entries)", listing.path, listing.count);
    for file in &listing.files {
        if file.is_dir {
            println!("  DIR   {}/", file.name);
        } else {
            println!("  FILE  {} ({} bytes)", file.name, file.size);
        }
    }
    Ok(())
}
