use std::sync::Arc;

use buslink_backend::{BackendContext, DeviceBackend};
use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod devices;
pub mod probe;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enumerate candidate devices and show their initialization status.
    Devices(DevicesArgs),
    /// Initialize one device and print its resolved settings.
    Probe(ProbeArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Devices(args) => devices::run(args, format).await,
        Command::Probe(args) => probe::run(args, format).await,
    }
}

#[derive(Args, Debug)]
pub struct DevicesArgs {}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Device path, as printed by `buslink devices` (e.g. usb:003/011).
    pub path: String,
    /// Busy-retry attempts before giving up.
    #[arg(long, default_value = "20")]
    pub retries: u32,
    /// Delay between busy retries, in milliseconds.
    #[arg(long, value_name = "MS", default_value = "100")]
    pub retry_delay: u64,
}

/// The platform backend for this host.
pub fn platform_backend(ctx: Arc<BackendContext>) -> CliResult<Arc<dyn DeviceBackend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(buslink_backend::UsbBackend::new(ctx)))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = ctx;
        Err(crate::exit::CliError::new(
            crate::exit::DEVICE_ERROR,
            "no device backend for this platform",
        ))
    }
}
