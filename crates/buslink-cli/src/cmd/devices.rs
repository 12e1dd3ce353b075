use buslink::{ClaimConfig, DeviceManager};
use buslink_backend::BackendContext;

use crate::cmd::{platform_backend, DevicesArgs};
use crate::exit::{claim_error, CliResult, SUCCESS};
use crate::output::{print_devices, OutputFormat};

pub async fn run(_args: DevicesArgs, format: OutputFormat) -> CliResult<i32> {
    let ctx = BackendContext::new();
    let backend = platform_backend(ctx.clone())?;
    let manager = DeviceManager::new(backend, ctx, ClaimConfig::default());

    manager.update_devices().await.map_err(claim_error)?;
    print_devices(&manager.devices(), format);

    Ok(SUCCESS)
}
