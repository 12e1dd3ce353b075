use std::time::Duration;

use buslink::{DeviceInitializer, RetryPolicy};
use buslink_backend::BackendContext;

use crate::cmd::{platform_backend, ProbeArgs};
use crate::exit::{claim_error, CliResult, SUCCESS};
use crate::output::{print_settings, OutputFormat};

pub async fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let ctx = BackendContext::new();
    let backend = platform_backend(ctx.clone())?;

    let retry = RetryPolicy {
        max_retries: args.retries,
        delay: Duration::from_millis(args.retry_delay),
    };
    let initializer = DeviceInitializer::new(backend, ctx, args.path.clone(), retry);
    let settings = initializer.initialize().await.map_err(claim_error)?;

    print_settings(&args.path, &settings, format);
    Ok(SUCCESS)
}
