use chanmux_remote::Executor;
use chanmux_transport::DuplexStream;
use tracing::info;

use crate::cmd::{Context, ServeArgs};
use crate::exit::{remote_error, CliResult, SUCCESS};

pub fn run(_args: ServeArgs, ctx: &Context) -> CliResult<i32> {
    info!("serving on stdio");
    Executor::serve(DuplexStream::stdio(), ctx.config.clone())
        .map_err(|err| remote_error("executor failed", err))?;
    Ok(SUCCESS)
}
