use chanmux_frame::{DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
use chanmux_transport::DEFAULT_PIPE_CAPACITY;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("chanmux {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: chanmux");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("frame_header_bytes: {HEADER_SIZE}");
    println!("default_max_frame: {DEFAULT_MAX_PAYLOAD}");
    println!("default_pipe_capacity: {DEFAULT_PIPE_CAPACITY}");

    Ok(SUCCESS)
}
