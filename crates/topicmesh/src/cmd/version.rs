use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("topicmesh {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: topicmesh");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "build_target: {}",
        option_env!("TOPICMESH_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "build_profile: {}",
        option_env!("TOPICMESH_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!("registry_port: {}", topicmesh_frame::DEFAULT_REGISTRY_PORT);
    println!(
        "max_payload_bytes: {}",
        topicmesh_frame::DEFAULT_MAX_PAYLOAD
    );

    Ok(SUCCESS)
}
