use tokio_util::sync::CancellationToken;
use topicmesh_registry::{RegistryConfig, RegistryServer};
use tracing::info;

use crate::cmd::{parse_duration, RegistryArgs};
use crate::exit::{registry_error, CliResult, SUCCESS};

pub async fn run(args: RegistryArgs) -> CliResult<i32> {
    let heartbeat_timeout = args
        .heartbeat_timeout
        .as_deref()
        .map(parse_duration)
        .transpose()?;
    let config = RegistryConfig {
        listen_addr: args.listen,
        heartbeat_timeout,
        ..RegistryConfig::default()
    };

    let server = RegistryServer::bind(config.clone())
        .await
        .map_err(|err| registry_error("bind failed", err))?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping registry");
            trigger.cancel();
        }
    });

    let mut registry = config.registry();
    server
        .run(&mut registry, shutdown)
        .await
        .map_err(|err| registry_error("registry failed", err))?;
    Ok(SUCCESS)
}
