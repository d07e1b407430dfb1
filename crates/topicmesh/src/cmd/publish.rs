use topicmesh_peer::Peer;
use tracing::info;

use crate::cmd::{parse_duration, Context, PublishArgs};
use crate::exit::{peer_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::print_published;

pub async fn run(args: PublishArgs, ctx: Context) -> CliResult<i32> {
    let payload: serde_json::Value = serde_json::from_str(&args.json)
        .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
    let interval = parse_duration(&args.interval)?;
    let config = args.peer.config(&args.name, ctx.registry)?;

    let peer = Peer::connect(config)
        .await
        .map_err(|err| peer_error("register failed", err))?;
    peer.advertise(&args.topic)
        .await
        .map_err(|err| peer_error("advertise failed", err))?;

    let mut seq = 0u64;
    loop {
        seq += 1;
        let delivered = peer
            .publish(&args.topic, payload.clone())
            .await
            .map_err(|err| peer_error("publish failed", err))?;
        print_published(&args.topic, seq, delivered, ctx.format);

        if args.count.is_some_and(|count| seq >= count) {
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    peer.close()
        .await
        .map_err(|err| peer_error("close failed", err))?;
    Ok(SUCCESS)
}
