use tokio::sync::mpsc;
use topicmesh_frame::DataEnvelope;
use topicmesh_peer::Peer;
use tracing::info;

use crate::cmd::{Context, SubscribeArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::print_data;

pub async fn run(args: SubscribeArgs, ctx: Context) -> CliResult<i32> {
    let config = args.peer.config(&args.name, ctx.registry)?;
    let peer = Peer::connect(config)
        .await
        .map_err(|err| peer_error("register failed", err))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<DataEnvelope>();
    let subscription = peer
        .subscribe(&args.topic, move |data: &DataEnvelope| {
            let _ = tx.send(data.clone());
        })
        .await
        .map_err(|err| peer_error("subscribe failed", err))?;

    let mut received = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            next = rx.recv() => match next {
                Some(data) => {
                    print_data(&data, ctx.format);
                    received += 1;
                    if args.count.is_some_and(|count| received >= count) {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    subscription.cancel();
    peer.close()
        .await
        .map_err(|err| peer_error("close failed", err))?;
    Ok(SUCCESS)
}
