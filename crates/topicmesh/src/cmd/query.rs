use topicmesh_peer::RegistryClient;
use topicmesh_transport::RetryPolicy;

use crate::cmd::{parse_duration, Context, QueryArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_peers, print_topics};

pub async fn peers(args: QueryArgs, ctx: Context) -> CliResult<i32> {
    let mut client = connect(&args, ctx).await?;
    let peers = client
        .list_peers()
        .await
        .map_err(|err| peer_error("list peers failed", err))?;
    client.close().await;
    print_peers(&peers, ctx.format);
    Ok(SUCCESS)
}

pub async fn topics(args: QueryArgs, ctx: Context) -> CliResult<i32> {
    let mut client = connect(&args, ctx).await?;
    let topics = client
        .list_topics()
        .await
        .map_err(|err| peer_error("list topics failed", err))?;
    client.close().await;
    print_topics(&topics, ctx.format);
    Ok(SUCCESS)
}

async fn connect(args: &QueryArgs, ctx: Context) -> CliResult<RegistryClient> {
    let timeout = parse_duration(&args.timeout)?;
    RegistryClient::connect(ctx.registry, RetryPolicy::none(), timeout)
        .await
        .map_err(|err| peer_error(&format!("connect to {} failed", ctx.registry), err))
}
