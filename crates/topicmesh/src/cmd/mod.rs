use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Subcommand};
use topicmesh_peer::PeerConfig;
use topicmesh_transport::RetryPolicy;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod publish;
pub mod query;
pub mod registry;
pub mod subscribe;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the registry until interrupted.
    Registry(RegistryArgs),
    /// Register a peer and publish a JSON payload periodically.
    Publish(PublishArgs),
    /// Register a peer and print data received on a topic.
    Subscribe(SubscribeArgs),
    /// List peers known to the registry.
    Peers(QueryArgs),
    /// List topics known to the registry.
    Topics(QueryArgs),
    /// Show version information.
    Version(VersionArgs),
}

/// Global options shared by every subcommand.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub registry: SocketAddr,
    pub format: OutputFormat,
}

pub async fn run(command: Command, ctx: Context) -> CliResult<i32> {
    match command {
        Command::Registry(args) => registry::run(args).await,
        Command::Publish(args) => publish::run(args, ctx).await,
        Command::Subscribe(args) => subscribe::run(args, ctx).await,
        Command::Peers(args) => query::peers(args, ctx).await,
        Command::Topics(args) => query::topics(args, ctx).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RegistryArgs {
    /// Address to listen on.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:11511")]
    pub listen: SocketAddr,
    /// Expire peers that stay silent this long (e.g. 30s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub heartbeat_timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct PeerOptions {
    /// Address to accept subscriber links on.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:0")]
    pub listen: SocketAddr,
    /// Send heartbeats to the registry at this interval (e.g. 2s).
    #[arg(long, value_name = "DURATION")]
    pub heartbeat: Option<String>,
    /// Reconnect attempts before a link is declared lost.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
    /// How long to wait for the registry to acknowledge (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

impl PeerOptions {
    pub fn config(&self, name: &str, registry: SocketAddr) -> CliResult<PeerConfig> {
        let heartbeat = self.heartbeat.as_deref().map(parse_duration).transpose()?;
        let retry = RetryPolicy {
            max_retries: self.retries,
            ..RetryPolicy::default()
        };
        Ok(PeerConfig::new(name)
            .with_registry(registry)
            .with_listen_addr(self.listen)
            .with_retry(retry)
            .with_heartbeat(heartbeat)
            .with_registration_timeout(parse_duration(&self.timeout)?))
    }
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Peer name to register as.
    pub name: String,
    /// Topic to publish on.
    #[arg(long, short = 't')]
    pub topic: String,
    /// JSON payload.
    #[arg(long)]
    pub json: String,
    /// Delay between messages (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s")]
    pub interval: String,
    /// Exit after publishing N messages.
    #[arg(long)]
    pub count: Option<u64>,
    #[command(flatten)]
    pub peer: PeerOptions,
}

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Peer name to register as.
    pub name: String,
    /// Topic to subscribe to.
    #[arg(long, short = 't')]
    pub topic: String,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    #[command(flatten)]
    pub peer: PeerOptions,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Reply timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert_eq!(parse_duration("0s").unwrap_err().code, USAGE);
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5m").is_err());
    }

    #[test]
    fn peer_options_build_config() {
        let options = PeerOptions {
            listen: "127.0.0.1:7000".parse().unwrap(),
            heartbeat: Some("250ms".into()),
            retries: 1,
            timeout: "2s".into(),
        };
        let registry = "127.0.0.1:11511".parse().unwrap();
        let config = options.config("cam", registry).unwrap();
        assert_eq!(config.name, "cam");
        assert_eq!(config.listen_addr.port(), 7000);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_millis(250)));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.registration_timeout, Duration::from_secs(2));
    }
}
