mod cmd;
mod exit;
mod logging;
mod output;

use std::net::SocketAddr;

use clap::Parser;

use crate::cmd::{Command, Context};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "topicmesh", version, about = "Topic publish/subscribe CLI")]
struct Cli {
    /// Registry address.
    #[arg(
        long,
        value_name = "ADDR",
        env = "TOPICMESH_REGISTRY",
        default_value = "127.0.0.1:11511",
        global = true
    )]
    registry: SocketAddr,

    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let ctx = Context {
        registry: cli.registry,
        format: cli.format.unwrap_or_else(OutputFormat::default_for_stdout),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            std::process::exit(exit::INTERNAL);
        }
    };

    match runtime.block_on(cmd::run(cli.command, ctx)) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
