use anyhow::Result;
use clap::Parser;

use solarman_proxy::ProxyConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// TCP multiplexing proxy for SolarmanV5 data-loggers.
#[derive(Parser)]
#[command(name = "solarman-proxy")]
#[command(version = VERSION)]
#[command(about = "Multiplex SolarmanV5 data-logger connections across multiple clients")]
struct Cli {
    /// Verbose tracing on.
    #[arg(long)]
    debug: bool,

    /// Suppress all logging.
    #[arg(long)]
    silent: bool,

    /// Enable the UDP discovery responder on 48899.
    #[arg(long)]
    bcast: bool,

    /// Enable the per-logger write FIFO (serialise concurrent client requests).
    #[arg(long)]
    buffered: bool,

    /// Bind address for the loggers listener (also reported in discovery replies).
    host: String,

    /// TCP port the loggers listener binds to.
    loggers_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    log::info!(
        "solarman-proxy v{VERSION} starting: loggers={}:{}, clients=0.0.0.0:{}, bcast={}, buffered={}",
        cli.host,
        cli.loggers_port,
        solarman_proxy::CLIENTS_PORT,
        cli.bcast,
        cli.buffered,
    );

    let config = ProxyConfig {
        host: cli.host,
        loggers_port: cli.loggers_port,
        buffered: cli.buffered,
        bcast: cli.bcast,
    };

    if let Err(e) = solarman_proxy::run(config).await {
        log::error!("fatal: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.silent {
        "off"
    } else if cli.debug {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}
