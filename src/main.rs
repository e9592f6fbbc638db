//! parley-ls: language server session engine
//!
//! Serves one editor session over stdio or TCP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args as ClapArgs, Parser};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use parley_ls::config::{self, Config, FramingMode};
use parley_ls::rpc::transport::Channel;
use parley_ls::server::Server;

/// Language server session engine.
///
/// Speaks JSON-RPC over stdio or TCP and publishes debounced diagnostics
/// for open documents.
#[derive(Parser, Debug)]
#[command(name = "parley-ls")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    channel: ChannelArgs,

    /// Use 4-byte length-prefixed framing instead of Content-Length headers
    #[arg(long)]
    length_prefixed: bool,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Channel selection; overrides `transport.mode` from the config file.
#[derive(ClapArgs, Debug)]
#[group(multiple = false)]
struct ChannelArgs {
    /// Communicate over stdin/stdout
    #[arg(long)]
    stdio: bool,

    /// Listen on HOST:PORT and serve the first connection
    #[arg(long, value_name = "HOST:PORT")]
    tcp_listen: Option<SocketAddr>,

    /// Connect to a client listening on HOST:PORT
    #[arg(long, value_name = "HOST:PORT")]
    tcp_connect: Option<SocketAddr>,
}

impl ChannelArgs {
    fn resolve(&self, config: &Config) -> Channel {
        if self.stdio {
            Channel::Stdio
        } else if let Some(addr) = self.tcp_listen {
            Channel::TcpListen(addr)
        } else if let Some(addr) = self.tcp_connect {
            Channel::TcpConnect(addr)
        } else {
            config.transport.channel()
        }
    }
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber. Logs go to stderr; stdout may carry
/// the protocol.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.as_deref();
    let mut cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if args.length_prefixed {
        cfg.transport.framing = FramingMode::LengthPrefixed;
    }

    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    let channel = args.channel.resolve(&cfg);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        channel = ?channel,
        framing = ?cfg.transport.framing,
        "Starting parley-ls"
    );

    let server = match Server::from_config(&cfg) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to register parts");
            return ExitCode::FAILURE;
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    let result = runtime.block_on(async {
        let (reader, writer) = channel.open().await?;
        server.run(reader, writer).await
    });

    match result {
        Ok(status) => {
            info!(status = ?status, "Server stopped");
            ExitCode::from(status.code())
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::from(parley_ls::rpc::router::ExitStatus::TransportFailure.code())
        }
    }
}
