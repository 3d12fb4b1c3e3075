//! STOMP broker binary.
//!
//! # Usage
//!
//! ```bash
//! # Reactor transport on port 7777
//! stompd 7777 reactor
//!
//! # Thread per client, auditing to a local SQL service
//! stompd 7777 tpc --audit-addr 127.0.0.1:7778
//! ```

use std::net::{Ipv4Addr, SocketAddr};

use clap::{Parser, ValueEnum};
use stompd_server::{Server, ServerConfig, TransportMode};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// STOMP 1.2 message broker
#[derive(Parser, Debug)]
#[command(name = "stompd")]
#[command(about = "STOMP 1.2 message broker")]
#[command(version)]
struct Args {
    /// TCP port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Connection handling model
    #[arg(value_enum)]
    mode: Mode,

    /// Worker pool threads for the reactor (defaults to available cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Address of the SQL audit service
    #[arg(long)]
    audit_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// One thread per client
    Tpc,
    /// Readiness loop plus worker pool
    Reactor,
}

impl From<Mode> for TransportMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Tpc => Self::ThreadPerClient,
            Mode::Reactor => Self::Reactor,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(port = args.port, mode = ?args.mode, "stompd starting");

    let mut config = ServerConfig::new()
        .with_bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)))
        .with_transport(args.mode.into());
    if let Some(threads) = args.threads {
        config = config.with_worker_threads(threads);
    }
    if let Some(addr) = args.audit_addr {
        config = config.with_audit_addr(addr);
    }

    let server = Server::bind(config)?;

    tracing::info!("Server listening on {}", server.local_addr());

    server.run()?;

    Ok(())
}
