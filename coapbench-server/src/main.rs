use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use coapbench_common::config::DEFAULT_COAP_PORT;
use coapbench_server::{Behavior, Server, ServerConfig};

#[derive(Debug, Clone, ValueEnum)]
enum Mode {
    Echo,
    Silent,
    Code,
}

#[derive(Parser, Debug)]
#[command(name = "coapbench-server")]
struct Args {
    /// Address to listen on; defaults to 0.0.0.0 on the CoAP port.
    #[arg(long)]
    address: Option<SocketAddr>,

    /// How requests are answered.
    #[arg(long, value_enum, default_value = "echo")]
    mode: Mode,

    /// Raw response code for `--mode code`, e.g. 132 for 4.04.
    #[arg(long, default_value_t = 0x84)]
    code: u8,

    /// Replies with a wrong message id sent before every real reply.
    #[arg(long, default_value_t = 0)]
    stale: usize,

    /// Delay before answering (milliseconds).
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let address = args
        .address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_COAP_PORT)));

    let config = ServerConfig {
        behavior: match args.mode {
            Mode::Echo => Behavior::Echo,
            Mode::Silent => Behavior::Silent,
            Mode::Code => Behavior::Code(args.code),
        },
        stale_responses: args.stale,
        delay: Duration::from_millis(args.delay_ms),
        ..ServerConfig::new(address)
    };

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        if let Ok(addr) = ready_rx.await {
            println!("Listening on {}", addr);
        }
    });

    Server::new(config).run(ready_tx).await?;
    Ok(())
}
