use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use coapbench_common::config::{parse_series, BenchConfig, BindMode, Registration};
use coapbench_common::{BenchError, Method};
use coapbench_runner::sink::log_file_name;
use coapbench_runner::{ClientManager, LogFileSink, ManagerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coapbench", about = "CoAP load generator with closed-loop virtual clients")]
struct Args {
    /// Target URI, e.g. coap://localhost:5683/benchmark
    target: Option<String>,

    /// JSON file with a full BenchConfig; flags given on the command line override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Concurrency series, e.g. 1,10,50
    #[arg(short = 'c', long)]
    clients: Option<String>,

    /// Duration of every phase (seconds)
    #[arg(short = 't', long)]
    time: Option<u64>,

    /// Bind all clients to this local address
    #[arg(short = 'b', long, conflicts_with = "bind_multiple")]
    bind: Option<IpAddr>,

    /// Bind client i to this address plus i
    #[arg(short = 'd', long = "bind-multiple")]
    bind_multiple: Option<IpAddr>,

    /// Request method: GET, POST, PUT or DELETE
    #[arg(short = 'm', long)]
    method: Option<Method>,

    /// Text file holding the request payload
    #[arg(short = 'y', long)]
    payload: Option<PathBuf>,

    /// Register every client as <NAME><index> before sending updates
    #[arg(short = 'R', long = "register")]
    register: Option<String>,

    /// Registration lifetime (seconds)
    #[arg(long = "lt")]
    lifetime: Option<u64>,

    /// Record response latencies
    #[arg(long)]
    latency: bool,

    /// Receive timeout per request (milliseconds)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Name appended to the log file
    #[arg(long)]
    log: Option<String>,

    /// Echo records to stdout and log per-client results
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = build_config(&args).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        process::exit(3);
    });

    let log_path = log_file_name(args.log.as_deref());
    let sink = LogFileSink::create(&log_path, args.verbose).unwrap_or_else(|e| {
        eprintln!("Cannot open log file {log_path}: {e}");
        process::exit(3);
    });

    let exit_code = match run(&config, sink) {
        Ok(()) => 0,
        Err(e @ BenchError::ProtocolViolation { .. }) => {
            eprintln!("Aborted: {e}");
            2
        }
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn run(config: &BenchConfig, sink: LogFileSink) -> coapbench_common::Result<()> {
    let manager_config = ManagerConfig {
        bind: config.bind,
        method: config.effective_method(),
        payload: config.payload.as_ref().map(|p| p.as_bytes().to_vec()),
        track_latency: config.latency,
        registration_scheme: config.registration.as_ref().map(|_| config.target.clone()),
        receive_timeout: Duration::from_millis(config.receive_timeout_ms),
        ..ManagerConfig::new(config.pool_target())
    };
    if config.latency {
        tracing::info!("Measure latency: true");
    }

    let mut manager = ClientManager::new(manager_config, sink);
    manager.run_series(&config.series, Duration::from_secs(config.duration_secs))?;
    Ok(())
}

fn build_config(args: &Args) -> Result<BenchConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => BenchConfig::default(),
    };

    if let Some(target) = &args.target {
        config.target = target.clone();
    }
    if let Some(clients) = &args.clients {
        config.series = parse_series(clients)?;
    }
    if let Some(time) = args.time {
        config.duration_secs = time;
    }
    if let Some(ip) = args.bind {
        eprintln!("Bind clients to local address: {ip}");
        config.bind = BindMode::Shared(SocketAddr::new(ip, 0));
    }
    if let Some(ip) = args.bind_multiple {
        eprintln!("Bind clients to multiple IP addresses starting from: {ip}");
        config.bind = BindMode::Sequential(ip);
    }
    if let Some(method) = args.method {
        config.method = method;
    }
    if let Some(path) = &args.payload {
        config.payload = Some(read_payload(path)?);
    }
    if let Some(endpoint) = &args.register {
        config.registration = Some(Registration { endpoint: endpoint.clone(), lifetime_secs: args.lifetime });
    }
    if args.latency {
        config.latency = true;
    }
    if let Some(timeout) = args.timeout_ms {
        config.receive_timeout_ms = timeout;
    }

    config.validate()?;
    Ok(config)
}

/// Read a text payload, dropping line breaks.
fn read_payload(path: &Path) -> std::io::Result<String> {
    Ok(std::fs::read_to_string(path)?.lines().collect())
}
