use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use shmcast::control::{Client, ClientConfig};
use shmcast::server::{RuntimePaths, Server, ServerConfig, ServerParts};
use shmcast::{Error, QuantaClock, STREAM_COUNT};

#[derive(Parser)]
#[command(name = "shmcast", version, about = "Shared-memory frame broadcast")]
struct Cli {
    #[command(subcommand)]
    role: Role,
    /// Log every frame written and read.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,
    /// Runtime directory holding the segment and the control socket.
    #[arg(long = "dir", global = true)]
    dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Role {
    /// Run the producer until a client asks it to stop.
    Server(ServerArgs),
    /// Benchmark round trips, then stream frames and report latency.
    Client(ClientArgs),
}

#[derive(Args)]
struct ServerArgs {
    #[arg(long = "tick-ms", default_value_t = 1000)]
    tick_ms: u64,
    #[arg(long = "scan-ms", default_value_t = 1000)]
    scan_ms: u64,
    /// Pin the producer thread to this core.
    #[arg(long = "core")]
    core: Option<usize>,
    #[arg(long = "memlock")]
    memlock: bool,
    /// Timestamp frames with the TSC instead of the monotonic clock.
    #[arg(long = "tsc-clock")]
    tsc_clock: bool,
}

#[derive(Args)]
struct ClientArgs {
    /// Ask the server to exit once the run is over.
    #[arg(long = "shutdown")]
    shutdown: bool,
    #[arg(long = "calls", default_value_t = 1000)]
    calls: u32,
    #[arg(long = "wakes", default_value_t = 27)]
    wakes: usize,
    #[arg(long = "timeout-ms", default_value_t = 3000)]
    timeout_ms: u64,
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let paths = cli
        .dir
        .map(RuntimePaths::new)
        .unwrap_or_default();
    let result = match cli.role {
        Role::Server(args) => run_server(paths, args),
        Role::Client(args) => run_client(paths, args),
    };
    if let Err(err) = result {
        if let Some(Error::WaitTimeout(_)) = err.downcast_ref::<Error>() {
            eprintln!("TIMEOUT: {err}");
        } else {
            eprintln!("error: {err:#}");
        }
        std::process::exit(1);
    }
}

fn run_server(paths: RuntimePaths, args: ServerArgs) -> Result<()> {
    let config = ServerConfig {
        paths,
        tick: Duration::from_millis(args.tick_ms),
        scan_interval: Duration::from_millis(args.scan_ms),
        producer_core: args.core,
        memlock: args.memlock,
        ..ServerConfig::default()
    };
    let mut parts = ServerParts::default();
    if args.tsc_clock {
        parts.clock = Arc::new(QuantaClock::new());
    }
    let mut server = Server::start_with(config, parts).context("starting server")?;
    server.listen().context("binding control socket")?;

    let latch = Arc::clone(server.latch());
    ctrlc::set_handler(move || {
        log::info!("received termination signal");
        latch.trigger();
    })
    .context("installing signal handler")?;

    server.latch().wait(None)?;
    log::info!("shutting down");
    server.shutdown()?;
    Ok(())
}

fn run_client(paths: RuntimePaths, args: ClientArgs) -> Result<()> {
    let config = ClientConfig {
        paths,
        wait_timeout: Duration::from_millis(args.timeout_ms),
        ..ClientConfig::default()
    };
    let mut client = Client::connect(&config).context("connecting")?;
    if client.is_local() {
        println!("no server running; started one in this process");
    }

    if args.calls > 0 {
        let elapsed = client.roundtrip(args.calls)?;
        println!(
            "{} round trips in {:.3}ms ({:.3}us/call)",
            args.calls,
            elapsed.as_secs_f64() * 1e3,
            elapsed.as_secs_f64() * 1e6 / args.calls as f64
        );
    }

    let report = client.stream(args.wakes, config.wait_timeout)?;
    println!(
        "{} wakes, {} frames, max latency {:.3}us",
        report.wakes,
        report.observations,
        report.max_latency_us()
    );
    for stream in 0..STREAM_COUNT {
        let stats = &report.stats[stream];
        println!(
            "  stream[{stream}] frames={} torn={} startup={} max={:.3}us p50={}us p99={}us",
            stats.observed,
            stats.torn,
            stats.noise,
            stats.max_latency_us(),
            stats.quantile_us(0.5),
            stats.quantile_us(0.99)
        );
    }
    if args.shutdown {
        client.shutdown_server().context("requesting shutdown")?;
        println!("server shutdown requested");
    } else {
        client.disconnect()?;
    }
    Ok(())
}
