use clap::Parser;
use log::{error, info};
use server::config::{
    ServerConfig, DEFAULT_HOST, DEFAULT_MAX_CONNECTIONS, DEFAULT_WORKERS,
};
use server::network::Server;
use server::utils::machine_id;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Address to bind to
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Number of worker threads and acceptor loops
    #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Maximum number of concurrent connections
    #[arg(short, long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Seconds between heartbeat rounds
    #[arg(short = 'i', long, default_value = "30")]
    heartbeat_interval: u64,
}

/// Parses arguments, builds the worker pool and serves until Ctrl+C.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let started = Instant::now();

    info!("Your Machine ID is {}", machine_id());

    let config = ServerConfig {
        host: args.host,
        workers: args.workers.max(1),
        max_connections: args.max_connections,
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval.max(1)),
        ..ServerConfig::new(args.port)
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()?;

    let result = runtime.block_on(async move {
        let server = Server::bind(config).await?;

        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    shutdown.trigger();
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });

        server.run().await
    });

    info!(
        "Process ran for {} second(s).",
        started.elapsed().as_secs()
    );
    info!("Exiting: now");

    result.map_err(Into::into)
}
