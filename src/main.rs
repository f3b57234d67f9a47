//! tick-relay: a closed-loop network benchmark
//!
//! Two roles in one binary:
//! - `serve`: a timestamp producer that streams records over chunked HTTP,
//!   paced by acknowledgments returned on a separate channel
//! - `bench`: a client that relays every record back through one of four
//!   pump variants and reports the producer's cycle statistics
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod error;
mod orchestrator;
mod parser;
mod producer;
mod protocol;
mod pump;
mod server;
mod session;

use config::{BenchConfig, Config, Mode, ProducerConfig, ServerConfig};
use orchestrator::BenchmarkOrchestrator;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.mode {
        Mode::Serve(server, producer) => run_server(server, producer),
        Mode::Bench(bench) => run_bench(bench),
    }
}

/// Run the producer server on a multi-threaded runtime.
fn run_server(
    server: ServerConfig,
    producer: ProducerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %server.listen,
        channel_listen = server.channel_listen.as_deref().unwrap_or("auto"),
        cycle_duration_ms = producer.cycle_duration_ms,
        cycles = producer.cycles,
        throttle = producer.throttle,
        "Starting tick-relay producer"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let server = Server::bind(server, producer).await?;
        server.run().await
    })?;
    Ok(())
}

/// Run every configured pump against the target, one after another.
fn run_bench(bench: BenchConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        target = %bench.target,
        pumps = bench.pumps.len(),
        cycle_duration_ms = bench.cycle_duration_ms,
        cycles = bench.cycles,
        throttle = bench.throttle,
        "Starting tick-relay benchmark"
    );

    // Pumps interleave with the parser's fetch task on one thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(BenchmarkOrchestrator::new(bench).run())?;

    info!(runs = report.entries.len(), "Benchmark finished");
    print!("{}", report.render());
    Ok(())
}
