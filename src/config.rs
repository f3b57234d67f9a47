//! Configuration module for tick-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::pump::PumpKind;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tick-relay")]
#[command(author = "tick-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "Closed-loop latency benchmark over chunked HTTP streams", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the record producer (HTTP stream + acknowledgment channel)
    Serve(ServeArgs),
    /// Run every configured pump against a producer and report results
    Bench(BenchArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address for the HTTP listener (e.g., 127.0.0.1:5000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Address for the acknowledgment channel listener
    #[arg(long)]
    pub channel_listen: Option<String>,

    /// Default cycle duration in milliseconds
    #[arg(short = 't', long)]
    pub cycle_duration_ms: Option<u64>,

    /// Default number of measurement cycles
    #[arg(short = 'n', long)]
    pub cycles: Option<u32>,

    /// Default in-flight credit
    #[arg(long)]
    pub throttle: Option<u32>,
}

#[derive(Args, Debug, Default)]
pub struct BenchArgs {
    /// HTTP address of the producer
    #[arg(long)]
    pub target: Option<String>,

    /// Pumps to run, in order
    #[arg(short, long, value_enum, value_delimiter = ',')]
    pub pumps: Vec<PumpKind>,

    /// Cycle duration requested from the producer, in milliseconds
    #[arg(short = 't', long)]
    pub cycle_duration_ms: Option<u64>,

    /// Number of cycles requested from the producer
    #[arg(short = 'n', long)]
    pub cycles: Option<u32>,

    /// In-flight credit requested from the producer
    #[arg(long)]
    pub throttle: Option<u32>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub bench: BenchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Acknowledgment channel address; defaults to the HTTP port + 1
    pub channel_listen: Option<String>,
    /// How long `/time` waits for an acknowledgment channel to connect
    #[serde(default = "default_channel_wait_ms")]
    pub channel_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            channel_listen: None,
            channel_wait_ms: default_channel_wait_ms(),
        }
    }
}

/// Defaults for a producer session, overridable per request
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_cycle_duration_ms")]
    pub cycle_duration_ms: u64,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    #[serde(default = "default_throttle")]
    pub throttle: u32,
    /// Records the output stream may buffer before the writer reports full
    #[serde(default = "default_write_buffer")]
    pub write_buffer: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            cycle_duration_ms: default_cycle_duration_ms(),
            cycles: default_cycles(),
            throttle: default_throttle(),
            write_buffer: default_write_buffer(),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    #[serde(default = "default_listen")]
    pub target: String,
    #[serde(default = "default_pumps")]
    pub pumps: Vec<PumpKind>,
    #[serde(default = "default_cycle_duration_ms")]
    pub cycle_duration_ms: u64,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    #[serde(default = "default_throttle")]
    pub throttle: u32,
    /// Capacity of the channel between a pump and the acknowledgment writer
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
    /// Nested continuations a chained pump builds before unwinding
    #[serde(default = "default_chain_limit")]
    pub chain_limit: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            target: default_listen(),
            pumps: default_pumps(),
            cycle_duration_ms: default_cycle_duration_ms(),
            cycles: default_cycles(),
            throttle: default_throttle(),
            sink_capacity: default_sink_capacity(),
            chain_limit: default_chain_limit(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_channel_wait_ms() -> u64 {
    1000
}

fn default_cycle_duration_ms() -> u64 {
    5000
}

fn default_cycles() -> u32 {
    4
}

fn default_throttle() -> u32 {
    4096
}

fn default_write_buffer() -> usize {
    1024
}

fn default_pumps() -> Vec<PumpKind> {
    PumpKind::ALL.to_vec()
}

fn default_sink_capacity() -> usize {
    1024
}

fn default_chain_limit() -> usize {
    crate::pump::DEFAULT_CHAIN_LIMIT
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which side of the benchmark to run
#[derive(Debug, Clone)]
pub enum Mode {
    Serve(ServerConfig, ProducerConfig),
    Bench(BenchConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let mode = match cli.command {
            Command::Serve(args) => {
                let mut server = toml_config.server;
                let mut producer = toml_config.producer;
                if let Some(listen) = args.listen {
                    server.listen = listen;
                }
                server.channel_listen = args.channel_listen.or(server.channel_listen);
                producer.cycle_duration_ms =
                    args.cycle_duration_ms.unwrap_or(producer.cycle_duration_ms);
                producer.cycles = args.cycles.unwrap_or(producer.cycles);
                producer.throttle = args.throttle.unwrap_or(producer.throttle);
                Mode::Serve(server, producer)
            }
            Command::Bench(args) => {
                let mut bench = toml_config.bench;
                if let Some(target) = args.target {
                    bench.target = target;
                }
                if !args.pumps.is_empty() {
                    bench.pumps = args.pumps;
                }
                bench.cycle_duration_ms = args.cycle_duration_ms.unwrap_or(bench.cycle_duration_ms);
                bench.cycles = args.cycles.unwrap_or(bench.cycles);
                bench.throttle = args.throttle.unwrap_or(bench.throttle);
                Mode::Bench(bench)
            }
        };

        Config { mode, log_level }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:5000");
        assert_eq!(config.server.channel_listen, None);
        assert_eq!(config.producer.cycle_duration_ms, 5000);
        assert_eq!(config.producer.cycles, 4);
        assert_eq!(config.producer.throttle, 4096);
        assert_eq!(config.bench.pumps, PumpKind::ALL.to_vec());
        assert_eq!(config.bench.chain_limit, crate::pump::DEFAULT_CHAIN_LIMIT);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:8000"
            channel_listen = "0.0.0.0:8001"

            [producer]
            cycle_duration_ms = 1000
            cycles = 2
            throttle = 64

            [bench]
            target = "10.0.0.1:8000"
            pumps = ["async-unchained", "sync-chained"]
            chain_limit = 128

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8000");
        assert_eq!(config.server.channel_listen.as_deref(), Some("0.0.0.0:8001"));
        assert_eq!(config.producer.cycle_duration_ms, 1000);
        assert_eq!(config.producer.cycles, 2);
        assert_eq!(config.producer.throttle, 64);
        assert_eq!(config.producer.write_buffer, 1024);
        assert_eq!(config.bench.target, "10.0.0.1:8000");
        assert_eq!(
            config.bench.pumps,
            vec![PumpKind::AsyncUnchained, PumpKind::SyncChained]
        );
        assert_eq!(config.bench.chain_limit, 128);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "tick-relay",
            "bench",
            "--pumps",
            "sync-unchained,async-chained",
            "-n",
            "1",
        ]);
        let toml_config: TomlConfig = toml::from_str("[bench]\ncycles = 9\nthrottle = 7").unwrap();

        let config = Config::merge(cli, toml_config);
        match config.mode {
            Mode::Bench(bench) => {
                assert_eq!(
                    bench.pumps,
                    vec![PumpKind::SyncUnchained, PumpKind::AsyncChained]
                );
                assert_eq!(bench.cycles, 1);
                assert_eq!(bench.throttle, 7);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(config.log_level, "info");
    }
}
