//! Benchmark orchestrator
//!
//! Runs one end-to-end session per configured pump, strictly one after
//! another, and collects the last cycle result of each.

use crate::client::{AckChannel, ByteStream};
use crate::config::BenchConfig;
use crate::error::{BenchError, ProtocolError};
use crate::parser::RecordParser;
use crate::protocol::CycleReport;
use crate::pump::{Pump, PumpKind, PumpStats};
use reqwest::StatusCode;
use std::fmt::Write;
use tracing::{info, warn};

/// How a single run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The session ran; `result` is its final cycle summary if one arrived.
    Completed {
        result: Option<CycleReport>,
        raw: Option<String>,
        stats: PumpStats,
    },
    /// The producer already had an active session.
    Busy,
}

/// One line of the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub pump: PumpKind,
    pub outcome: RunOutcome,
}

/// Results of a full benchmark run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BenchReport {
    pub entries: Vec<ReportEntry>,
}

impl BenchReport {
    /// Render as a plain-text table.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<16} {:>12} {:>8} {:>8} {:>8} {:>10} {:>6}",
            "pump", "ops/sec", "min", "mean", "max", "records", "depth"
        );
        for entry in &self.entries {
            match &entry.outcome {
                RunOutcome::Completed {
                    result: Some(r),
                    stats,
                    ..
                } => {
                    let _ = writeln!(
                        out,
                        "{:<16} {:>12} {:>8} {:>8} {:>8} {:>10} {:>6}",
                        entry.pump,
                        r.throughput,
                        r.latency_min,
                        r.latency_mean,
                        r.latency_max,
                        stats.forwarded,
                        stats.max_depth
                    );
                }
                RunOutcome::Completed {
                    result: None,
                    raw,
                    stats,
                } => {
                    let _ = writeln!(
                        out,
                        "{:<16} {:>12} {:>8} {:>8} {:>8} {:>10} {:>6}  {}",
                        entry.pump,
                        "-",
                        "-",
                        "-",
                        "-",
                        stats.forwarded,
                        stats.max_depth,
                        raw.as_deref().unwrap_or("no result")
                    );
                }
                RunOutcome::Busy => {
                    let _ = writeln!(out, "{:<16} {:>12}", entry.pump, "busy");
                }
            }
        }
        out
    }
}

/// Sequences benchmark sessions against one producer.
pub struct BenchmarkOrchestrator {
    config: BenchConfig,
    http: reqwest::Client,
}

impl BenchmarkOrchestrator {
    pub fn new(config: BenchConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Run every configured pump in order.
    pub async fn run(&self) -> Result<BenchReport, BenchError> {
        let mut report = BenchReport::default();
        for &pump in &self.config.pumps {
            let outcome = self.run_one(pump).await?;
            report.entries.push(ReportEntry { pump, outcome });
        }
        Ok(report)
    }

    /// One session: open the channel, request the stream, pump it.
    async fn run_one(&self, pump: PumpKind) -> Result<RunOutcome, BenchError> {
        let target = self.config.target.as_str();
        info!(pump = %pump, target, "Starting run");

        let port = self.get("/session-channel-port").await?;
        let port = expect_ok(port, "/session-channel-port")?.text().await?;
        let url = channel_url(target, port.trim())?;
        let channel = AckChannel::connect(&url, self.config.sink_capacity).await?;

        let path = format!(
            "/time?time={}&cycles={}&throttle={}",
            self.config.cycle_duration_ms, self.config.cycles, self.config.throttle
        );
        let response = self.get(&path).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::SERVICE_UNAVAILABLE => {
                warn!(pump = %pump, "Producer busy, skipping run");
                channel.abort();
                return Ok(RunOutcome::Busy);
            }
            status => {
                channel.abort();
                return Err(BenchError::Status {
                    status: status.as_u16(),
                    path,
                });
            }
        }

        let mut parser = RecordParser::new(ByteStream::new(response.bytes_stream()));
        let stats = Pump::new(pump, &mut parser)
            .with_chain_limit(self.config.chain_limit)
            .execute(channel.sink())
            .await;
        drop(parser);

        let raw = channel.finish().await?;
        let result = raw.as_deref().and_then(|r| r.parse().ok());

        info!(
            pump = %pump,
            forwarded = stats.forwarded,
            max_depth = stats.max_depth,
            result = raw.as_deref().unwrap_or("none"),
            "Run finished"
        );

        Ok(RunOutcome::Completed { result, raw, stats })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, BenchError> {
        let url = format!("http://{}{}", self.config.target, path);
        Ok(self.http.get(url).send().await?)
    }
}

fn expect_ok(response: reqwest::Response, path: &str) -> Result<reqwest::Response, BenchError> {
    if response.status() != StatusCode::OK {
        return Err(BenchError::Status {
            status: response.status().as_u16(),
            path: path.to_string(),
        });
    }
    Ok(response)
}

/// The channel lives on the target's host at the advertised port.
fn channel_url(target: &str, port: &str) -> Result<String, ProtocolError> {
    let port: u16 = port
        .parse()
        .map_err(|_| ProtocolError::ChannelPort(port.to_string()))?;
    let (host, _) = target
        .rsplit_once(':')
        .filter(|(host, _)| !host.is_empty())
        .ok_or_else(|| ProtocolError::Target(target.to_string()))?;
    Ok(format!("ws://{host}:{port}/"))
}
