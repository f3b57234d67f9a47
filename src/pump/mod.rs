//! Pumps move parsed records from a `RecordParser` into a sink channel.
//!
//! All four variants share one contract: forward records in stream order
//! until the sink closes or the upstream is exhausted. They differ along
//! two axes:
//!
//! - **Batching**: `Sync*` drains every ready record with `try_read`
//!   before suspending on readiness again; `Async*` suspends once per
//!   record via `await_ready`.
//! - **Continuation shape**: `*Chained` re-enters a boxed continuation
//!   from inside the previous one, so nesting grows with the number of
//!   records; `*Unchained` loops and yields back to the scheduler between
//!   units of work, keeping depth at one.
//!
//! Chained nesting is unwound after `chain_limit` levels so a long session
//! cannot exhaust the stack.

mod chained;
mod unchained;

use crate::parser::{Record, RecordParser};
use serde::Deserialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Default number of nested continuations before a chained pump unwinds.
pub const DEFAULT_CHAIN_LIMIT: usize = 4096;

/// Scheduling discipline of a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PumpKind {
    SyncChained,
    SyncUnchained,
    AsyncChained,
    AsyncUnchained,
}

impl PumpKind {
    pub const ALL: [PumpKind; 4] = [
        PumpKind::SyncChained,
        PumpKind::SyncUnchained,
        PumpKind::AsyncChained,
        PumpKind::AsyncUnchained,
    ];

    pub fn is_sync(self) -> bool {
        matches!(self, PumpKind::SyncChained | PumpKind::SyncUnchained)
    }

    pub fn is_chained(self) -> bool {
        matches!(self, PumpKind::SyncChained | PumpKind::AsyncChained)
    }

    pub fn name(self) -> &'static str {
        match self {
            PumpKind::SyncChained => "sync-chained",
            PumpKind::SyncUnchained => "sync-unchained",
            PumpKind::AsyncChained => "async-chained",
            PumpKind::AsyncUnchained => "async-unchained",
        }
    }
}

impl fmt::Display for PumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a pump did during one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    /// Records accepted by the sink.
    pub forwarded: u64,
    /// Deepest continuation nesting observed.
    pub max_depth: usize,
    /// Units of work entered and not yet returned.
    depth: usize,
}

impl PumpStats {
    /// A unit of work starts, nested inside any still running.
    fn enter(&mut self) {
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);
    }

    fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

/// A pump bound to a parser. Holds no state beyond its own position.
pub struct Pump<'a> {
    kind: PumpKind,
    parser: &'a mut RecordParser,
    chain_limit: usize,
}

impl<'a> Pump<'a> {
    pub fn new(kind: PumpKind, parser: &'a mut RecordParser) -> Self {
        Self {
            kind,
            parser,
            chain_limit: DEFAULT_CHAIN_LIMIT,
        }
    }

    /// Override how deep chained continuations may nest before unwinding.
    pub fn with_chain_limit(mut self, chain_limit: usize) -> Self {
        self.chain_limit = chain_limit.max(1);
        self
    }

    /// Forward records into `sink` until it closes or the upstream ends.
    ///
    /// A closed sink is a normal way to finish, not an error.
    pub async fn execute(self, sink: &mpsc::Sender<Record>) -> PumpStats {
        let mut stats = PumpStats::default();
        let sync = self.kind.is_sync();

        if self.kind.is_chained() {
            chained::run(self.parser, sink, &mut stats, sync, self.chain_limit).await;
        } else if sync {
            unchained::run_sync(self.parser, sink, &mut stats).await;
        } else {
            unchained::run_async(self.parser, sink, &mut stats).await;
        }

        debug!(
            pump = %self.kind,
            forwarded = stats.forwarded,
            max_depth = stats.max_depth,
            "Pump finished"
        );
        stats
    }
}

/// Whether a pump should keep going after a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Result of suspending on the parser's readiness signal.
enum Ready {
    Record(Record),
    Empty,
    SinkClosed,
}

/// Send one record, unless the sink has already closed.
async fn forward(record: Record, sink: &mpsc::Sender<Record>, stats: &mut PumpStats) -> Flow {
    if sink.is_closed() {
        return Flow::Stop;
    }
    match sink.send(record).await {
        Ok(()) => {
            stats.forwarded += 1;
            Flow::Continue
        }
        Err(_) => Flow::Stop,
    }
}

/// Forward every record already queued, without waiting on readiness.
async fn drain_ready(
    parser: &mut RecordParser,
    sink: &mpsc::Sender<Record>,
    stats: &mut PumpStats,
) -> Flow {
    while let Some(record) = parser.try_read() {
        if forward(record, sink, stats).await == Flow::Stop {
            return Flow::Stop;
        }
    }
    Flow::Continue
}

/// Suspend until the parser settles, or the sink closes first.
async fn next_ready(parser: &mut RecordParser, sink: &mpsc::Sender<Record>) -> Ready {
    tokio::select! {
        biased;
        _ = sink.closed() => Ready::SinkClosed,
        record = parser.await_ready() => match record {
            Some(record) => Ready::Record(record),
            None => Ready::Empty,
        },
    }
}

/// One readiness wait plus the send it enables.
async fn await_and_forward(
    parser: &mut RecordParser,
    sink: &mpsc::Sender<Record>,
    stats: &mut PumpStats,
) -> Flow {
    match next_ready(parser, sink).await {
        Ready::Record(record) => forward(record, sink, stats).await,
        Ready::Empty => Flow::Continue,
        Ready::SinkClosed => Flow::Stop,
    }
}
