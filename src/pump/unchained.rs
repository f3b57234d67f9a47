//! Trampolined pumps.
//!
//! A flat loop that hands control back to the scheduler after every unit
//! of work. Nothing nests, so depth stays at one for any session length.

use super::{await_and_forward, drain_ready, Flow, PumpStats};
use crate::parser::{Record, RecordParser};
use tokio::sync::mpsc;

/// Drain everything ready, then wait for the next chunk.
pub(super) async fn run_sync(
    parser: &mut RecordParser,
    sink: &mpsc::Sender<Record>,
    stats: &mut PumpStats,
) {
    loop {
        stats.enter();
        let flow = drain_then_wait(parser, sink, stats).await;
        stats.exit();

        if flow == Flow::Stop {
            return;
        }
        tokio::task::yield_now().await;
    }
}

/// Wait on readiness once per record.
pub(super) async fn run_async(
    parser: &mut RecordParser,
    sink: &mpsc::Sender<Record>,
    stats: &mut PumpStats,
) {
    loop {
        stats.enter();
        let flow = wait_once(parser, sink, stats).await;
        stats.exit();

        if flow == Flow::Stop {
            return;
        }
        tokio::task::yield_now().await;
    }
}

async fn drain_then_wait(
    parser: &mut RecordParser,
    sink: &mpsc::Sender<Record>,
    stats: &mut PumpStats,
) -> Flow {
    if drain_ready(parser, sink, stats).await == Flow::Stop {
        return Flow::Stop;
    }
    wait_once(parser, sink, stats).await
}

async fn wait_once(
    parser: &mut RecordParser,
    sink: &mpsc::Sender<Record>,
    stats: &mut PumpStats,
) -> Flow {
    if parser.is_exhausted() {
        return Flow::Stop;
    }
    await_and_forward(parser, sink, stats).await
}
