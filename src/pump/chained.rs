//! Continuation-chaining pumps.
//!
//! Each unit of work ends by awaiting the next continuation, so futures
//! nest one level per step. Polling walks the whole nest, which is what
//! makes this shape unsafe for unbounded sessions; the driver unwinds the
//! nest every `chain_limit` levels and starts a fresh chain.

use super::{await_and_forward, drain_ready, Flow, PumpStats};
use crate::parser::{Record, RecordParser};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::trace;

type Continuation<'a> = Pin<Box<dyn Future<Output = Unwind> + Send + 'a>>;

/// How a chain of continuations ended.
enum Unwind {
    Done,
    Restart,
}

pub(super) async fn run(
    parser: &mut RecordParser,
    sink: &mpsc::Sender<Record>,
    stats: &mut PumpStats,
    sync: bool,
    chain_limit: usize,
) {
    loop {
        match step(parser, sink, stats, sync, chain_limit).await {
            Unwind::Done => return,
            Unwind::Restart => {
                trace!(depth = chain_limit, "Unwinding continuation chain");
                tokio::task::yield_now().await;
            }
        }
    }
}

/// One continuation: counted as live from its first poll until it returns.
fn step<'a>(
    parser: &'a mut RecordParser,
    sink: &'a mpsc::Sender<Record>,
    stats: &'a mut PumpStats,
    sync: bool,
    chain_limit: usize,
) -> Continuation<'a> {
    Box::pin(async move {
        stats.enter();
        let unwind = unit(parser, sink, stats, sync, chain_limit).await;
        stats.exit();
        unwind
    })
}

async fn unit(
    parser: &mut RecordParser,
    sink: &mpsc::Sender<Record>,
    stats: &mut PumpStats,
    sync: bool,
    chain_limit: usize,
) -> Unwind {
    if sync && drain_ready(parser, sink, stats).await == Flow::Stop {
        return Unwind::Done;
    }
    if parser.is_exhausted() {
        return Unwind::Done;
    }
    if await_and_forward(parser, sink, stats).await == Flow::Stop {
        return Unwind::Done;
    }

    if stats.depth >= chain_limit {
        return Unwind::Restart;
    }
    step(parser, sink, stats, sync, chain_limit).await
}
