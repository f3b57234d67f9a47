//! Credit-paced record producer.
//!
//! Writes `<now>\n` records into an output queue under two independent
//! backpressure signals:
//!
//! - **Transport**: the output queue in front of the socket writer is
//!   bounded. When it is full the write loop parks until a slot drains.
//! - **Credit**: at most `throttle` records may be unacknowledged. Each
//!   write spends one credit, each acknowledgment returns one.
//!
//! Acknowledgments arrive on the duplex channel as echoed timestamps.
//! Their round-trip latency is folded into per-cycle statistics; once a
//! cycle has run for `cycle_duration_ms` a summary message is sent back on
//! the same channel.
//!
//! The producer task is the sole owner of the credit counter and cycle
//! statistics, so neither needs a lock.

use crate::error::AckError;
use crate::protocol::{encode_record, parse_ack, CycleReport};
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::io;
use tokio::sync::mpsc::{self, error::SendError, error::TrySendError};
use tracing::{debug, info, trace, warn};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parameters of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub cycles: u32,
    pub cycle_duration_ms: u64,
    pub throttle: u32,
}

impl SessionParams {
    /// Clamp to a runnable session: at least one cycle and one credit.
    pub fn normalized(self) -> Self {
        Self {
            cycles: self.cycles.max(1),
            cycle_duration_ms: self.cycle_duration_ms,
            throttle: self.throttle.max(1),
        }
    }
}

/// Records that may still be written before an acknowledgment arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditCounter {
    available: u32,
    limit: u32,
}

impl CreditCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            available: limit,
            limit,
        }
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    /// Spend one credit. Returns false (and changes nothing) at zero.
    pub fn try_take(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    /// Return one credit, saturating at the limit.
    ///
    /// Returns true if the counter was empty, i.e. writing had stalled on credit.
    pub fn replenish(&mut self) -> bool {
        let was_empty = self.available == 0;
        self.available = (self.available + 1).min(self.limit);
        was_empty
    }

    /// Undo a `try_take` whose write was not accepted.
    fn refund(&mut self) {
        self.available = (self.available + 1).min(self.limit);
    }
}

/// Latency aggregate for the current cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    count: u64,
    min: i64,
    max: i64,
    sum: i128,
    /// Wall time of the first acknowledgment in this cycle.
    started_at: Option<i64>,
}

impl CycleStats {
    /// Add one latency sample observed at wall time `now`.
    pub fn record(&mut self, latency: i64, now: i64) {
        if self.count == 0 {
            self.started_at = Some(now);
            self.min = latency;
            self.max = latency;
        } else {
            self.min = self.min.min(latency);
            self.max = self.max.max(latency);
        }
        self.count += 1;
        self.sum += i128::from(latency);
    }

    /// Milliseconds since the first acknowledgment of the cycle.
    pub fn elapsed(&self, now: i64) -> i64 {
        self.started_at.map_or(0, |start| now - start)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// Mean latency, truncated toward zero.
    pub fn mean(&self) -> i64 {
        if self.count == 0 {
            0
        } else {
            (self.sum / i128::from(self.count)) as i64
        }
    }

    /// Summarize the cycle over `elapsed` milliseconds.
    pub fn report(&self, elapsed: i64) -> CycleReport {
        let throughput = if elapsed > 0 {
            (1000 * self.count() as i64) / elapsed
        } else {
            0
        };
        CycleReport {
            throughput,
            latency_min: self.min(),
            latency_mean: self.mean(),
            latency_max: self.max(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Lifecycle of a producer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Producing,
    Draining,
    Closed,
}

/// What an acknowledgment changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// Summary of a cycle that just completed.
    pub report: Option<CycleReport>,
    /// Writing had stalled on credit and may continue.
    pub resume: bool,
}

/// Clock-free producer state machine.
#[derive(Debug)]
pub struct ProducerCore {
    state: ProducerState,
    cycles_left: u32,
    cycle_duration_ms: i64,
    credit: CreditCounter,
    stats: CycleStats,
}

impl ProducerCore {
    pub fn new(params: SessionParams) -> Self {
        let params = params.normalized();
        Self {
            state: ProducerState::Idle,
            cycles_left: params.cycles,
            cycle_duration_ms: params.cycle_duration_ms as i64,
            credit: CreditCounter::new(params.throttle),
            stats: CycleStats::default(),
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn cycles_left(&self) -> u32 {
        self.cycles_left
    }

    pub fn credit(&self) -> &CreditCounter {
        &self.credit
    }

    #[cfg(test)]
    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn start(&mut self) {
        if self.state == ProducerState::Idle {
            self.state = ProducerState::Producing;
        }
    }

    /// A record may be written right now.
    pub fn can_write(&self) -> bool {
        self.state == ProducerState::Producing
            && self.cycles_left > 0
            && self.credit.available() > 0
    }

    /// Spend the credit for one write.
    pub fn take_credit(&mut self) -> bool {
        self.can_write() && self.credit.try_take()
    }

    fn refund_credit(&mut self) {
        self.credit.refund();
    }

    /// Account for an acknowledgment of `timestamp` received at `now`.
    ///
    /// A timestamp later than `now` was never written by this producer and
    /// is rejected without touching credit or statistics.
    pub fn on_ack(&mut self, timestamp: i64, now: i64) -> Result<AckOutcome, AckError> {
        if timestamp > now {
            return Err(AckError::FromFuture { timestamp, now });
        }
        if self.state != ProducerState::Producing {
            return Ok(AckOutcome {
                report: None,
                resume: false,
            });
        }

        self.stats.record(now - timestamp, now);
        let was_stalled = self.credit.replenish();

        let mut report = None;
        let elapsed = self.stats.elapsed(now);
        if elapsed >= self.cycle_duration_ms {
            report = Some(self.stats.report(elapsed));
            self.stats.reset();
            self.cycles_left -= 1;
        }

        if self.cycles_left == 0 {
            self.state = ProducerState::Draining;
        }

        Ok(AckOutcome {
            report,
            resume: was_stalled && self.state == ProducerState::Producing,
        })
    }

    /// Release everything: no more writes are possible.
    pub fn close(&mut self) {
        self.state = ProducerState::Closed;
    }
}

/// Callback run once when a session ends.
pub type CompletionFn = Box<dyn FnOnce(ProducerState) + Send>;

/// Drives a `ProducerCore` against real I/O.
///
/// - `output`: queue of encoded record lines feeding the response body.
/// - `acks`: acknowledgment messages; the stream ending means the channel
///   closed.
/// - `results`: where cycle summaries are sent; closed when the session ends.
pub struct CreditPacedProducer<A, R> {
    core: ProducerCore,
    output: mpsc::Sender<Bytes>,
    acks: A,
    results: R,
    on_complete: Option<CompletionFn>,
}

impl<A, R> CreditPacedProducer<A, R>
where
    A: Stream<Item = String> + Unpin + Send,
    R: Sink<String> + Unpin + Send,
    R::Error: fmt::Display,
{
    pub fn new(params: SessionParams, output: mpsc::Sender<Bytes>, acks: A, results: R) -> Self {
        Self {
            core: ProducerCore::new(params),
            output,
            acks,
            results,
            on_complete: None,
        }
    }

    /// Run `callback` exactly once when the session ends, however it ends.
    pub fn on_complete(mut self, callback: impl FnOnce(ProducerState) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Run the session to completion. Returns the final state.
    ///
    /// Channel closure and I/O failures end the session quietly; the
    /// output queue and duplex channel are released either way.
    pub async fn run(mut self) -> ProducerState {
        self.core.start();
        let outcome = self.produce().await;

        match outcome {
            Ok(()) => debug!("Producer drained"),
            Err(e) => debug!(error = %e, "Producer stopped early"),
        }

        self.core.close();
        let state = self.core.state();

        // Free the session before the peer can observe the close, so a
        // client starting its next run right away is not turned away.
        if let Some(callback) = self.on_complete.take() {
            callback(state);
        }

        if let Err(e) = self.results.close().await {
            debug!(error = %e, "Closing acknowledgment channel failed");
        }
        // Dropping the sender ends the output stream.
        drop(self);
        state
    }

    async fn produce(&mut self) -> io::Result<()> {
        let mut transport_full = false;

        while self.core.state() == ProducerState::Producing {
            if !transport_full {
                transport_full = self.write_records()?;
            }

            let output = &self.output;
            let acks = &mut self.acks;
            tokio::select! {
                biased;
                _ = output.closed() => return Err(closed("output stream")),
                ack = acks.next() => match ack {
                    Some(message) => self.handle_ack(&message).await?,
                    None => {
                        debug!("Acknowledgment channel closed");
                        return Ok(());
                    }
                },
                // Drain signal: a slot freed up in the output queue.
                drained = wait_for_slot(output), if transport_full => {
                    drained.map_err(|_| closed("output stream"))?;
                    transport_full = false;
                    trace!("Output drained");
                }
            }
        }
        Ok(())
    }

    /// Write records while credit lasts. Returns true if the output filled up.
    fn write_records(&mut self) -> io::Result<bool> {
        let mut written = 0u32;
        while self.core.can_write() {
            if self.output.capacity() == 0 {
                trace!(written, "Output full");
                return Ok(true);
            }
            self.core.take_credit();

            let mut buf = BytesMut::with_capacity(16);
            encode_record(now_ms(), &mut buf);
            match self.output.try_send(buf.freeze()) {
                Ok(()) => written += 1,
                Err(TrySendError::Full(_)) => {
                    self.core.refund_credit();
                    return Ok(true);
                }
                Err(TrySendError::Closed(_)) => return Err(closed("output stream")),
            }
        }
        if written > 0 {
            trace!(written, credit = self.core.credit().available(), "Wrote records");
        }
        Ok(false)
    }

    async fn handle_ack(&mut self, message: &str) -> io::Result<()> {
        let now = now_ms();
        let outcome = match parse_ack(message).and_then(|ts| self.core.on_ack(ts, now)) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Dropping acknowledgment");
                return Ok(());
            }
        };
        if outcome.resume {
            trace!("Credit replenished, resuming writes");
        }

        if let Some(report) = outcome.report {
            info!(
                throughput = report.throughput,
                min = report.latency_min,
                mean = report.latency_mean,
                max = report.latency_max,
                cycles_left = self.core.cycles_left(),
                "{}",
                report
            );
            self.results
                .send(report.to_string())
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
        }
        Ok(())
    }
}

/// Resolves once the output queue has room again. The permit is released
/// immediately; the write loop claims the slot with `try_send`.
async fn wait_for_slot(output: &mpsc::Sender<Bytes>) -> Result<(), SendError<()>> {
    output.reserve().await.map(drop)
}

fn closed(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("{what} closed"))
}
