//! Incremental record parser over a chunked byte stream.
//!
//! The parser owns a queue of complete records plus the undelimited tail
//! of the decoded text. A dedicated fetch task pulls chunks from the
//! upstream `ChunkSource` one at a time, on demand:
//!
//! - `try_read` pops the queue head; on an empty queue it schedules the
//!   next fetch and returns `None` without suspending.
//! - `await_ready` suspends until the pending fetch has been processed,
//!   then performs exactly one `try_read`.
//!
//! Every fetch request carries the sending half of a fresh `oneshot`
//! channel. The fetch task completes it after the chunk has been folded
//! into the queue, whether or not a record was produced, and once more
//! when the upstream ends.

use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::str;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Upstream of raw, arbitrarily split bytes.
///
/// `Ok(None)` signals the end of the stream.
pub trait ChunkSource: Send + 'static {
    fn next_chunk(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;
}

impl ChunkSource for mpsc::Receiver<Bytes> {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.recv().await)
    }
}

/// One timestamp extracted from the stream, kept as opaque text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    timestamp: String,
}

impl Record {
    pub fn new(timestamp: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
        }
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn into_inner(self) -> String {
        self.timestamp
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.timestamp)
    }
}

/// Streaming UTF-8 decoder.
///
/// Holds back the bytes of a multi-byte character that is split across
/// chunks. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode `chunk`, appending complete characters to `out`.
    pub fn decode(&mut self, chunk: &[u8], out: &mut String) {
        let joined;
        let mut input = if self.pending.is_empty() {
            chunk
        } else {
            let mut bytes = std::mem::take(&mut self.pending);
            bytes.extend_from_slice(chunk);
            joined = bytes;
            &joined[..]
        };

        loop {
            match str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    return;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        None => {
                            // Truncated sequence at the end of the chunk
                            self.pending = rest.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Flush a dangling partial character at end of stream.
    pub fn finish(&mut self, out: &mut String) {
        if !self.pending.is_empty() {
            self.pending.clear();
            out.push(char::REPLACEMENT_CHARACTER);
        }
    }
}

/// State shared between the parser handle and its fetch task.
#[derive(Debug, Default)]
struct ParserState {
    decoder: Utf8Decoder,
    /// Decoded text after the last delimiter. Never holds a full record.
    remaining: String,
    values: VecDeque<Record>,
    exhausted: bool,
}

impl ParserState {
    /// Fold one chunk into the queue. Returns the number of new records.
    fn ingest(&mut self, chunk: &[u8]) -> usize {
        let mut data = std::mem::take(&mut self.remaining);
        self.decoder.decode(chunk, &mut data);

        let before = self.values.len();
        let mut start = 0;
        while let Some(offset) = data[start..].find('\n') {
            self.push_line(&data[start..start + offset]);
            start += offset + 1;
        }

        data.drain(..start);
        self.remaining = data;
        self.values.len() - before
    }

    /// Upstream ended: emit any unterminated tail and stop.
    fn finish(&mut self) {
        let mut tail = std::mem::take(&mut self.remaining);
        self.decoder.finish(&mut tail);
        self.push_line(&tail);
        self.exhausted = true;
    }

    fn push_line(&mut self, line: &str) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if !line.is_empty() {
            self.values.push_back(Record::new(line));
        }
    }
}

fn lock(state: &Mutex<ParserState>) -> MutexGuard<'_, ParserState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reconstructs records from a chunked byte stream.
pub struct RecordParser {
    state: Arc<Mutex<ParserState>>,
    fetch_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    /// Readiness signal of the fetch in flight, if any.
    ready: Option<oneshot::Receiver<()>>,
    fetcher: JoinHandle<()>,
}

impl RecordParser {
    /// Start parsing `source`. The first fetch is issued immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<S: ChunkSource>(source: S) -> Self {
        let state = Arc::new(Mutex::new(ParserState::default()));
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let fetcher = tokio::spawn(fetch_loop(source, Arc::clone(&state), fetch_rx));

        let mut parser = Self {
            state,
            fetch_tx,
            ready: None,
            fetcher,
        };
        parser.read_chunk();
        parser
    }

    /// Pop the next record without suspending.
    ///
    /// An empty queue schedules the next fetch (unless one is already in
    /// flight or the upstream has ended) and yields `None`.
    pub fn try_read(&mut self) -> Option<Record> {
        let mut state = lock(&self.state);
        if let Some(record) = state.values.pop_front() {
            return Some(record);
        }
        let exhausted = state.exhausted;
        drop(state);

        if !exhausted {
            self.read_chunk();
        }
        None
    }

    /// Wait for the pending fetch to be processed, then `try_read` once.
    ///
    /// `None` does not imply end of stream; check `is_exhausted`.
    pub async fn await_ready(&mut self) -> Option<Record> {
        if let Some(ready) = self.ready.take() {
            // A dropped sender means the fetch task is gone; still settled.
            let _ = ready.await;
        }
        self.try_read()
    }

    /// The upstream has ended and every record has been read.
    pub fn is_exhausted(&self) -> bool {
        let state = lock(&self.state);
        state.exhausted && state.values.is_empty()
    }

    /// Number of records waiting in the queue.
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        lock(&self.state).values.len()
    }

    /// Arm a new readiness signal and request a chunk.
    fn read_chunk(&mut self) {
        if let Some(ready) = self.ready.as_mut() {
            if matches!(ready.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                // Previous fetch still in flight
                return;
            }
        }

        let (done, ready) = oneshot::channel();
        self.ready = Some(ready);
        if self.fetch_tx.send(done).is_err() {
            trace!("Fetch task already stopped");
        }
    }
}

impl Drop for RecordParser {
    fn drop(&mut self) {
        self.fetcher.abort();
    }
}

/// Serve fetch requests one at a time until the upstream ends.
async fn fetch_loop<S: ChunkSource>(
    mut source: S,
    state: Arc<Mutex<ParserState>>,
    mut requests: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
) {
    while let Some(done) = requests.recv().await {
        let finished = match source.next_chunk().await {
            Ok(Some(chunk)) => {
                let records = lock(&state).ingest(&chunk);
                trace!(bytes = chunk.len(), records, "Processed chunk");
                false
            }
            Ok(None) => {
                debug!("Upstream exhausted");
                lock(&state).finish();
                true
            }
            Err(e) => {
                warn!(error = %e, "Upstream read failed");
                lock(&state).finish();
                true
            }
        };

        let _ = done.send(());
        if finished {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    fn parse_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut state = ParserState::default();
        for chunk in chunks {
            state.ingest(chunk);
        }
        state.finish();
        state.values.into_iter().map(Record::into_inner).collect()
    }

    #[test]
    fn test_single_chunk() {
        assert_eq!(
            parse_all(&[b"100\n200\n300\n"]),
            vec!["100", "200", "300"]
        );
    }

    #[test]
    fn test_chunk_boundaries() {
        let input = "1700000000001\n\n17\u{20ac}x\r\n\n\n99\n\u{1f600}\n42".as_bytes();
        let expected = parse_all(&[input]);
        assert_eq!(expected, vec!["1700000000001", "17\u{20ac}x", "99", "\u{1f600}", "42"]);

        for i in 0..=input.len() {
            for j in i..=input.len() {
                let split = parse_all(&[&input[..i], &input[i..j], &input[j..]]);
                assert_eq!(split, expected, "split at {} and {}", i, j);
            }
        }
    }

    #[test]
    fn test_no_empty_records() {
        assert_eq!(parse_all(&[b"\n\n1\n\n\r\n2\n\n"]), vec!["1", "2"]);
        assert!(parse_all(&[b"\n", b"\n", b"\r\n"]).is_empty());
    }

    #[test]
    fn test_remaining_never_holds_full_record() {
        let mut state = ParserState::default();
        assert_eq!(state.ingest(b"12"), 0);
        assert_eq!(state.remaining, "12");
        assert_eq!(state.ingest(b"3\n45"), 1);
        assert_eq!(state.remaining, "45");
        assert!(!state.remaining.contains('\n'));
    }

    #[test]
    fn test_decoder_split_character() {
        let euro = "\u{20ac}".as_bytes();
        let mut decoder = Utf8Decoder::default();
        let mut out = String::new();
        decoder.decode(&euro[..1], &mut out);
        assert_eq!(out, "");
        decoder.decode(&euro[1..], &mut out);
        assert_eq!(out, "\u{20ac}");
    }

    #[test]
    fn test_decoder_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        let mut out = String::new();
        decoder.decode(b"a\xffb", &mut out);
        assert_eq!(out, "a\u{fffd}b");

        decoder.decode(b"\xe2\x82", &mut out);
        decoder.finish(&mut out);
        assert_eq!(out, "a\u{fffd}b\u{fffd}");
    }

    #[tokio::test]
    async fn test_try_read_never_blocks() {
        let (_tx, rx) = mpsc::channel::<Bytes>(4);
        let mut parser = RecordParser::new(rx);

        // Nothing has arrived; both calls return immediately.
        assert_eq!(parser.try_read(), None);
        assert_eq!(parser.try_read(), None);
        assert!(!parser.is_exhausted());
    }

    #[tokio::test]
    async fn test_await_ready_settles_without_record() {
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        let mut parser = RecordParser::new(rx);

        tx.send(Bytes::from_static(b"17")).await.unwrap();
        assert_eq!(parser.await_ready().await, None);
        assert!(!parser.is_exhausted());

        tx.send(Bytes::from_static(b"00\n18")).await.unwrap();
        assert_eq!(parser.await_ready().await, Some(Record::new("1700")));

        tx.send(Bytes::from_static(b"00\n")).await.unwrap();
        drop(tx);

        let mut rest = Vec::new();
        while !parser.is_exhausted() {
            if let Some(record) = parser.await_ready().await {
                rest.push(record.into_inner());
            }
        }
        assert_eq!(rest, vec!["1800"]);
        assert_eq!(parser.await_ready().await, None);
        assert_eq!(parser.try_read(), None);
    }

    #[tokio::test]
    async fn test_await_ready_pends_until_a_chunk_arrives() {
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        let mut parser = RecordParser::new(rx);

        let mut waiting = task::spawn(parser.await_ready());
        assert_pending!(waiting.poll());

        tx.send(Bytes::from_static(b"5\n")).await.unwrap();
        while !waiting.is_woken() {
            tokio::task::yield_now().await;
        }
        assert_eq!(assert_ready!(waiting.poll()), Some(Record::new("5")));
    }

    #[tokio::test]
    async fn test_queued_records_survive_end_of_stream() {
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        let mut parser = RecordParser::new(rx);

        tx.send(Bytes::from_static(b"1\n2\n3\n")).await.unwrap();
        drop(tx);

        assert_eq!(parser.await_ready().await, Some(Record::new("1")));
        assert_eq!(parser.queued(), 2);
        assert!(!parser.is_exhausted());
        assert_eq!(parser.try_read(), Some(Record::new("2")));
        assert_eq!(parser.try_read(), Some(Record::new("3")));

        // Queue drained: waiting only ever observes the end of the stream.
        while !parser.is_exhausted() {
            assert_eq!(parser.await_ready().await, None);
        }
        assert_eq!(parser.queued(), 0);
    }
}
