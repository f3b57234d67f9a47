//! Consumer-side transport.
//!
//! - `ByteStream`: a response body as the raw chunks a `RecordParser`
//!   consumes
//! - `AckChannel`: the WebSocket duplex channel, exposed as a record sink
//!   plus the last result message received

use crate::error::BenchError;
use crate::parser::{ChunkSource, Record};
use bytes::Bytes;
use futures::future::ready;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::io;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, trace};

/// Acknowledgments queued into one flush of the channel
const MAX_BATCH: usize = 512;

/// Body bytes as they arrive, so record boundaries fall wherever the
/// transport split them.
pub struct ByteStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
}

impl ByteStream {
    pub fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            inner: stream.map(|chunk| chunk.map_err(io::Error::other)).boxed(),
        }
    }
}

impl ChunkSource for ByteStream {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        while let Some(chunk) = self.inner.next().await {
            let chunk = chunk?;
            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }
}

/// The duplex channel seen from the consumer.
///
/// Records sent into `sink` are written back as acknowledgments. Result
/// messages from the producer are collected; the channel closing (either
/// side) closes the sink.
pub struct AckChannel {
    sink: mpsc::Sender<Record>,
    writer: JoinHandle<io::Result<()>>,
    reader: JoinHandle<Option<String>>,
}

impl AckChannel {
    /// Connect to the producer's channel listener at `url` (`ws://host:port/`).
    pub async fn connect(url: &str, capacity: usize) -> Result<Self, BenchError> {
        let (socket, _) = connect_async(url).await?;
        debug!(url, "Acknowledgment channel connected");

        let (sink, messages) = socket.split();
        let results = messages
            .take_while(|message| ready(matches!(message, Ok(m) if !m.is_close())))
            .filter_map(|message| {
                ready(match message {
                    Ok(Message::Text(text)) => Some(text),
                    _ => None,
                })
            });
        let acks = sink.with(|text: String| ready(Ok::<_, WsError>(Message::Text(text))));
        Ok(Self::from_parts(results, acks, capacity))
    }

    /// Wire the channel over an arbitrary result stream and ack sink.
    pub fn from_parts<S, K>(results: S, acks: K, capacity: usize) -> Self
    where
        S: Stream<Item = String> + Unpin + Send + 'static,
        K: Sink<String> + Unpin + Send + 'static,
        K::Error: fmt::Display + Send,
    {
        let (sink, records) = mpsc::channel(capacity.max(1));
        let (closed_tx, closed_rx) = oneshot::channel();
        let writer = tokio::spawn(write_acks(records, acks, closed_rx));
        let reader = tokio::spawn(read_results(results, closed_tx));
        Self {
            sink,
            writer,
            reader,
        }
    }

    pub fn sink(&self) -> &mpsc::Sender<Record> {
        &self.sink
    }

    /// Drop the channel without waiting for the producer.
    pub fn abort(self) {
        self.writer.abort();
        self.reader.abort();
    }

    /// Stop sending and wait for the producer to close the channel.
    ///
    /// Returns the last result message received, if any.
    pub async fn finish(self) -> io::Result<Option<String>> {
        drop(self.sink);
        let written = self.writer.await.map_err(io::Error::other)?;
        let last = self.reader.await.map_err(io::Error::other)?;
        if let Err(e) = written {
            debug!(error = %e, "Acknowledgment writer failed");
        }
        Ok(last)
    }
}

/// Send each record's timestamp back until the sink or channel closes.
async fn write_acks<K>(
    mut records: mpsc::Receiver<Record>,
    mut acks: K,
    mut closed: oneshot::Receiver<()>,
) -> io::Result<()>
where
    K: Sink<String> + Unpin,
    K::Error: fmt::Display,
{
    loop {
        let record = tokio::select! {
            biased;
            _ = &mut closed => break,
            record = records.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        acks.feed(record.timestamp().to_string())
            .await
            .map_err(channel_error)?;
        let mut batched = 1;
        while batched < MAX_BATCH {
            match records.try_recv() {
                Ok(more) => {
                    acks.feed(more.timestamp().to_string())
                        .await
                        .map_err(channel_error)?;
                    batched += 1;
                }
                Err(_) => break,
            }
        }
        acks.flush().await.map_err(channel_error)?;
    }

    // Dropping `records` here closes the pump's sink.
    drop(records);
    if let Err(e) = acks.close().await {
        trace!(error = %e, "Closing acknowledgment channel failed");
    }
    Ok(())
}

/// Collect result messages until the producer closes the channel.
async fn read_results<S: Stream<Item = String> + Unpin>(
    mut results: S,
    closed: oneshot::Sender<()>,
) -> Option<String> {
    let mut last = None;
    while let Some(message) = results.next().await {
        let message = message.trim();
        if message.is_empty() {
            continue;
        }
        info!(result = %message, "Cycle result");
        last = Some(message.to_string());
    }
    trace!("Result channel closed");
    let _ = closed.send(());
    last
}

fn channel_error(e: impl fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::unbounded;
    use futures::stream;

    #[tokio::test]
    async fn test_byte_stream_skips_empty_pieces() {
        let pieces = vec![
            Ok::<_, io::Error>(Bytes::from_static(b"100\n20")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"0\n")),
        ];
        let mut body = ByteStream::new(stream::iter(pieces));

        assert_eq!(body.next_chunk().await.unwrap().unwrap(), &b"100\n20"[..]);
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), &b"0\n"[..]);
        assert_eq!(body.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_byte_stream_surfaces_errors() {
        let pieces = vec![
            Ok(Bytes::from_static(b"12345")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut body = ByteStream::new(stream::iter(pieces));

        assert_eq!(body.next_chunk().await.unwrap().unwrap(), &b"12345"[..]);
        assert!(body.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn test_ack_channel_echoes_and_collects() {
        let (ack_tx, mut ack_rx) = unbounded::<String>();
        let (result_tx, result_rx) = unbounded::<String>();

        let channel = AckChannel::from_parts(result_rx, ack_tx, 4);
        channel.sink().send(Record::new("17")).await.unwrap();
        channel.sink().send(Record::new("18")).await.unwrap();

        assert_eq!(ack_rx.next().await.as_deref(), Some("17"));
        assert_eq!(ack_rx.next().await.as_deref(), Some("18"));

        result_tx
            .unbounded_send("10 ops/sec, latency min:1 mean:2 max:3 ms".to_string())
            .unwrap();
        result_tx
            .unbounded_send("20 ops/sec, latency min:1 mean:1 max:2 ms".to_string())
            .unwrap();
        drop(result_tx);

        // The producer hanging up closes the sink.
        let sink = channel.sink().clone();
        sink.closed().await;
        drop(sink);

        let last = channel.finish().await.unwrap();
        assert_eq!(
            last.as_deref(),
            Some("20 ops/sec, latency min:1 mean:1 max:2 ms")
        );
        assert_eq!(ack_rx.next().await, None);
    }
}
