//! HTTP server for the producer side of the benchmark.
//!
//! Two listeners:
//! - HTTP: `/session-channel-port` and the `/time` record stream
//! - Acknowledgment channel: WebSocket, one text message per acknowledgment
//!   or cycle result
//!
//! The server owns the session slot and channel registry and hands them to
//! each handler through router state; there is no process-wide state.

use crate::config::{ProducerConfig, ServerConfig};
use crate::producer::{CreditPacedProducer, ProducerState, SessionParams};
use crate::session::{ChannelRegistry, SessionSlot};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::{Bytes, BytesMut};
use futures::{future, stream, Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Largest body chunk assembled from queued records
const MAX_CHUNK_SIZE: usize = 16 * 1024;

/// State shared by every handler.
#[derive(Clone)]
struct AppState {
    producer: ProducerConfig,
    channel_wait: Duration,
    channel_port: u16,
    sessions: Arc<SessionSlot>,
    channels: Arc<ChannelRegistry<WebSocket>>,
}

/// Server instance
pub struct Server {
    http: TcpListener,
    channel: TcpListener,
    state: AppState,
}

impl Server {
    /// Bind both listeners.
    ///
    /// Without an explicit channel address the channel listens on the
    /// HTTP port + 1 (or an ephemeral port when HTTP is ephemeral).
    pub async fn bind(server: ServerConfig, producer: ProducerConfig) -> io::Result<Self> {
        let http_addr = parse_addr(&server.listen)?;
        let http = TcpListener::from_std(create_listener(http_addr)?)?;
        let bound = http.local_addr()?;

        let channel_addr = match server.channel_listen {
            Some(ref addr) => parse_addr(addr)?,
            None if http_addr.port() == 0 => SocketAddr::new(bound.ip(), 0),
            None => SocketAddr::new(bound.ip(), bound.port().wrapping_add(1)),
        };
        let channel = TcpListener::from_std(create_listener(channel_addr)?)?;
        let channel_port = channel.local_addr()?.port();

        Ok(Server {
            http,
            channel,
            state: AppState {
                producer,
                channel_wait: Duration::from_millis(server.channel_wait_ms),
                channel_port,
                sessions: SessionSlot::new(),
                channels: ChannelRegistry::new(),
            },
        })
    }

    pub fn http_addr(&self) -> io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn channel_addr(&self) -> io::Result<SocketAddr> {
        self.channel.local_addr()
    }

    /// Serve both listeners until either fails.
    pub async fn run(self) -> io::Result<()> {
        info!(
            http = %self.http_addr()?,
            channel = %self.channel_addr()?,
            "Server listening"
        );

        let http = axum::serve(self.http, http_router(self.state.clone())).into_future();
        let channel = axum::serve(self.channel, channel_router(self.state)).into_future();
        tokio::try_join!(http, channel)?;
        Ok(())
    }

    #[cfg(test)]
    fn sessions(&self) -> &Arc<SessionSlot> {
        &self.state.sessions
    }
}

fn http_router(state: AppState) -> Router {
    Router::new()
        .route("/session-channel-port", get(channel_port))
        .route("/time", get(start_session))
        .with_state(state)
}

/// Every path on the channel listener upgrades to an acknowledgment channel.
fn channel_router(state: AppState) -> Router {
    Router::new().fallback(accept_channel).with_state(state)
}

async fn channel_port(State(state): State<AppState>) -> String {
    state.channel_port.to_string()
}

async fn accept_channel(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        debug!("Acknowledgment channel connected");
        state.channels.register(socket);
    })
}

/// `/time` query parameters; anything missing falls back to configuration.
#[derive(Debug, Default, Deserialize)]
struct TimeQuery {
    time: Option<u64>,
    cycles: Option<u32>,
    throttle: Option<u32>,
}

impl TimeQuery {
    fn params(&self, defaults: &ProducerConfig) -> SessionParams {
        SessionParams {
            cycle_duration_ms: self.time.unwrap_or(defaults.cycle_duration_ms),
            cycles: self.cycles.unwrap_or(defaults.cycles),
            throttle: self.throttle.unwrap_or(defaults.throttle),
        }
        .normalized()
    }
}

/// Start a session and stream its records as the response body.
async fn start_session(State(state): State<AppState>, Query(query): Query<TimeQuery>) -> Response {
    let params = query.params(&state.producer);

    let guard = match state.sessions.try_acquire() {
        Ok(guard) => guard,
        Err(e) => {
            info!(error = %e, "Rejecting /time request");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let socket = match state.channels.take(state.channel_wait).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "Rejecting /time request");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    info!(
        cycles = params.cycles,
        cycle_duration_ms = params.cycle_duration_ms,
        throttle = params.throttle,
        "Starting session"
    );

    let (output, records) = mpsc::channel(state.producer.write_buffer.max(1));
    let (acks, results) = channel_halves(socket);
    let producer = CreditPacedProducer::new(params, output, acks, results).on_complete(
        move |outcome| {
            debug!(state = ?outcome, "Session complete");
            drop(guard);
        },
    );

    tokio::spawn(async move {
        let outcome = producer.run().await;
        if outcome != ProducerState::Closed {
            warn!(state = ?outcome, "Session ended in unexpected state");
        }
        info!("Session finished");
    });

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(record_stream(records)),
    )
        .into_response()
}

/// Split a channel socket into acknowledgment texts and a result sink.
///
/// The acknowledgment stream ends at the first close frame or socket error.
fn channel_halves(
    socket: WebSocket,
) -> (
    impl Stream<Item = String> + Unpin + Send,
    impl Sink<String, Error = axum::Error> + Unpin + Send,
) {
    let (sink, messages) = socket.split();
    let acks = messages
        .take_while(|message| {
            future::ready(matches!(message, Ok(m) if !matches!(m, Message::Close(_))))
        })
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        });
    let results =
        sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));
    (acks, results)
}

/// Body chunks built from queued records.
///
/// Records already queued are coalesced into one chunk; the stream ends
/// once the producer drops its sender.
fn record_stream(records: mpsc::Receiver<Bytes>) -> impl Stream<Item = io::Result<Bytes>> {
    stream::unfold(records, |mut records| async move {
        let first = records.recv().await?;
        let mut batch = BytesMut::with_capacity(MAX_CHUNK_SIZE);
        batch.extend_from_slice(&first);
        while batch.len() < MAX_CHUNK_SIZE {
            match records.try_recv() {
                Ok(more) => batch.extend_from_slice(&more),
                Err(_) => break,
            }
        }
        Some((Ok(batch.freeze()), records))
    })
}

fn parse_addr(addr: &str) -> io::Result<SocketAddr> {
    addr.parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Create a non-blocking TCP listener with address reuse.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode as HttpStatus;
    use tokio_tungstenite::connect_async;

    fn test_configs() -> (ServerConfig, ProducerConfig) {
        let server = ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            channel_listen: None,
            channel_wait_ms: 1000,
        };
        (server, ProducerConfig::default())
    }

    #[test]
    fn test_session_params_defaults() {
        let query = TimeQuery {
            time: Some(250),
            cycles: None,
            throttle: Some(0),
        };
        let params = query.params(&ProducerConfig::default());
        assert_eq!(params.cycle_duration_ms, 250);
        assert_eq!(params.cycles, 4);
        assert_eq!(params.throttle, 1);
    }

    #[tokio::test]
    async fn test_record_stream_batches_queued_records() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(Bytes::from_static(b"1\n")).await.unwrap();
        tx.send(Bytes::from_static(b"22\n")).await.unwrap();
        drop(tx);

        let chunks: Vec<Bytes> = record_stream(rx)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec![Bytes::from_static(b"1\n22\n")]);
    }

    #[tokio::test]
    async fn test_channel_port_and_routing() {
        let (server_config, producer) = test_configs();
        let server = Server::bind(server_config, producer).await.unwrap();
        let http = server.http_addr().unwrap();
        let channel_port = server.channel_addr().unwrap().port();
        tokio::spawn(server.run());

        let response = reqwest::get(format!("http://{http}/session-channel-port"))
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatus::OK);
        assert_eq!(response.text().await.unwrap(), channel_port.to_string());

        let response = reqwest::get(format!("http://{http}/index.html"))
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatus::NOT_FOUND);

        let response = reqwest::Client::new()
            .post(format!("http://{http}/time"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatus::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_bad_parameter_is_rejected() {
        let (server_config, producer) = test_configs();
        let server = Server::bind(server_config, producer).await.unwrap();
        let http = server.http_addr().unwrap();
        let sessions = Arc::clone(server.sessions());
        tokio::spawn(server.run());

        let response = reqwest::get(format!("http://{http}/time?time=soon"))
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatus::BAD_REQUEST);
        assert!(!sessions.is_active());
    }

    #[tokio::test]
    async fn test_time_without_channel_is_rejected() {
        let (mut server_config, producer) = test_configs();
        server_config.channel_wait_ms = 10;
        let server = Server::bind(server_config, producer).await.unwrap();
        let http = server.http_addr().unwrap();
        let sessions = Arc::clone(server.sessions());
        tokio::spawn(server.run());

        let response = reqwest::get(format!("http://{http}/time?time=10&cycles=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), HttpStatus::SERVICE_UNAVAILABLE);
        assert!(!sessions.is_active());
    }

    #[tokio::test]
    async fn test_second_session_is_rejected() {
        let (server_config, producer) = test_configs();
        let server = Server::bind(server_config, producer).await.unwrap();
        let http = server.http_addr().unwrap();
        let channel_addr = server.channel_addr().unwrap();
        let sessions = Arc::clone(server.sessions());
        tokio::spawn(server.run());

        let (channel, _) = connect_async(format!("ws://{channel_addr}/")).await.unwrap();
        let url = format!("http://{http}/time?time=60000&cycles=1&throttle=4");
        let first = reqwest::get(&url).await.unwrap();
        assert_eq!(first.status(), HttpStatus::OK);
        assert!(sessions.is_active());

        let second = reqwest::get(&url).await.unwrap();
        assert_eq!(second.status(), HttpStatus::SERVICE_UNAVAILABLE);

        // Closing the acknowledgment channel ends the first session.
        drop(channel);
        let body = first.text().await.unwrap();
        assert_eq!(body.lines().count(), 4);
        assert!(body.lines().all(|line| line.parse::<i64>().is_ok()));
        assert!(!sessions.is_active());
    }
}
