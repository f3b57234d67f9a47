//! Error types for tick-relay.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, toml::de::Error),
}

/// Reasons a benchmark session could not be started
#[derive(Error, Debug)]
pub enum SessionError {
    /// Another session already owns the producer.
    #[error("A benchmark session is already active")]
    Busy,

    /// No acknowledgment channel was connected when the stream was requested.
    #[error("No acknowledgment channel connected")]
    NoChannel,
}

/// An acknowledgment that could not be attributed to a record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("Malformed acknowledgment: {0:?}")]
    Malformed(String),

    /// Echoed timestamp lies after the time it was received.
    #[error("Acknowledgment from the future: {timestamp} > {now}")]
    FromFuture { timestamp: i64, now: i64 },
}

/// Wire format errors in what the producer sent back
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed result message: {0:?}")]
    ResultMessage(String),

    #[error("Invalid channel port: {0:?}")]
    ChannelPort(String),

    #[error("Invalid target address: {0:?}")]
    Target(String),
}

/// Orchestrator-level errors
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unexpected HTTP status {status} from {path}")]
    Status { status: u16, path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AckError::Malformed("abc".to_string());
        assert_eq!(err.to_string(), "Malformed acknowledgment: \"abc\"");

        let err = AckError::FromFuture {
            timestamp: 20,
            now: 10,
        };
        assert_eq!(err.to_string(), "Acknowledgment from the future: 20 > 10");

        let err = BenchError::Status {
            status: 500,
            path: "/time".to_string(),
        };
        assert_eq!(err.to_string(), "Unexpected HTTP status 500 from /time");

        let err = ConfigError::FileRead(
            PathBuf::from("/nope.toml"),
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert_eq!(
            err.to_string(),
            "Failed to read config file '/nope.toml': missing"
        );
    }
}
