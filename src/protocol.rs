//! Wire formats spoken between producer and consumer.
//!
//! - Records: `<timestampMs>\n` lines inside a chunked HTTP body
//! - Acknowledgments: the bare timestamp echoed as a WebSocket text message
//! - Results: `"<ops> ops/sec, latency min:<min> mean:<mean> max:<max> ms"`

use crate::error::{AckError, ProtocolError};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::str::FromStr;

/// Append one record line for `timestamp_ms`.
pub fn encode_record(timestamp_ms: i64, out: &mut BytesMut) {
    out.put_slice(timestamp_ms.to_string().as_bytes());
    out.put_u8(b'\n');
}

/// Parse an acknowledgment message back into the timestamp it echoes.
pub fn parse_ack(message: &str) -> Result<i64, AckError> {
    let trimmed = message.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AckError::Malformed(message.to_string()));
    }
    trimmed
        .parse()
        .map_err(|_| AckError::Malformed(message.to_string()))
}

/// Aggregate figures for one completed measurement cycle.
///
/// All values are truncated toward zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub throughput: i64,
    pub latency_min: i64,
    pub latency_mean: i64,
    pub latency_max: i64,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ops/sec, latency min:{} mean:{} max:{} ms",
            self.throughput, self.latency_min, self.latency_mean, self.latency_max
        )
    }
}

impl FromStr for CycleReport {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ProtocolError::ResultMessage(s.to_string());

        let (throughput, rest) = s.trim().split_once(" ops/sec, latency ").ok_or_else(err)?;
        let rest = rest.strip_suffix(" ms").ok_or_else(err)?;

        let mut fields = rest.split(' ');
        let mut field = |name: &str| -> Result<i64, ProtocolError> {
            fields
                .next()
                .and_then(|f| f.strip_prefix(name))
                .and_then(|v| v.parse().ok())
                .ok_or_else(err)
        };

        let report = CycleReport {
            throughput: throughput.parse().map_err(|_| err())?,
            latency_min: field("min:")?,
            latency_mean: field("mean:")?,
            latency_max: field("max:")?,
        };
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_record() {
        let mut buf = BytesMut::new();
        encode_record(1700000000123, &mut buf);
        encode_record(7, &mut buf);
        assert_eq!(&buf[..], b"1700000000123\n7\n");
    }

    #[test]
    fn test_parse_ack() {
        assert_eq!(parse_ack("1700000000123"), Ok(1700000000123));
        assert_eq!(parse_ack(" 42\n"), Ok(42));
        assert!(parse_ack("").is_err());
        assert!(parse_ack("12ab").is_err());
        assert!(parse_ack("-5").is_err());
        assert!(parse_ack("1.5").is_err());
        assert!(parse_ack("99999999999999999999").is_err());
    }

    #[test]
    fn test_cycle_report_format() {
        let report = CycleReport {
            throughput: 12345,
            latency_min: 1,
            latency_mean: 3,
            latency_max: 17,
        };
        let text = report.to_string();
        assert_eq!(text, "12345 ops/sec, latency min:1 mean:3 max:17 ms");
        assert_eq!(text.parse::<CycleReport>(), Ok(report));
    }

    #[test]
    fn test_cycle_report_rejects_garbage() {
        assert!("hello".parse::<CycleReport>().is_err());
        assert!("1 ops/sec, latency min:1 mean:x max:3 ms"
            .parse::<CycleReport>()
            .is_err());
        assert!("1 ops/sec, latency min:1 mean:2 max:3"
            .parse::<CycleReport>()
            .is_err());
    }
}
