//! Error types shared by the engines, the client and configuration loading.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure inside a frame cycle.
///
/// Every variant ends the session as a protocol violation: the wire format
/// has no resynchronisation marker, so nothing after a bad frame can be trusted.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended part way through a header or body.
    #[error("connection closed mid-frame ({received} of {expected} bytes)")]
    Truncated { received: usize, expected: usize },

    /// Length header is negative or larger than the configured maximum.
    #[error("invalid frame length {0}")]
    InvalidLength(i64),

    /// Payload did not decode as an array message.
    #[error("malformed array payload: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Payload decoded to no values. Its response would carry a zero-length
    /// header, which reads as the end of the session.
    #[error("empty array payload")]
    EmptyArray,

    /// The peer stopped accepting response bytes.
    #[error("write returned 0")]
    WriteZero,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Peer closed at a frame boundary.
    Graceful,
    /// Stream or payload broke mid-frame.
    Violation(FrameError),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}", path = .0.display(), source = .1)]
    FileRead(PathBuf, #[source] io::Error),

    #[error("failed to parse config file '{path}': {source}", path = .0.display(), source = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load-generating client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response payload: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("server closed the connection before responding")]
    Closed,

    #[error("response mismatch at index {index}: expected {expected}, got {actual}")]
    Mismatch {
        index: usize,
        expected: i32,
        actual: i32,
    },

    #[error("response has {actual} values, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_message() {
        let err = FrameError::Truncated {
            received: 10,
            expected: 100,
        };
        assert_eq!(
            err.to_string(),
            "connection closed mid-frame (10 of 100 bytes)"
        );
    }

    #[test]
    fn test_config_file_messages() {
        let err = ConfigError::FileRead(
            PathBuf::from("bench.toml"),
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        assert_eq!(
            err.to_string(),
            "failed to read config file 'bench.toml': no such file"
        );

        let parse_err = toml::from_str::<toml::Value>("port = ").unwrap_err();
        let err = ConfigError::TomlParse(PathBuf::from("bench.toml"), parse_err);
        assert!(err
            .to_string()
            .starts_with("failed to parse config file 'bench.toml': "));
    }

    #[test]
    fn test_empty_array_message() {
        assert_eq!(FrameError::EmptyArray.to_string(), "empty array payload");
    }
}
