/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Error types shared by every layer of the messaging stack.

use std::fmt;

/// Error type for port, transport, and driver operations.
///
/// Each failure mode keeps its own variant so callers can distinguish
/// retryable conditions from fatal ones; variants are never collapsed into a
/// generic failure. Filter rejection is deliberately *not* represented here:
/// a rejected message is a successful no-op reported through
/// [`Status::Filtered`](crate::message::Status).
#[derive(Debug, Clone)]
pub enum PortError {
    /// A bounded wait elapsed before a message arrived.
    Timeout,

    /// A zero-timeout poll found no message waiting.
    ///
    /// Distinct from [`PortError::Timeout`]: the caller asked for an
    /// immediate answer and got one.
    Empty,

    /// The transport is closed or no longer usable.
    ///
    /// Raised for sends after close, receives past end-of-stream, and peers
    /// that disappeared mid-conversation.
    Closed,

    /// Payload or header encoding/decoding failure.
    ///
    /// Contains the underlying error message from the serialization library.
    Serialization(String),

    /// Malformed frame, unsupported protocol version, or wire misuse.
    Protocol(String),

    /// Construction-time misconfiguration.
    ///
    /// Unknown transport tag, direction misuse, attaching twice without
    /// `allow_multiple_comms`, wrapping without `allow_threading`, and
    /// similar mistakes that are detectable before any message moves.
    Config(String),

    /// Socket or OS-level I/O error.
    Io(String),
}

impl PortError {
    /// Returns `true` for conditions a caller may simply retry.
    ///
    /// Exactly [`PortError::Timeout`] and [`PortError::Empty`] are
    /// recoverable; everything else indicates the port or its configuration
    /// is unusable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Empty)
    }

    /// Returns `true` when the failure means the transport is gone.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Receive timeout"),
            Self::Empty => write!(f, "No message waiting"),
            Self::Closed => write!(f, "Transport closed"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for PortError {}

impl From<serde_json::Error> for PortError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for PortError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => Self::Closed,
            ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PortError::Config("unknown transport 'smoke'".to_string());
        assert_eq!(err.to_string(), "Configuration error: unknown transport 'smoke'");

        let err = PortError::Empty;
        assert_eq!(err.to_string(), "No message waiting");
    }

    #[test]
    fn test_recoverable_partition() {
        assert!(PortError::Timeout.is_recoverable());
        assert!(PortError::Empty.is_recoverable());
        assert!(!PortError::Closed.is_recoverable());
        assert!(!PortError::Serialization("x".into()).is_recoverable());
        assert!(!PortError::Config("x".into()).is_recoverable());
    }

    #[test]
    fn test_io_error_mapping() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(PortError::from(eof), PortError::Closed));

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(PortError::from(timed_out), PortError::Timeout));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(PortError::from(denied), PortError::Io(_)));
    }

    #[test]
    fn test_serde_error_mapping() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("not json");
        let err = PortError::from(bad.unwrap_err());
        assert!(matches!(err, PortError::Serialization(_)));
    }
}
