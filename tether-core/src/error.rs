//! Domain-specific error types for the tether runtime.
//!
//! All fallible operations return `Result<T, TetherError>`.
//! Termination causes are shared between waiters as `Arc<TetherError>`
//! so every pending call and listener observes the same cause.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The canonical error type for the tether runtime.
#[derive(Debug, Error)]
pub enum TetherError {
    // ── Lifecycle Errors ─────────────────────────────────────────
    /// An outbound operation was attempted on a closed channel, or a
    /// waiter was woken by channel teardown.
    #[error("channel closed{}", .cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
    ChannelClosed {
        /// The cause the channel went down with, if any.
        cause: Option<Arc<TetherError>>,
    },

    /// Internal marker for a processed `Close` command. Reported to
    /// listeners as a clean close (no cause).
    #[error("orderly shutdown")]
    OrderlyShutdown,

    /// The transport failed on read or write.
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] std::io::Error),

    // ── Wire Errors ──────────────────────────────────────────────
    /// A received byte stream could not be turned back into a command.
    ///
    /// Carries the flight-recorder snapshot plus best-effort read-ahead
    /// bytes for post-mortem analysis.
    #[error("stream corruption: {detail} ({} recorded bytes, {} read-ahead bytes)", .recorded.len(), .read_ahead.len())]
    StreamCorruption {
        detail: String,
        recorded: Vec<u8>,
        read_ahead: Vec<u8>,
    },

    /// A logical command exceeded the configured frame limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The handshake preamble was malformed or the peers could not
    /// agree on a mode.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Encoding or decoding of a command or payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── RPC Errors ───────────────────────────────────────────────
    /// `export_table.get` was asked for an OID with no entry.
    #[error("no such exported object: oid {0}")]
    NoSuchObject(u32),

    /// The remote side answered a request with a failure.
    #[error("remote call `{selector}` failed: {remote}")]
    RemoteCallFailed { selector: String, remote: String },

    /// A selector was invoked that the target's interface set does not
    /// declare.
    #[error("selector `{selector}` is not part of the declared interfaces")]
    BadSelector { selector: String },

    // ── Pipe Errors ──────────────────────────────────────────────
    /// The remote end of a pipe announced its consumer is gone, or the
    /// local sink failed.
    #[error("pipe broken: {0}")]
    PipeBroken(String),

    // ── Misc ─────────────────────────────────────────────────────
    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl TetherError {
    /// A `ChannelClosed` error chained to the given termination cause.
    pub fn closed(cause: Option<Arc<TetherError>>) -> Self {
        TetherError::ChannelClosed { cause }
    }

    /// Whether this error means the channel is (or went) down.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            TetherError::ChannelClosed { .. }
                | TetherError::OrderlyShutdown
                | TetherError::ConnectionLost(_)
        )
    }

    /// Whether this is the clean-close marker.
    pub fn is_orderly(&self) -> bool {
        matches!(self, TetherError::OrderlyShutdown)
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for TetherError {
    fn from(s: String) -> Self {
        TetherError::Other(s)
    }
}

impl From<&str> for TetherError {
    fn from(s: &str) -> Self {
        TetherError::Other(s.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for TetherError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        TetherError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_display_chains_cause() {
        let cause = Arc::new(TetherError::ProtocolViolation("bad preamble"));
        let e = TetherError::closed(Some(cause));
        let msg = e.to_string();
        assert!(msg.contains("channel closed"));
        assert!(msg.contains("bad preamble"));

        let bare = TetherError::closed(None);
        assert_eq!(bare.to_string(), "channel closed");
    }

    #[test]
    fn corruption_display_counts_bytes() {
        let e = TetherError::StreamCorruption {
            detail: "unknown discriminant".into(),
            recorded: vec![0u8; 12],
            read_ahead: vec![0u8; 3],
        };
        let msg = e.to_string();
        assert!(msg.contains("12 recorded"));
        assert!(msg.contains("3 read-ahead"));
    }

    #[test]
    fn closed_predicates() {
        assert!(TetherError::closed(None).is_closed());
        assert!(TetherError::OrderlyShutdown.is_closed());
        assert!(TetherError::OrderlyShutdown.is_orderly());
        assert!(!TetherError::NoSuchObject(4).is_closed());
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: TetherError = io_err.into();
        assert!(matches!(e, TetherError::ConnectionLost(_)));
    }

    #[test]
    fn from_string() {
        let e: TetherError = "something broke".into();
        assert!(matches!(e, TetherError::Other(_)));
    }
}
