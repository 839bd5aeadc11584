//! Error types shared by the timing core.
//!
//! `TimerError` covers the failures the pure logic can report. Transport
//! failures are modelled separately in the hardware crate and folded into
//! [`TimerError::Transport`] when they cross the command surface.
//!
//! Wire decoding has its own small [`CodecError`] so parsers stay free of
//! the wider error type.

use thiserror::Error;

// =============================================================================
// Codec Errors
// =============================================================================

/// Failures while decoding a frame or a fixed-width payload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Trailing checksum byte does not match the sum of the preceding bytes.
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum {
        /// Checksum computed over the received body.
        expected: u8,
        /// Checksum byte carried by the frame.
        actual: u8,
    },

    /// Payload shorter than the field being decoded.
    #[error("truncated payload: need {expected} bytes, have {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Frame has no bytes at all.
    #[error("empty frame")]
    Empty,
}

// =============================================================================
// Timer Errors
// =============================================================================

/// Primary error type for the timing core.
#[derive(Error, Debug)]
pub enum TimerError {
    /// Semantically invalid configuration value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// `RssiHistory::set` called with mismatched slices.
    #[error("history length mismatch: {times} timestamps, {values} values")]
    HistoryLengthMismatch {
        /// Number of timestamps supplied.
        times: usize,
        /// Number of values supplied.
        values: usize,
    },

    /// A command referenced a node that does not exist.
    #[error("invalid node index {0}")]
    InvalidNodeIndex(usize),

    /// Trigger level outside the valid RSSI range.
    #[error("invalid RSSI level {0}")]
    InvalidLevel(i32),

    /// Decoding failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Transport gave up on a request.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The orchestrator is no longer running.
    #[error("timer orchestrator has shut down")]
    Shutdown,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the timing crates.
pub type TimerResult<T> = Result<T, TimerError>;
