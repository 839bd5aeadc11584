//! Per-node request/response transport.
//!
//! [`NodeIo`] is the only way node traffic reaches a link. It frames and
//! validates blocks, retries transient failures under a [`RetryPolicy`],
//! selects the right sub-node on multi-node processors before every
//! exchange, timestamps responses from the measured round trip and keeps
//! the per-node [`IoStats`] shown to operators.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use timer_core::codec::{strip_checksum, unpack_u16, unpack_u8, ChecksumScope, Frame};
use timer_core::protocol::{opcode, parse_text_block, size};
use timer_core::{CodecError, TimerError};

use crate::link::{LinkGuard, SharedLink};

// =============================================================================
// Errors
// =============================================================================

/// Failure of a single node exchange.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Link-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No response within the link read timeout.
    #[error("timed out waiting for response to {command:#04x}")]
    Timeout {
        /// Command that went unanswered.
        command: u8,
    },

    /// Response failed checksum validation.
    #[error("checksum error on {command:#04x}: {source}")]
    Checksum {
        /// Command whose response was corrupt.
        command: u8,
        /// Decoder detail.
        #[source]
        source: CodecError,
    },

    /// Response had the wrong number of bytes.
    #[error("bad response length for {command:#04x}: expected {expected}, got {actual}")]
    BadLength {
        /// Command issued.
        command: u8,
        /// Bytes expected including checksum.
        expected: usize,
        /// Bytes received.
        actual: usize,
    },

    /// Response passed the checksum but its fields did not decode.
    #[error("malformed response to {command:#04x}: {source}")]
    Malformed {
        /// Command issued.
        command: u8,
        /// Decoder detail.
        #[source]
        source: CodecError,
    },

    /// Node reported a value outside the register's range.
    #[error("unexpected value {value} from {command:#04x}")]
    Unexpected {
        /// Command issued.
        command: u8,
        /// Raw value reported.
        value: u8,
    },

    /// Multi-node processor would not switch to the requested sub-node.
    #[error("failed to select sub-node {sub_index}")]
    SelectFailed {
        /// Sub-node that could not be selected.
        sub_index: u8,
    },

    /// Every attempt failed.
    #[error("{command:#04x} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Command issued.
        command: u8,
        /// Attempts made, including the first.
        attempts: u32,
        /// Error from the final attempt.
        last: Box<TransportError>,
    },
}

impl TransportError {
    /// `true` for a checksum failure, directly or as the last retry.
    pub fn is_checksum(&self) -> bool {
        match self {
            Self::Checksum { .. } => true,
            Self::RetriesExhausted { last, .. } => last.is_checksum(),
            _ => false,
        }
    }

    fn from_io(command: u8, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            Self::Timeout { command }
        } else {
            Self::Io(err)
        }
    }
}

impl From<TransportError> for TimerError {
    fn from(err: TransportError) -> Self {
        TimerError::Transport(err.to_string())
    }
}

/// Result alias for node exchanges.
pub type TransportResult<T> = Result<T, TransportError>;

// =============================================================================
// Policy
// =============================================================================

/// How many times to retry a failed exchange and how long to wait between
/// attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. 0 disables retries.
    pub max_attempts: u32,
    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_delay: Duration::from_millis(25),
        }
    }
}

/// Transport settings shared by every node on a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportPolicy {
    /// Retry budget for ordinary reads and writes.
    pub retry: RetryPolicy,
    /// Retry budget for sub-node selection.
    pub select_max_retries: u32,
    /// Bytes covered by the outgoing checksum.
    pub checksum_scope: ChecksumScope,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            select_max_retries: 10,
            checksum_scope: ChecksumScope::Frame,
        }
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Monotonic millisecond clock shared by every node so timestamps from
/// different links are comparable.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Clock whose zero is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the epoch.
    pub fn now_ms(&self) -> i64 {
        self.ms_at(Instant::now())
    }

    /// Milliseconds from the epoch to `instant`.
    pub fn ms_at(&self, instant: Instant) -> i64 {
        i64::try_from(instant.saturating_duration_since(self.epoch).as_millis()).unwrap_or(i64::MAX)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-node exchange counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStats {
    /// Read attempts.
    pub reads: u64,
    /// Write attempts.
    pub writes: u64,
    /// Reads that failed with I/O, timeout or length errors.
    pub read_errors: u64,
    /// Reads that failed checksum validation.
    pub checksum_errors: u64,
    /// Writes that failed.
    pub write_errors: u64,
    /// Sub-node selections that exhausted their retries.
    pub select_errors: u64,
    /// Round trip of the last successful read.
    pub last_roundtrip_ms: i64,
    /// Longest successful round trip.
    pub max_roundtrip_ms: i64,
}

impl IoStats {
    /// All failures counted.
    pub fn total_errors(&self) -> u64 {
        self.read_errors + self.checksum_errors + self.write_errors + self.select_errors
    }

    /// One-line summary for operators.
    pub fn error_report(&self) -> String {
        let failed_reads = self.read_errors + self.checksum_errors;
        let pct = if self.reads > 0 {
            failed_reads as f64 * 100.0 / self.reads as f64
        } else {
            0.0
        };
        format!(
            "{} of {} reads failed ({:.2}%, {} checksum), {} of {} writes failed, {} select failures",
            failed_reads,
            self.reads,
            pct,
            self.checksum_errors,
            self.write_errors,
            self.writes,
            self.select_errors
        )
    }

    fn record_roundtrip(&mut self, ms: i64) {
        self.last_roundtrip_ms = ms;
        self.max_roundtrip_ms = self.max_roundtrip_ms.max(ms);
    }
}

// =============================================================================
// NodeIo
// =============================================================================

/// Transport handle for one logical node (or a processor, before its
/// nodes are known).
#[derive(Debug)]
pub struct NodeIo {
    link: Arc<SharedLink>,
    device: u8,
    sub_index: Option<u8>,
    policy: TransportPolicy,
    clock: Clock,
    stats: IoStats,
}

impl NodeIo {
    /// Handle for `device` on `link`. `sub_index` is set for nodes that
    /// share a multi-node processor.
    pub fn new(
        link: Arc<SharedLink>,
        device: u8,
        sub_index: Option<u8>,
        policy: TransportPolicy,
        clock: Clock,
    ) -> Self {
        Self {
            link,
            device,
            sub_index,
            policy,
            clock,
            stats: IoStats::default(),
        }
    }

    /// The link this node lives on.
    pub fn link(&self) -> &Arc<SharedLink> {
        &self.link
    }

    /// Processor address on the link.
    pub fn device(&self) -> u8 {
        self.device
    }

    /// Sub-node on a multi-node processor.
    pub fn sub_index(&self) -> Option<u8> {
        self.sub_index
    }

    /// Transport settings.
    pub fn policy(&self) -> &TransportPolicy {
        &self.policy
    }

    /// Default retry budget for this node.
    pub fn max_retries(&self) -> u32 {
        self.policy.retry.max_attempts
    }

    /// The shared clock.
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Exchange counters.
    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Read a `size`-byte block. Returns the payload with the checksum
    /// stripped.
    pub async fn read_block(&mut self, command: u8, size: usize, max_retries: u32) -> TransportResult<Vec<u8>> {
        self.read_timed(command, size, max_retries)
            .await
            .map(|(payload, _)| payload)
    }

    /// Like [`read_block`](Self::read_block), also returning the estimated
    /// time (clock milliseconds) at which the node produced the response:
    /// the response time minus half the round trip.
    pub async fn read_timed(
        &mut self,
        command: u8,
        size: usize,
        max_retries: u32,
    ) -> TransportResult<(Vec<u8>, i64)> {
        let link = Arc::clone(&self.link);
        let mut guard = link.lock().await;
        self.ensure_selected(&mut guard).await?;
        self.read_locked(&mut guard, command, size, max_retries).await
    }

    /// Write `command ++ data ++ checksum`. Only I/O failures are retried.
    pub async fn write_block(&mut self, command: u8, data: &[u8], max_retries: u32) -> TransportResult<()> {
        let link = Arc::clone(&self.link);
        let mut guard = link.lock().await;
        self.ensure_selected(&mut guard).await?;
        self.write_locked(&mut guard, command, data, max_retries).await
    }

    /// Read a `u8` register.
    pub async fn get_u8(&mut self, command: u8, max_retries: u32) -> TransportResult<u8> {
        let payload = self.read_block(command, 1, max_retries).await?;
        unpack_u8(&payload).map_err(|source| TransportError::Malformed { command, source })
    }

    /// Read a big-endian `u16` register.
    pub async fn get_u16(&mut self, command: u8, max_retries: u32) -> TransportResult<u16> {
        let payload = self.read_block(command, 2, max_retries).await?;
        unpack_u16(&payload).map_err(|source| TransportError::Malformed { command, source })
    }

    /// Write a `u8` register.
    pub async fn set_u8(&mut self, command: u8, value: u8) -> TransportResult<()> {
        let retries = self.max_retries();
        self.write_block(command, &[value], retries).await
    }

    /// Write a big-endian `u16` register.
    pub async fn set_u16(&mut self, command: u8, value: u16) -> TransportResult<()> {
        let retries = self.max_retries();
        self.write_block(command, &value.to_be_bytes(), retries).await
    }

    /// Write `value`, read it back through `read_command` and repeat until
    /// they agree or `max_retries` is spent. Returns the value the node
    /// last reported, which differs from `value` when validation failed.
    pub async fn set_and_validate_u8(
        &mut self,
        write_command: u8,
        read_command: u8,
        value: u8,
        max_retries: u32,
    ) -> TransportResult<u8> {
        let got = self
            .set_and_validate(write_command, read_command, &[value], max_retries)
            .await?;
        unpack_u8(&got).map_err(|source| TransportError::Malformed {
            command: read_command,
            source,
        })
    }

    /// `u16` flavour of [`set_and_validate_u8`](Self::set_and_validate_u8).
    pub async fn set_and_validate_u16(
        &mut self,
        write_command: u8,
        read_command: u8,
        value: u16,
        max_retries: u32,
    ) -> TransportResult<u16> {
        let got = self
            .set_and_validate(write_command, read_command, &value.to_be_bytes(), max_retries)
            .await?;
        unpack_u16(&got).map_err(|source| TransportError::Malformed {
            command: read_command,
            source,
        })
    }

    /// Read a NUL-padded text register.
    pub async fn read_string(&mut self, command: u8, max_retries: u32) -> TransportResult<String> {
        let payload = self.read_block(command, size::TEXT_BLOCK, max_retries).await?;
        Ok(parse_text_block(&payload))
    }

    async fn set_and_validate(
        &mut self,
        write_command: u8,
        read_command: u8,
        data: &[u8],
        max_retries: u32,
    ) -> TransportResult<Vec<u8>> {
        let retries = self.max_retries();
        let mut attempt = 0;
        loop {
            self.write_block(write_command, data, retries).await?;
            let got = self.read_block(read_command, data.len(), retries).await?;
            if got == data {
                return Ok(got);
            }
            if attempt >= max_retries {
                warn!(
                    link = %self.link.name(),
                    addr = self.device,
                    sub = ?self.sub_index,
                    cmd = write_command,
                    wanted = ?data,
                    got = ?got,
                    "Value not accepted by node"
                );
                return Ok(got);
            }
            attempt += 1;
            debug!(addr = self.device, cmd = write_command, retry = attempt, "Read back mismatch, rewriting");
        }
    }

    async fn ensure_selected(&mut self, guard: &mut LinkGuard<'_>) -> TransportResult<()> {
        let Some(sub) = self.sub_index else {
            return Ok(());
        };
        if guard.selected(self.device) == Some(sub) {
            return Ok(());
        }
        guard.set_selected(self.device, None);

        let retries = self.max_retries();
        for attempt in 0..=self.policy.select_max_retries {
            if attempt > 0 {
                self.log_retry("select", opcode::WRITE_CURNODE_INDEX, attempt, None);
                tokio::time::sleep(self.policy.retry.backoff_delay).await;
            }
            if self
                .write_locked(guard, opcode::WRITE_CURNODE_INDEX, &[sub], retries)
                .await
                .is_err()
            {
                continue;
            }
            match self
                .read_locked(guard, opcode::READ_CURNODE_INDEX, 1, retries)
                .await
            {
                Ok((payload, _)) if payload.first() == Some(&sub) => {
                    guard.set_selected(self.device, Some(sub));
                    return Ok(());
                }
                Ok((payload, _)) => {
                    debug!(addr = self.device, sub, reported = ?payload.first(), "Sub-node selection not confirmed");
                }
                Err(_) => {}
            }
        }

        self.stats.select_errors += 1;
        warn!(
            link = %self.link.name(),
            addr = self.device,
            sub,
            retries = self.policy.select_max_retries,
            "Unable to select sub-node"
        );
        Err(TransportError::SelectFailed { sub_index: sub })
    }

    async fn read_locked(
        &mut self,
        guard: &mut LinkGuard<'_>,
        command: u8,
        size: usize,
        max_retries: u32,
    ) -> TransportResult<(Vec<u8>, i64)> {
        let expected = size + 1;
        let mut attempt = 0;
        loop {
            self.stats.reads += 1;
            let started = Instant::now();
            let result = match guard.request(self.device, command, expected).await {
                Ok(raw) if raw.len() != expected => Err(TransportError::BadLength {
                    command,
                    expected,
                    actual: raw.len(),
                }),
                Ok(raw) => strip_checksum(&raw)
                    .map(<[u8]>::to_vec)
                    .map_err(|source| TransportError::Checksum { command, source }),
                Err(err) => Err(TransportError::from_io(command, err)),
            };

            match result {
                Ok(payload) => {
                    let finished = Instant::now();
                    let roundtrip_ms = finished.duration_since(started).as_secs_f64() * 1000.0;
                    self.stats.record_roundtrip(roundtrip_ms.round() as i64);
                    let sent_ms = self.clock.ms_at(finished) - (roundtrip_ms / 2.0).round() as i64;
                    return Ok((payload, sent_ms));
                }
                Err(err) => {
                    if err.is_checksum() {
                        self.stats.checksum_errors += 1;
                    } else {
                        self.stats.read_errors += 1;
                    }
                    if attempt >= max_retries {
                        return Err(self.give_up("read", command, attempt, max_retries, err));
                    }
                    attempt += 1;
                    self.log_retry("read", command, attempt, Some(&err));
                    tokio::time::sleep(self.policy.retry.backoff_delay).await;
                }
            }
        }
    }

    async fn write_locked(
        &mut self,
        guard: &mut LinkGuard<'_>,
        command: u8,
        data: &[u8],
        max_retries: u32,
    ) -> TransportResult<()> {
        let bytes = Frame::new(command, data.to_vec()).encode(self.policy.checksum_scope);
        let mut attempt = 0;
        loop {
            self.stats.writes += 1;
            match guard.send(self.device, &bytes).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    self.stats.write_errors += 1;
                    let err = TransportError::from_io(command, err);
                    if attempt >= max_retries {
                        return Err(self.give_up("write", command, attempt, max_retries, err));
                    }
                    attempt += 1;
                    self.log_retry("write", command, attempt, Some(&err));
                    tokio::time::sleep(self.policy.retry.backoff_delay).await;
                }
            }
        }
    }

    fn log_retry(&self, op: &str, command: u8, attempt: u32, err: Option<&TransportError>) {
        let err = err.map(ToString::to_string);
        if attempt <= 1 {
            debug!(link = %self.link.name(), addr = self.device, sub = ?self.sub_index, op, cmd = command, retry = attempt, ?err, "Retrying");
        } else {
            warn!(link = %self.link.name(), addr = self.device, sub = ?self.sub_index, op, cmd = command, retry = attempt, ?err, "Retrying");
        }
    }

    fn give_up(
        &self,
        op: &str,
        command: u8,
        attempt: u32,
        max_retries: u32,
        err: TransportError,
    ) -> TransportError {
        if max_retries == 0 {
            debug!(link = %self.link.name(), addr = self.device, op, cmd = command, %err, "Exchange failed");
            return err;
        }
        warn!(
            link = %self.link.name(),
            addr = self.device,
            sub = ?self.sub_index,
            op,
            cmd = command,
            %err,
            "Retry limit reached"
        );
        TransportError::RetriesExhausted {
            command,
            attempts: attempt + 1,
            last: Box::new(err),
        }
    }
}
