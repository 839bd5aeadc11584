//! Node wire protocol: opcodes, modes and response payload layouts.
//!
//! All multi-byte fields are big-endian. Response sizes below exclude the
//! trailing checksum byte.

use serde::{Deserialize, Serialize};

use crate::codec::PayloadReader;
use crate::error::CodecError;

/// Command opcodes understood by node firmware.
pub mod opcode {
    /// Node bus address.
    pub const READ_ADDRESS: u8 = 0x01;
    /// Current operating mode.
    pub const READ_MODE: u8 = 0x02;
    /// Tuned frequency (MHz).
    pub const READ_FREQUENCY: u8 = 0x03;
    /// RSSI, lap counter, crossing flag.
    pub const READ_RSSI: u8 = 0x04;
    /// Last lap statistics.
    pub const READ_LAP_STATS: u8 = 0x08;
    /// Last enter-crossing statistics.
    pub const READ_ENTER_STATS: u8 = 0x09;
    /// Last exit-crossing statistics.
    pub const READ_EXIT_STATS: u8 = 0x10;
    /// Feature flag word.
    pub const READ_FEATURE_FLAGS: u8 = 0x11;
    /// Revision code (verification byte + API level).
    pub const READ_REVISION_CODE: u8 = 0x22;
    /// Node peak/nadir RSSI.
    pub const READ_RSSI_STATS: u8 = 0x23;
    /// Lifetime, loop time and extremum history.
    pub const READ_ANALYTICS: u8 = 0x24;
    /// Raw RSSI history block.
    pub const READ_RSSI_HISTORY: u8 = 0x25;
    /// Frequency scan samples.
    pub const READ_SCAN_HISTORY: u8 = 0x26;
    /// Enter-at trigger level.
    pub const READ_ENTER_AT_LEVEL: u8 = 0x31;
    /// Exit-at trigger level.
    pub const READ_EXIT_AT_LEVEL: u8 = 0x32;
    /// Node clock in milliseconds.
    pub const READ_TIME_MILLIS: u8 = 0x33;
    /// Number of receiver modules on a processor.
    pub const READ_MULTINODE_COUNT: u8 = 0x39;
    /// Currently selected sub-node.
    pub const READ_CURNODE_INDEX: u8 = 0x3A;
    /// Physical slot of the selected sub-node.
    pub const READ_NODE_SLOTIDX: u8 = 0x3C;
    /// Firmware version string.
    pub const READ_FW_VERSION: u8 = 0x3D;
    /// Firmware build date string.
    pub const READ_FW_BUILDDATE: u8 = 0x3E;
    /// Firmware build time string.
    pub const READ_FW_BUILDTIME: u8 = 0x3F;
    /// Processor type string.
    pub const READ_FW_PROCTYPE: u8 = 0x40;

    /// Set frequency.
    pub const WRITE_FREQUENCY: u8 = 0x51;
    /// Set operating mode.
    pub const WRITE_MODE: u8 = 0x52;
    /// Set enter-at level.
    pub const WRITE_ENTER_AT_LEVEL: u8 = 0x71;
    /// Set exit-at level.
    pub const WRITE_EXIT_AT_LEVEL: u8 = 0x72;
    /// Status message (type in high byte, data in low byte).
    pub const SEND_STATUS_MESSAGE: u8 = 0x75;
    /// End an in-progress crossing.
    pub const FORCE_END_CROSSING: u8 = 0x78;
    /// Select sub-node on a multi-node processor.
    pub const WRITE_CURNODE_INDEX: u8 = 0x7A;
}

/// Response payload sizes (checksum excluded).
pub mod size {
    /// `READ_RSSI`
    pub const RSSI: usize = 3;
    /// `READ_LAP_STATS`
    pub const LAP_STATS: usize = 5;
    /// `READ_ENTER_STATS` / `READ_EXIT_STATS`
    pub const CROSSING_STATS: usize = 5;
    /// `READ_RSSI_STATS`
    pub const RSSI_STATS: usize = 2;
    /// `READ_ANALYTICS`
    pub const ANALYTICS: usize = 8;
    /// `READ_RSSI_HISTORY`
    pub const RSSI_HISTORY: usize = 16;
    /// `READ_SCAN_HISTORY`
    pub const SCAN_HISTORY: usize = 9;
    /// `READ_FW_*` text blocks
    pub const TEXT_BLOCK: usize = 16;
}

/// Status message types for `SEND_STATUS_MESSAGE`.
pub mod status {
    /// Shutdown button state (1 pressed, 0 released).
    pub const SHUTDOWN_BUTTON_STATE: u8 = 0x01;
    /// System shutdown started.
    pub const SHUTDOWN_STARTED: u8 = 0x02;
    /// Server idle tick.
    pub const SERVER_IDLE: u8 = 0x03;
}

/// Bits of the `READ_FEATURE_FLAGS` word.
pub mod feature {
    /// 32-bit processor hosting several receiver modules.
    pub const STM32_MODE: u16 = 0x0004;
    /// Jump-to-bootloader supported.
    pub const JUMPTO_BOOTLOADER: u16 = 0x0008;
    /// In-application firmware programming supported.
    pub const IAP_FIRMWARE: u16 = 0x0010;
    /// On-node persistent homology.
    pub const PEAK_HOMOLOGY: u16 = 0x0100;
}

/// High byte every valid revision code carries.
pub const REVISION_VERIFICATION: u8 = 0x25;
/// Lowest node API level this timer drives.
pub const MIN_API_LEVEL: u8 = 36;
/// Largest sensible multi-node count; anything above is a bad read.
pub const MAX_MULTINODE_COUNT: u8 = 32;
/// Upper bound (exclusive) for a valid RSSI reading.
pub const MAX_RSSI: i32 = 255;
/// Lap counter width on the wire.
pub const PASS_COUNT_MASK: u8 = 0xFF;

/// Returns `true` for readings inside `(0, MAX_RSSI)`.
pub fn is_valid_rssi(value: i32) -> bool {
    value > 0 && value < MAX_RSSI
}

/// Decode a revision code into an API level. Returns `None` when the
/// verification byte does not match.
pub fn api_level(revision_code: u16) -> Option<u8> {
    let [high, low] = revision_code.to_be_bytes();
    (high == REVISION_VERIFICATION).then_some(low)
}

/// Node operating mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    /// Normal lap timing.
    #[default]
    Timer,
    /// Frequency scanner.
    Scanner,
    /// Raw RSSI history streaming.
    RssiHistory,
}

impl NodeMode {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            NodeMode::Timer => 0,
            NodeMode::Scanner => 1,
            NodeMode::RssiHistory => 2,
        }
    }
}

impl TryFrom<u8> for NodeMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeMode::Timer),
            1 => Ok(NodeMode::Scanner),
            2 => Ok(NodeMode::RssiHistory),
            other => Err(other),
        }
    }
}

// =============================================================================
// Response payloads
// =============================================================================

/// `READ_RSSI` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiReading {
    /// Current RSSI.
    pub rssi: u8,
    /// Node lap counter (wraps at 256).
    pub lap_id: u8,
    /// Node believes a drone is inside the gate.
    pub crossing: bool,
}

impl RssiReading {
    /// Parse a 3-byte payload.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = PayloadReader::new(data);
        Ok(Self {
            rssi: r.u8()?,
            lap_id: r.u8()?,
            crossing: r.u8()? == 1,
        })
    }
}

/// `READ_LAP_STATS` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LapStats {
    /// Lap counter the stats belong to.
    pub lap_id: u8,
    /// Milliseconds between the lap and the response.
    pub ms_since: u16,
    /// Peak RSSI during the pass.
    pub peak_rssi: u8,
    /// Nadir RSSI since the previous pass.
    pub nadir_rssi: u8,
}

impl LapStats {
    /// Parse a 5-byte payload.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = PayloadReader::new(data);
        Ok(Self {
            lap_id: r.u8()?,
            ms_since: r.u16()?,
            peak_rssi: r.u8()?,
            nadir_rssi: r.u8()?,
        })
    }
}

/// `READ_ENTER_STATS` / `READ_EXIT_STATS` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossingStats {
    /// Lap counter at the time of the crossing edge.
    pub count: u8,
    /// Milliseconds between the edge and the response.
    pub ms_since: u16,
    /// RSSI at the edge.
    pub rssi: u8,
    /// Peak lifetime at the edge.
    pub lifetime: u8,
}

impl CrossingStats {
    /// Parse a 5-byte payload.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = PayloadReader::new(data);
        Ok(Self {
            count: r.u8()?,
            ms_since: r.u16()?,
            rssi: r.u8()?,
            lifetime: r.u8()?,
        })
    }
}

/// `READ_RSSI_STATS` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiStats {
    /// Highest RSSI seen by the node.
    pub peak: u8,
    /// Lowest RSSI seen by the node.
    pub nadir: u8,
}

impl RssiStats {
    /// Parse a 2-byte payload.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = PayloadReader::new(data);
        Ok(Self {
            peak: r.u8()?,
            nadir: r.u8()?,
        })
    }
}

/// `READ_ANALYTICS` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Analytics {
    /// Signed lifetime of the current extremum.
    pub lifetime: i8,
    /// Firmware main-loop time in microseconds.
    pub loop_time_us: u16,
    /// RSSI of the oldest unsent extremum (0 when none).
    pub extremum_rssi: u8,
    /// Milliseconds since the extremum first appeared.
    pub extremum_ms_since: u16,
    /// How long the extremum lasted.
    pub extremum_duration_ms: u16,
}

impl Analytics {
    /// Parse an 8-byte payload.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = PayloadReader::new(data);
        Ok(Self {
            lifetime: r.i8()?,
            loop_time_us: r.u16()?,
            extremum_rssi: r.u8()?,
            extremum_ms_since: r.u16()?,
            extremum_duration_ms: r.u16()?,
        })
    }
}

/// One `(frequency, rssi)` sample of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSample {
    /// Frequency in MHz.
    pub frequency: u16,
    /// RSSI at that frequency.
    pub rssi: u8,
}

/// Parse a `READ_SCAN_HISTORY` payload; zero-frequency slots are skipped.
pub fn parse_scan_history(data: &[u8]) -> Result<Vec<ScanSample>, CodecError> {
    let mut r = PayloadReader::new(data);
    let mut out = Vec::with_capacity(3);
    while r.remaining() >= 3 {
        let frequency = r.u16()?;
        let rssi = r.u8()?;
        if frequency > 0 {
            out.push(ScanSample { frequency, rssi });
        }
    }
    Ok(out)
}

/// Decode a NUL-padded UTF-8 text block.
pub fn parse_text_block(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}
