//! Core types and algorithms for race-timer.
//!
//! Everything here is pure logic: no sockets, no serial ports, no tasks.
//! The hardware crate drives these types from its poll loop.
//!
//! - [`codec`]: checksummed frames and big-endian field packing
//! - [`protocol`]: node opcodes and response layouts
//! - [`extremum`]: streaming peak/nadir filter
//! - [`history`]: compacted RSSI history
//! - [`crossing`]: crossing/lap reconciliation
//! - [`homology`]: peak persistence
//! - [`calibration`]: trigger-level calibration and capture
//! - [`node`]: per-node state
//! - [`listener`]: event surface

pub mod calibration;
pub mod codec;
pub mod crossing;
pub mod error;
pub mod extremum;
pub mod history;
pub mod homology;
pub mod listener;
pub mod node;
pub mod protocol;

pub use error::{CodecError, TimerError, TimerResult};
pub use listener::{LapSource, TimerEvent, TimerListener};
pub use node::NodeState;
