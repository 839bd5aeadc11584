//! # race-timer
//!
//! Multi-node drone race timing. Node processors report RSSI and crossing
//! state over serial ports or TCP bridges; this crate polls them, turns the
//! reports into enter/exit/lap events and recalibrates trigger levels after
//! each race.
//!
//! ## Crate Structure
//!
//! - **`timer_core`** (re-exported): wire codec, crossing reconciliation,
//!   persistent homology and calibration. Pure logic.
//! - **`timer_hardware`** (re-exported): links, transport with retry,
//!   discovery, the simulated bus and the poll orchestrator.
//! - **`config`**: Figment-backed [`config::TimerConfig`].
//! - **`logging`**: tracing subscriber setup.
//! - **`app`**: wiring from configuration to a running orchestrator.
//! - **`analyze`**: offline persistence analysis of recorded RSSI traces.

pub mod analyze;
pub mod app;
pub mod config;
pub mod logging;

pub use timer_core;
pub use timer_hardware;
