//! Links, transport, discovery and polling for race-timer nodes.
//!
//! Layering, bottom up:
//!
//! - [`serial`]: opening serial ports and sockets
//! - [`link`]: framed byte exchange with the chill-time gate
//! - [`transport`]: checksummed register reads/writes with retry
//! - [`simulator`]: an in-process bus of simulated processors
//! - [`node`]: one logical node (state plus transport)
//! - [`discovery`]: finding processors and their nodes
//! - [`orchestrator`]: the poll loop and its command surface
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use timer_hardware::{
//!     discover, Clock, DiscoveryConfig, SharedLink, SimNode, SimProcessor, SimulatedBus,
//!     TransportPolicy,
//! };
//!
//! # tokio_test::block_on(async {
//! let bus = SimulatedBus::new("sim")
//!     .with_processor(8, SimProcessor::new(36).with_node(SimNode::new(5658)));
//! let link = Arc::new(SharedLink::new(Box::new(bus), Duration::ZERO));
//!
//! let found = discover(&[link], &DiscoveryConfig::default(), &TransportPolicy::default(), Clock::new()).await;
//! assert_eq!(found.nodes.len(), 1);
//! assert_eq!(found.nodes[0].state.frequency, 5658);
//! # });
//! ```

pub mod discovery;
pub mod link;
pub mod mock_serial;
pub mod node;
pub mod orchestrator;
pub mod serial;
pub mod simulator;
pub mod transport;

pub use discovery::{discover, Discovery, DiscoveryConfig, ProcessorInfo};
pub use link::{Link, SharedLink, StreamLink};
pub use node::Node;
pub use orchestrator::{CaptureConfig, NodeSummary, Orchestrator, PollConfig, TimerHandle};
pub use simulator::{SimNode, SimProcessor, SimulatedBus, SimulatorHandle, SyntheticSignal};
pub use transport::{Clock, IoStats, NodeIo, RetryPolicy, TransportError, TransportPolicy};
