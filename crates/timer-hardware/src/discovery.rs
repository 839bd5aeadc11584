//! Node discovery.
//!
//! Addressable links are scanned at the configured bus addresses; a
//! point-to-point link hosts exactly one processor. Each processor must
//! echo its address, carry the revision marker and speak a supported API
//! level. Its multi-node count then decides how many logical nodes it
//! contributes. Node indices are assigned in discovery order and never
//! change afterwards.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use timer_core::protocol::{
    api_level, opcode, MAX_MULTINODE_COUNT, MIN_API_LEVEL, REVISION_VERIFICATION,
};
use timer_core::NodeState;

use crate::link::SharedLink;
use crate::node::Node;
use crate::transport::{Clock, NodeIo, TransportPolicy};

/// Retry budget for discovery reads; a missing device should be cheap.
pub const DISCOVERY_RETRIES: u32 = 2;

/// Where and how to look for processors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Bus addresses probed on addressable links, in order.
    #[serde(default = "default_bus_addresses")]
    pub bus_addresses: Vec<u8>,
    /// Stop scanning a link when the first address yields nothing.
    #[serde(default = "default_stop_after_first_miss")]
    pub stop_after_first_miss: bool,
}

fn default_bus_addresses() -> Vec<u8> {
    (8..=22).step_by(2).collect()
}

fn default_stop_after_first_miss() -> bool {
    true
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bus_addresses: default_bus_addresses(),
            stop_after_first_miss: default_stop_after_first_miss(),
        }
    }
}

/// What a processor reported about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorInfo {
    /// Link the processor lives on.
    pub link: String,
    /// Bus address (0 on point-to-point links).
    pub address: u8,
    /// Protocol API level.
    pub api_level: u8,
    /// Feature flag bits.
    pub feature_flags: u16,
    /// Logical nodes hosted.
    pub node_count: u8,
    /// Firmware version string.
    pub firmware_version: Option<String>,
    /// Processor type string.
    pub firmware_proctype: Option<String>,
    /// Firmware build date and time.
    pub firmware_build: Option<String>,
}

impl std::fmt::Display for ProcessorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{:#04x} api={} nodes={}",
            self.link, self.address, self.api_level, self.node_count
        )?;
        if let Some(version) = &self.firmware_version {
            write!(f, " fw={}", version)?;
        }
        if let Some(proctype) = &self.firmware_proctype {
            write!(f, " ({})", proctype)?;
        }
        Ok(())
    }
}

/// Everything found on a set of links.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Nodes in index order.
    pub nodes: Vec<Node>,
    /// Processors in discovery order.
    pub processors: Vec<Arc<ProcessorInfo>>,
}

/// Discover processors and nodes on every link, in link order.
pub async fn discover(
    links: &[Arc<SharedLink>],
    config: &DiscoveryConfig,
    policy: &TransportPolicy,
    clock: Clock,
) -> Discovery {
    let mut found = Discovery::default();
    for link in links {
        discover_link(link, config, policy, clock, &mut found).await;
    }
    if found.nodes.is_empty() {
        warn!(links = links.len(), "No nodes discovered");
    } else {
        info!(
            nodes = found.nodes.len(),
            processors = found.processors.len(),
            "Discovery complete"
        );
    }
    found
}

async fn discover_link(
    link: &Arc<SharedLink>,
    config: &DiscoveryConfig,
    policy: &TransportPolicy,
    clock: Clock,
    found: &mut Discovery,
) {
    if !link.is_addressable() {
        if let Some(info) = probe_processor(link, 0, policy, clock).await {
            add_processor(link, info, policy, clock, found).await;
        }
        return;
    }

    let before = found.processors.len();
    for &address in &config.bus_addresses {
        let mut io = NodeIo::new(Arc::clone(link), address, None, policy.clone(), clock);
        match io.get_u8(opcode::READ_ADDRESS, DISCOVERY_RETRIES).await {
            Ok(reported) if reported == address => {
                if let Some(info) = probe_processor(link, address, policy, clock).await {
                    add_processor(link, info, policy, clock, found).await;
                }
            }
            Ok(reported) => {
                error!(link = %link.name(), addr = address, reported, "Address mismatch");
            }
            Err(err) => {
                debug!(link = %link.name(), addr = address, %err, "No processor at address");
            }
        }
        if config.stop_after_first_miss && found.processors.len() == before {
            debug!(link = %link.name(), addr = address, "Nothing at first address, stopping scan");
            break;
        }
    }
}

/// Identify the processor at `address`. `None` when it is absent,
/// unverifiable or too old.
pub async fn probe_processor(
    link: &Arc<SharedLink>,
    address: u8,
    policy: &TransportPolicy,
    clock: Clock,
) -> Option<ProcessorInfo> {
    let mut io = NodeIo::new(Arc::clone(link), address, None, policy.clone(), clock);

    let revision = match io.get_u16(opcode::READ_REVISION_CODE, DISCOVERY_RETRIES).await {
        Ok(revision) => revision,
        Err(err) => {
            error!(link = %link.name(), addr = address, %err, "Unable to fetch revision code");
            return None;
        }
    };
    let Some(api_level) = api_level(revision) else {
        error!(
            link = %link.name(),
            addr = address,
            revision = format_args!("{:#06x}", revision),
            expected = format_args!("{:#04x}", REVISION_VERIFICATION),
            "Revision code not verified"
        );
        return None;
    };
    if api_level < MIN_API_LEVEL {
        error!(link = %link.name(), addr = address, api_level, min = MIN_API_LEVEL, "Unsupported node API level");
        return None;
    }

    let feature_flags = io
        .get_u16(opcode::READ_FEATURE_FLAGS, DISCOVERY_RETRIES)
        .await
        .unwrap_or(0);

    let node_count = match io.get_u8(opcode::READ_MULTINODE_COUNT, DISCOVERY_RETRIES).await {
        Ok(count) if count > MAX_MULTINODE_COUNT => {
            error!(link = %link.name(), addr = address, count, "Multi-node count out of range, using 1");
            1
        }
        Ok(count) => count,
        Err(_) => 1,
    };

    let firmware_version = io.read_string(opcode::READ_FW_VERSION, DISCOVERY_RETRIES).await.ok();
    let mut firmware_proctype = None;
    let mut firmware_build = None;
    if firmware_version.is_some() {
        firmware_proctype = io.read_string(opcode::READ_FW_PROCTYPE, DISCOVERY_RETRIES).await.ok();
        let date = io.read_string(opcode::READ_FW_BUILDDATE, DISCOVERY_RETRIES).await.ok();
        let time = io.read_string(opcode::READ_FW_BUILDTIME, DISCOVERY_RETRIES).await.ok();
        firmware_build = match (date, time) {
            (Some(date), Some(time)) => Some(format!("{} {}", date, time)),
            (date, time) => date.or(time),
        };
    }

    Some(ProcessorInfo {
        link: link.name().to_string(),
        address,
        api_level,
        feature_flags,
        node_count,
        firmware_version,
        firmware_proctype,
        firmware_build,
    })
}

async fn add_processor(
    link: &Arc<SharedLink>,
    info: ProcessorInfo,
    policy: &TransportPolicy,
    clock: Clock,
    found: &mut Discovery,
) {
    if info.node_count == 0 {
        warn!(processor = %info, "Processor reports no node modules");
    } else {
        info!(processor = %info, "Processor found");
    }
    let info = Arc::new(info);
    found.processors.push(Arc::clone(&info));

    let multi = info.node_count > 1;
    for sub in 0..info.node_count {
        let sub_index = multi.then_some(sub);
        let io = NodeIo::new(Arc::clone(link), info.address, sub_index, policy.clone(), clock);
        let state = NodeState::new(found.nodes.len(), sub_index);
        let mut node = Node::new(state, io, Arc::clone(&info));

        if multi {
            match node.read_slot_index(DISCOVERY_RETRIES).await {
                Ok(slot) => node.state.slot_index = Some(slot),
                Err(err) => warn!(node = node.index(), sub, %err, "Unable to read slot index"),
            }
        }
        node.load_settings(DISCOVERY_RETRIES).await;
        debug!(
            node = node.index(),
            addr = info.address,
            sub = ?sub_index,
            frequency = node.state.frequency,
            enter = node.state.enter_at_level,
            exit = node.state.exit_at_level,
            "Node added"
        );
        found.nodes.push(node);
    }
}
