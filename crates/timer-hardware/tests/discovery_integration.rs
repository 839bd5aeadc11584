//! Discovery against simulated buses.
//!
//! Every test runs on paused tokio time so retry backoff for empty
//! addresses costs nothing.

use std::sync::Arc;
use std::time::Duration;

use timer_core::protocol::opcode;
use timer_hardware::{
    discover, Clock, DiscoveryConfig, SharedLink, SimNode, SimProcessor, SimulatedBus,
    TransportPolicy,
};

fn shared(bus: SimulatedBus) -> Arc<SharedLink> {
    Arc::new(SharedLink::new(Box::new(bus), Duration::ZERO))
}

async fn run(links: &[Arc<SharedLink>], config: &DiscoveryConfig) -> timer_hardware::Discovery {
    discover(links, config, &TransportPolicy::default(), Clock::new()).await
}

#[tokio::test(start_paused = true)]
async fn test_multi_node_processor_contributes_one_node_per_module() {
    let bus = SimulatedBus::new("bus0")
        .with_processor(
            8,
            SimProcessor::new(36)
                .with_node(SimNode::new(5658).with_slot(4))
                .with_node(SimNode::new(5695).with_slot(5))
                .with_node(SimNode::new(5760).with_slot(6)),
        )
        .with_processor(10, SimProcessor::new(37).with_node(SimNode::new(5800).with_levels(90, 70)));

    let found = run(&[shared(bus)], &DiscoveryConfig::default()).await;

    assert_eq!(found.processors.len(), 2);
    assert_eq!(found.nodes.len(), 4);

    let indices: Vec<usize> = found.nodes.iter().map(|n| n.index()).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    let subs: Vec<Option<u8>> = found.nodes.iter().map(|n| n.state.multi_node_index).collect();
    assert_eq!(subs, vec![Some(0), Some(1), Some(2), None]);

    let slots: Vec<Option<u8>> = found.nodes.iter().map(|n| n.state.slot_index).collect();
    assert_eq!(slots, vec![Some(4), Some(5), Some(6), None]);

    let freqs: Vec<u16> = found.nodes.iter().map(|n| n.state.frequency).collect();
    assert_eq!(freqs, vec![5658, 5695, 5760, 5800]);

    let last = &found.nodes[3];
    assert_eq!(last.state.enter_at_level, 90);
    assert_eq!(last.state.exit_at_level, 70);
    assert_eq!(last.processor().api_level, 37);
}

#[tokio::test(start_paused = true)]
async fn test_processor_info_carries_firmware_strings() {
    let bus = SimulatedBus::new("bus0").with_processor(8, SimProcessor::new(36).with_node(SimNode::new(5658)));
    let found = run(&[shared(bus)], &DiscoveryConfig::default()).await;

    let info = &found.processors[0];
    assert_eq!(info.link, "bus0");
    assert_eq!(info.address, 8);
    assert_eq!(info.node_count, 1);
    assert_eq!(info.firmware_version.as_deref(), Some("1.1.4"));
    assert_eq!(info.firmware_proctype.as_deref(), Some("SIM"));
    assert_eq!(info.firmware_build.as_deref(), Some("Jan 01 2024 12:00:00"));
    assert!(info.to_string().contains("bus0@0x08"));
}

#[tokio::test(start_paused = true)]
async fn test_scan_stops_when_first_address_is_empty() {
    let bus = SimulatedBus::new("bus0").with_processor(10, SimProcessor::new(36).with_node(SimNode::new(5658)));
    let handle = bus.handle();
    let found = run(&[shared(bus)], &DiscoveryConfig::default()).await;

    assert!(found.nodes.is_empty());
    assert!(handle.command_log().iter().all(|(addr, _)| *addr == 8));
}

#[tokio::test(start_paused = true)]
async fn test_full_scan_when_stop_disabled() {
    let bus = SimulatedBus::new("bus0").with_processor(10, SimProcessor::new(36).with_node(SimNode::new(5658)));
    let config = DiscoveryConfig {
        stop_after_first_miss: false,
        ..Default::default()
    };
    let found = run(&[shared(bus)], &config).await;

    assert_eq!(found.nodes.len(), 1);
    assert_eq!(found.processors[0].address, 10);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_multinode_count_falls_back_to_one() {
    let bus = SimulatedBus::new("bus0").with_processor(
        8,
        SimProcessor::new(36)
            .with_node(SimNode::new(5658))
            .with_reported_count(40),
    );
    let found = run(&[shared(bus)], &DiscoveryConfig::default()).await;

    assert_eq!(found.nodes.len(), 1);
    assert_eq!(found.nodes[0].state.multi_node_index, None);
    assert_eq!(found.processors[0].node_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_multinode_count_adds_no_nodes() {
    let bus = SimulatedBus::new("bus0").with_processor(
        8,
        SimProcessor::new(36)
            .with_node(SimNode::new(5658))
            .with_reported_count(0),
    );
    let found = run(&[shared(bus)], &DiscoveryConfig::default()).await;

    assert_eq!(found.processors.len(), 1);
    assert!(found.nodes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unverified_revision_is_rejected() {
    let bus = SimulatedBus::new("bus0").with_processor(
        8,
        SimProcessor::new(36)
            .with_node(SimNode::new(5658))
            .with_revision_marker(0x11),
    );
    let found = run(&[shared(bus)], &DiscoveryConfig::default()).await;
    assert!(found.processors.is_empty());
    assert!(found.nodes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_old_api_level_is_rejected() {
    let bus = SimulatedBus::new("bus0").with_processor(8, SimProcessor::new(35).with_node(SimNode::new(5658)));
    let found = run(&[shared(bus)], &DiscoveryConfig::default()).await;
    assert!(found.nodes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_point_to_point_link_hosts_one_processor() {
    let bus = SimulatedBus::new("usb0")
        .with_processor(8, SimProcessor::new(36).with_node(SimNode::new(5917)))
        .point_to_point();
    let handle = bus.handle();
    let found = run(&[shared(bus)], &DiscoveryConfig::default()).await;

    assert_eq!(found.nodes.len(), 1);
    assert_eq!(found.processors[0].address, 0);
    assert_eq!(found.nodes[0].state.frequency, 5917);
    assert!(!handle
        .command_log()
        .iter()
        .any(|(_, cmd)| *cmd == opcode::READ_ADDRESS));
}

#[tokio::test(start_paused = true)]
async fn test_indices_continue_across_links() {
    let a = SimulatedBus::new("a").with_processor(
        8,
        SimProcessor::new(36)
            .with_node(SimNode::new(5658))
            .with_node(SimNode::new(5695)),
    );
    let b = SimulatedBus::new("b").with_processor(8, SimProcessor::new(36).with_node(SimNode::new(5760)));

    let found = run(&[shared(a), shared(b)], &DiscoveryConfig::default()).await;

    assert_eq!(found.nodes.len(), 3);
    assert_eq!(found.nodes[2].index(), 2);
    assert_eq!(found.nodes[2].processor().link, "b");
    assert_eq!(found.nodes[2].state.frequency, 5760);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_survives_transient_faults() {
    let bus = SimulatedBus::new("bus0").with_processor(8, SimProcessor::new(36).with_node(SimNode::new(5658)));
    let handle = bus.handle();
    handle.corrupt_next(1);
    let found = run(&[shared(bus)], &DiscoveryConfig::default()).await;

    assert_eq!(found.nodes.len(), 1);
    assert_eq!(found.nodes[0].state.frequency, 5658);
}
