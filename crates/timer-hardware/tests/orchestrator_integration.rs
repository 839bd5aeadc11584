//! Poll loop and command surface against a simulated bus.
//!
//! Tests drive `poll_once` directly on paused time where exact sequencing
//! matters, and go through a spawned `TimerHandle` for the command surface.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};

use timer_core::listener::ChannelListener;
use timer_core::protocol::{opcode, NodeMode};
use timer_core::{LapSource, TimerError, TimerEvent};
use timer_hardware::{
    discover, Clock, DiscoveryConfig, Orchestrator, SharedLink, SimNode, SimProcessor,
    SimulatedBus, SimulatorHandle, TransportPolicy,
};

const ADDR: u8 = 8;

async fn setup(processor: SimProcessor) -> (Orchestrator, SimulatorHandle, broadcast::Receiver<TimerEvent>) {
    let bus = SimulatedBus::new("sim").with_processor(ADDR, processor);
    let handle = bus.handle();
    let link = Arc::new(SharedLink::new(Box::new(bus), Duration::ZERO));
    let clock = Clock::new();
    let found = discover(&[link], &DiscoveryConfig::default(), &TransportPolicy::default(), clock).await;

    let (listener, rx) = ChannelListener::new(4096);
    let orchestrator = Orchestrator::new(found.nodes, Arc::new(listener), clock);
    (orchestrator, handle, rx)
}

async fn single() -> (Orchestrator, SimulatorHandle, broadcast::Receiver<TimerEvent>) {
    setup(SimProcessor::new(36).with_node(SimNode::new(5658))).await
}

fn drain(rx: &mut broadcast::Receiver<TimerEvent>) -> Vec<TimerEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

fn is_edge_or_pass(event: &TimerEvent) -> bool {
    matches!(
        event,
        TimerEvent::Enter { .. } | TimerEvent::Exit { .. } | TimerEvent::Pass { .. }
    )
}

fn sample_time(events: &[TimerEvent], value: i32) -> Option<i64> {
    events.iter().find_map(|e| match e {
        TimerEvent::RssiSample { timestamp_ms, rssi, .. } if *rssi == value => Some(*timestamp_ms),
        _ => None,
    })
}

/// Apply `rssi` to the simulated node, then run one poll cycle.
async fn step(orch: &mut Orchestrator, sim: &SimulatorHandle, rssi: u8) {
    tokio::time::advance(Duration::from_millis(100)).await;
    sim.set_rssi(ADDR, 0, rssi);
    orch.poll_once().await;
}

// =============================================================================
// Poll loop
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_crossing_raises_enter_exit_and_pass() {
    let (mut orch, sim, mut rx) = single().await;
    orch.poll_once().await;
    drain(&mut rx);

    step(&mut orch, &sim, 100).await;
    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, TimerEvent::Enter { node: 0, rssi: Some(100), .. })));

    step(&mut orch, &sim, 120).await;
    let peak_events = drain(&mut rx);
    let peak_ms = sample_time(&peak_events, 120).unwrap();
    assert!(!peak_events.iter().any(is_edge_or_pass));

    step(&mut orch, &sim, 60).await;
    let events = drain(&mut rx);
    let edges: Vec<&TimerEvent> = events.iter().filter(|e| is_edge_or_pass(e)).collect();
    assert_eq!(edges.len(), 2);
    assert!(matches!(edges[0], TimerEvent::Exit { node: 0, .. }));
    match edges[1] {
        TimerEvent::Pass {
            node,
            lap_timestamp_ms,
            source,
            rssi,
        } => {
            assert_eq!(*node, 0);
            assert_eq!(*lap_timestamp_ms, peak_ms);
            assert_eq!(*source, LapSource::Realtime);
            assert_eq!(*rssi, Some(120));
        }
        other => panic!("expected pass, got {:?}", other),
    }

    let summary = &orch.snapshot()[0];
    assert_eq!(summary.pass_count, Some(1));
    assert!(!summary.crossing);
}

#[tokio::test(start_paused = true)]
async fn test_lap_is_committed_from_poll_when_stats_read_fails() {
    let (mut orch, sim, mut rx) = single().await;
    orch.poll_once().await;
    step(&mut orch, &sim, 100).await;
    step(&mut orch, &sim, 120).await;
    drain(&mut rx);

    sim.corrupt_command(opcode::READ_LAP_STATS, 1);
    step(&mut orch, &sim, 60).await;
    let events = drain(&mut rx);

    let poll_ms = sample_time(&events, 60).unwrap();
    let pass = events
        .iter()
        .find_map(|e| match e {
            TimerEvent::Pass {
                lap_timestamp_ms,
                rssi,
                ..
            } => Some((*lap_timestamp_ms, *rssi)),
            _ => None,
        })
        .unwrap();
    assert_eq!(pass, (poll_ms, Some(60)));
    assert_eq!(orch.snapshot()[0].pass_count, Some(1));
    assert_eq!(orch.snapshot()[0].io.checksum_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_crossing_between_polls_is_synthesized() {
    let (mut orch, sim, mut rx) = single().await;
    orch.poll_once().await;
    drain(&mut rx);

    sim.set_rssi(ADDR, 0, 110);
    sim.set_rssi(ADDR, 0, 130);
    step(&mut orch, &sim, 50).await;

    let events = drain(&mut rx);
    let kinds: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            TimerEvent::Enter { .. } => Some("enter"),
            TimerEvent::Exit { .. } => Some("exit"),
            TimerEvent::Pass { .. } => Some("pass"),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec!["enter", "exit", "pass"]);
    assert_eq!(orch.snapshot()[0].pass_count, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_failed_poll_is_skipped_and_counted() {
    let (mut orch, sim, mut rx) = single().await;
    orch.poll_once().await;
    drain(&mut rx);

    sim.fail_next(1);
    orch.poll_once().await;
    assert!(!drain(&mut rx)
        .iter()
        .any(|e| matches!(e, TimerEvent::RssiSample { .. })));
    assert_eq!(orch.snapshot()[0].io.read_errors, 1);

    step(&mut orch, &sim, 55).await;
    assert!(sample_time(&drain(&mut rx), 55).is_some());
    assert!(orch.error_report().contains("Node 1"));
}

#[tokio::test(start_paused = true)]
async fn test_sub_nodes_are_polled_through_selection() {
    let (mut orch, sim, mut rx) = setup(
        SimProcessor::new(36)
            .with_node(SimNode::new(5658))
            .with_node(SimNode::new(5695)),
    )
    .await;
    sim.set_rssi(ADDR, 0, 50);
    sim.set_rssi(ADDR, 1, 70);
    orch.poll_once().await;

    let events = drain(&mut rx);
    let samples: Vec<(usize, i32)> = events
        .iter()
        .filter_map(|e| match e {
            TimerEvent::RssiSample { node, rssi, .. } => Some((*node, *rssi)),
            _ => None,
        })
        .collect();
    assert_eq!(samples, vec![(0, 50), (1, 70)]);
    assert!(sim
        .command_log()
        .iter()
        .any(|(_, cmd)| *cmd == opcode::WRITE_CURNODE_INDEX));
}

#[tokio::test(start_paused = true)]
async fn test_untuned_node_is_not_polled() {
    let (mut orch, sim, _rx) = setup(SimProcessor::new(36).with_node(SimNode::new(0))).await;
    sim.clear_log();
    orch.poll_once().await;
    assert!(sim.command_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_race_stop_calibrates_from_race_history() {
    let (mut orch, sim, mut rx) = single().await;
    orch.race_start(None);
    assert!(orch.race().racing);

    let trace: [u8; 29] = [
        40, 42, 39, 41, 60, 90, 118, 95, 60, 43, 40, 44, 41, 70, 100, 122, 99, 65, 42, 41, 45, 40,
        80, 110, 120, 85, 50, 42, 40,
    ];
    for rssi in trace {
        step(&mut orch, &sim, rssi).await;
    }
    let passes = drain(&mut rx)
        .iter()
        .filter(|e| matches!(e, TimerEvent::Pass { .. }))
        .count();
    assert_eq!(passes, 3);

    let applied = orch.race_stop().await;
    assert!(!orch.race().racing);
    assert_eq!(applied.len(), 1);
    let (node, cal) = applied[0];
    assert_eq!(node, 0);
    assert!(cal.enter_at_level > cal.exit_at_level);

    let sim_node = sim.node(ADDR, 0).unwrap();
    assert_eq!(i32::from(sim_node.enter_at_level), cal.enter_at_level);
    assert_eq!(i32::from(sim_node.exit_at_level), cal.exit_at_level);
    let summary = &orch.snapshot()[0];
    assert_eq!(summary.enter_at_level, cal.enter_at_level);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, TimerEvent::Log(msg) if msg.contains("calibrated"))));
}

#[tokio::test(start_paused = true)]
async fn test_race_stop_without_crossings_keeps_levels() {
    let (mut orch, sim, _rx) = single().await;
    orch.race_start(Some(0));
    for rssi in [40, 42, 41, 43, 40] {
        step(&mut orch, &sim, rssi).await;
    }
    assert!(orch.race_stop().await.is_empty());
    assert_eq!(sim.node(ADDR, 0).unwrap().enter_at_level, 96);
}

// =============================================================================
// Command surface
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_commands_through_handle() {
    let (orch, sim, mut rx) = single().await;
    let (handle, task) = orch.spawn();

    assert_eq!(handle.set_frequency(0, 5732).await.unwrap(), 5732);
    assert_eq!(sim.node(ADDR, 0).unwrap().frequency, 5732);

    assert_eq!(handle.set_exit_at_level(0, 70).await.unwrap(), 70);
    assert_eq!(sim.node(ADDR, 0).unwrap().exit_at_level, 70);

    assert!(matches!(
        handle.set_enter_at_level(0, 300).await,
        Err(TimerError::InvalidLevel(300))
    ));
    assert!(matches!(
        handle.set_frequency(9, 5800).await,
        Err(TimerError::InvalidNodeIndex(9))
    ));

    let lap_ms = handle.simulate_lap(0).await.unwrap();
    assert!(lap_ms >= 0);

    assert_eq!(handle.send_status_message(0x01, 0x02).await.unwrap(), 0);
    assert_eq!(sim.node(ADDR, 0).unwrap().last_status, Some(0x0102));

    assert_eq!(handle.read_rssi_history(0).await.unwrap().len(), 16);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, TimerEvent::FrequencyChanged { node: 0, frequency: 5732 })));
    assert!(events
        .iter()
        .any(|e| matches!(e, TimerEvent::ExitTriggerChanged { node: 0, level: 70 })));
    assert!(events.iter().any(|e| matches!(
        e,
        TimerEvent::Pass {
            source: LapSource::Manual,
            rssi: None,
            ..
        }
    )));

    handle.shutdown();
    let report = task.await.unwrap();
    assert!(report.contains("Node 1"));
    assert!(matches!(handle.snapshot().await, Err(TimerError::Shutdown)));
}

#[tokio::test(start_paused = true)]
async fn test_mode_and_force_end_crossing() {
    let (orch, sim, _rx) = single().await;
    let (handle, task) = orch.spawn();

    sim.set_rssi(ADDR, 0, 120);
    assert!(sim.node(ADDR, 0).unwrap().crossing);
    handle.force_end_crossing(0).await.unwrap();
    let node = sim.node(ADDR, 0).unwrap();
    assert!(!node.crossing);
    assert_eq!(node.lap_id, 1);

    assert_eq!(handle.set_mode(0, NodeMode::Scanner).await.unwrap(), NodeMode::Scanner);
    tokio::time::sleep(Duration::from_millis(350)).await;
    let summary = &handle.snapshot().await.unwrap()[0];
    assert_eq!(summary.mode, NodeMode::Scanner);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_level_capture_writes_averaged_levels() {
    let (orch, sim, mut rx) = single().await;
    let (handle, task) = orch.spawn();

    sim.set_rssi(ADDR, 0, 70);
    assert!(handle.start_capture_exit_at_level(0).await.unwrap());
    assert!(!handle.start_capture_exit_at_level(0).await.unwrap());
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(sim.node(ADDR, 0).unwrap().exit_at_level, 70);

    // Enter captures stay clear of the node peak.
    assert!(handle.start_capture_enter_at_level(0).await.unwrap());
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(sim.node(ADDR, 0).unwrap().enter_at_level, 65);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, TimerEvent::ExitTriggerChanged { node: 0, level: 70 })));
    assert!(events
        .iter()
        .any(|e| matches!(e, TimerEvent::EnterTriggerChanged { node: 0, level: 65 })));

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dropping_every_handle_ends_the_loop() {
    let (orch, _sim, mut rx) = single().await;
    let (handle, task) = orch.spawn();
    drop(handle);
    let report = task.await.unwrap();
    assert!(report.starts_with("Node communication statistics"));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, TimerEvent::Log(msg) if msg.starts_with("Polling 1 nodes"))));
}
