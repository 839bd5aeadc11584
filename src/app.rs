//! Wiring from configuration to a running timer.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use timer_core::listener::TracingListener;
use timer_core::TimerListener;
use timer_hardware::link::StreamLink;
use timer_hardware::serial::{connect_socket, BoxedStream};
use timer_hardware::{
    discover, Clock, Discovery, Orchestrator, SharedLink, SimNode, SimProcessor, SimulatedBus,
    SimulatorHandle, SyntheticSignal, TimerHandle,
};

use crate::config::{LinkConfig, LinkKind, TimerConfig};

/// Raceband channel frequencies handed out to simulated nodes.
pub const RACEBAND: [u16; 8] = [5658, 5695, 5732, 5769, 5806, 5843, 5880, 5917];

/// Nodes hosted by each simulated processor.
const SIM_NODES_PER_PROCESSOR: usize = 4;

/// Open every enabled link.
pub async fn open_links(config: &TimerConfig) -> anyhow::Result<Vec<Arc<SharedLink>>> {
    let mut links = Vec::new();
    for link in config.enabled_links() {
        let stream = open_stream(link, config).await?;
        let stream_link = StreamLink::new(link.id.clone(), stream, config.transport.read_timeout())
            .addressed(link.addressable);
        info!(link = %link.id, kind = ?link.kind, addressable = link.addressable, "Link open");
        links.push(Arc::new(SharedLink::new(
            Box::new(stream_link),
            config.transport.chill_time(),
        )));
    }
    if links.is_empty() {
        warn!("No enabled links configured");
    }
    Ok(links)
}

async fn open_stream(link: &LinkConfig, config: &TimerConfig) -> anyhow::Result<BoxedStream> {
    match link.kind {
        LinkKind::Serial => {
            let path = link
                .path
                .as_deref()
                .with_context(|| format!("Serial link '{}' has no path", link.id))?;
            open_serial(path, link.baud_rate, &link.id).await
        }
        LinkKind::Socket => {
            let address = link
                .address
                .as_deref()
                .with_context(|| format!("Socket link '{}' has no address", link.id))?;
            connect_socket(address, config.transport.read_timeout() * 10, &link.id).await
        }
    }
}

#[cfg(feature = "serial")]
async fn open_serial(path: &str, baud_rate: u32, link_id: &str) -> anyhow::Result<BoxedStream> {
    timer_hardware::serial::open_serial(path, baud_rate, link_id).await
}

#[cfg(not(feature = "serial"))]
async fn open_serial(path: &str, _baud_rate: u32, link_id: &str) -> anyhow::Result<BoxedStream> {
    bail!(
        "Serial link '{}' ({}) requires the 'serial' feature",
        link_id,
        path
    )
}

/// A simulated track with `nodes` nodes, each seeing a pass every few
/// seconds.
///
/// ```
/// use race_timer::{app, config::TimerConfig, timer_hardware::Clock};
///
/// # tokio_test::block_on(async {
/// let config = TimerConfig::default();
/// let (links, _sim) = app::simulated_links(5, &config);
/// let found = app::discover_nodes(&links, &config, Clock::new()).await;
/// assert_eq!(found.processors.len(), 2);
/// # });
/// ```
pub fn simulated_links(nodes: usize, config: &TimerConfig) -> (Vec<Arc<SharedLink>>, SimulatorHandle) {
    let mut bus = SimulatedBus::new("sim");
    let addresses = config.discovery.bus_addresses.iter().copied();
    for (chunk, address) in (0..nodes)
        .collect::<Vec<_>>()
        .chunks(SIM_NODES_PER_PROCESSOR)
        .zip(addresses)
    {
        let mut processor = SimProcessor::new(36);
        for &i in chunk {
            let step = i64::try_from(i).unwrap_or(0);
            let signal = SyntheticSignal {
                period_ms: 4000 + 350 * step,
                phase_ms: 500 * step,
                floor: 45,
                peak: 130,
                width_ms: 600,
            };
            processor = processor.with_node(
                SimNode::new(RACEBAND[i % RACEBAND.len()])
                    .with_slot(u8::try_from(i).unwrap_or(0))
                    .with_signal(signal),
            );
        }
        bus = bus.with_processor(address, processor);
    }
    let handle = bus.handle();
    let link = Arc::new(SharedLink::new(Box::new(bus), config.transport.chill_time()));
    (vec![link], handle)
}

/// Discover nodes on `links` with the configured policy.
pub async fn discover_nodes(links: &[Arc<SharedLink>], config: &TimerConfig, clock: Clock) -> Discovery {
    discover(links, &config.discovery, &config.transport.policy(), clock).await
}

/// Discover, build the orchestrator and spawn its loop.
pub async fn start(
    links: &[Arc<SharedLink>],
    config: &TimerConfig,
    listener: Option<Arc<dyn TimerListener>>,
) -> anyhow::Result<(TimerHandle, JoinHandle<String>)> {
    let clock = Clock::new();
    let found = discover_nodes(links, config, clock).await;
    if found.nodes.is_empty() {
        bail!("No nodes discovered on {} link(s)", links.len());
    }
    let listener = listener.unwrap_or_else(|| Arc::new(TracingListener));
    listener.on_log(&format!(
        "Discovered {} nodes on {} processors",
        found.nodes.len(),
        found.processors.len()
    ));

    let orchestrator = Orchestrator::new(found.nodes, listener, clock)
        .with_poll_config(config.polling.clone())
        .with_capture_config(config.calibration.capture())
        .with_calibration(config.calibration.policy());
    Ok(orchestrator.spawn())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_simulated_track_is_discoverable() {
        let config = TimerConfig::default();
        let (links, _sim) = simulated_links(6, &config);
        let found = discover_nodes(&links, &config, Clock::new()).await;

        assert_eq!(found.processors.len(), 2);
        assert_eq!(found.nodes.len(), 6);
        assert_eq!(found.nodes[5].state.frequency, RACEBAND[5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_without_nodes() {
        let config = TimerConfig::default();
        let (links, _sim) = simulated_links(0, &config);
        assert!(start(&links, &config, None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_race() {
        let config = TimerConfig::default();
        let (links, _sim) = simulated_links(2, &config);
        let (handle, task) = start(&links, &config, None).await.unwrap();

        handle.race_start(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|s| s.pass_count.unwrap_or(0) >= 1));

        handle.race_stop().await.unwrap();
        handle.shutdown();
        assert!(task.await.unwrap().contains("Node 2"));
    }

    #[tokio::test]
    async fn test_open_links_skips_disabled() {
        let mut config = TimerConfig::default();
        config.links.push(LinkConfig {
            id: "off".to_string(),
            kind: LinkKind::Socket,
            path: None,
            address: Some("127.0.0.1:1".to_string()),
            baud_rate: 115_200,
            addressable: false,
            enabled: false,
        });
        assert!(open_links(&config).await.unwrap().is_empty());
    }
}
