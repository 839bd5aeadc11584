//! Physical links and the shared-link gate.
//!
//! A [`Link`] moves raw bytes to and from node processors. One link may
//! carry several processors (an addressable bus) and each processor may
//! expose several logical nodes, so every exchange goes through a
//! [`SharedLink`]: an async mutex that serialises access, enforces the
//! minimum quiet time between exchanges and remembers which sub-node each
//! multi-node processor currently has selected.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::serial::{discard_stale, BoxedStream};

/// How long a dirty stream is drained before the next exchange.
const STALE_WINDOW: Duration = Duration::from_millis(10);

// =============================================================================
// Link Trait
// =============================================================================

/// Raw byte transport to one or more node processors.
#[async_trait]
pub trait Link: Send {
    /// Human-readable link name (config id or port path).
    fn name(&self) -> &str;

    /// `true` when `device` selects between processors on this link.
    /// Point-to-point links ignore it.
    fn is_addressable(&self) -> bool {
        false
    }

    /// Send the bare `command` byte to `device` and read exactly
    /// `response_len` bytes back.
    async fn request(&mut self, device: u8, command: u8, response_len: usize) -> io::Result<Vec<u8>>;

    /// Send an encoded frame to `device`. No response is expected.
    async fn send(&mut self, device: u8, frame: &[u8]) -> io::Result<()>;
}

// =============================================================================
// StreamLink
// =============================================================================

/// [`Link`] over a byte stream (serial port, TCP bridge, test duplex).
///
/// After a failed exchange the stream is drained before the next one so a
/// late or partial response is never read as the answer to a new command.
pub struct StreamLink {
    name: String,
    port: BoxedStream,
    read_timeout: Duration,
    addressed: bool,
    dirty: bool,
}

impl StreamLink {
    /// Point-to-point link over `port`.
    pub fn new(name: impl Into<String>, port: BoxedStream, read_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            port,
            read_timeout,
            addressed: false,
            dirty: false,
        }
    }

    /// Prefix every outgoing frame with the device address, for bus
    /// bridges that multiplex several processors on one stream.
    pub fn addressed(mut self, addressed: bool) -> Self {
        self.addressed = addressed;
        self
    }

    async fn flush_stale(&mut self) {
        if !self.dirty {
            return;
        }
        let discarded = discard_stale(&mut self.port, STALE_WINDOW).await;
        if discarded > 0 {
            debug!(link = %self.name, discarded, "Discarded stale bytes");
        }
        self.dirty = false;
    }

    fn header(&self, device: u8) -> Vec<u8> {
        if self.addressed {
            vec![device]
        } else {
            Vec::new()
        }
    }

    async fn exchange(&mut self, out: &[u8], response_len: usize) -> io::Result<Vec<u8>> {
        self.port.write_all(out).await?;
        self.port.flush().await?;
        let mut buf = vec![0u8; response_len];
        match tokio::time::timeout(self.read_timeout, self.port.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no response within {:?}", self.read_timeout),
            )),
        }
    }
}

impl std::fmt::Debug for StreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLink")
            .field("name", &self.name)
            .field("read_timeout", &self.read_timeout)
            .field("addressed", &self.addressed)
            .finish()
    }
}

#[async_trait]
impl Link for StreamLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_addressable(&self) -> bool {
        self.addressed
    }

    async fn request(&mut self, device: u8, command: u8, response_len: usize) -> io::Result<Vec<u8>> {
        self.flush_stale().await;
        let mut out = self.header(device);
        out.push(command);
        let result = self.exchange(&out, response_len).await;
        if result.is_err() {
            self.dirty = true;
        }
        result
    }

    async fn send(&mut self, device: u8, frame: &[u8]) -> io::Result<()> {
        self.flush_stale().await;
        let mut out = self.header(device);
        out.extend_from_slice(frame);
        let result = async {
            self.port.write_all(&out).await?;
            self.port.flush().await
        }
        .await;
        if result.is_err() {
            self.dirty = true;
        }
        result
    }
}

// =============================================================================
// SharedLink
// =============================================================================

/// Link-level exchange counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Exchanges attempted.
    pub exchanges: u64,
    /// Exchanges that failed at the I/O layer.
    pub errors: u64,
}

struct LinkState {
    link: Box<dyn Link>,
    last_exchange: Option<Instant>,
    selected: HashMap<u8, u8>,
    stats: LinkStats,
}

/// A [`Link`] shared by every node that lives on it.
pub struct SharedLink {
    name: String,
    addressable: bool,
    chill_time: Duration,
    state: Mutex<LinkState>,
}

impl SharedLink {
    /// Wrap `link`, enforcing `chill_time` between consecutive exchanges.
    pub fn new(link: Box<dyn Link>, chill_time: Duration) -> Self {
        Self {
            name: link.name().to_string(),
            addressable: link.is_addressable(),
            chill_time,
            state: Mutex::new(LinkState {
                link,
                last_exchange: None,
                selected: HashMap::new(),
                stats: LinkStats::default(),
            }),
        }
    }

    /// Link name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// See [`Link::is_addressable`].
    pub fn is_addressable(&self) -> bool {
        self.addressable
    }

    /// Minimum quiet time between exchanges.
    pub fn chill_time(&self) -> Duration {
        self.chill_time
    }

    /// Take exclusive use of the link. Hold the guard across a sub-node
    /// selection and the exchange it gates.
    pub async fn lock(&self) -> LinkGuard<'_> {
        LinkGuard {
            state: self.state.lock().await,
            chill_time: self.chill_time,
        }
    }

    /// Snapshot of the link counters.
    pub async fn stats(&self) -> LinkStats {
        self.state.lock().await.stats
    }
}

impl std::fmt::Debug for SharedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLink")
            .field("name", &self.name)
            .field("addressable", &self.addressable)
            .field("chill_time", &self.chill_time)
            .finish()
    }
}

/// Exclusive access to a [`SharedLink`].
pub struct LinkGuard<'a> {
    state: MutexGuard<'a, LinkState>,
    chill_time: Duration,
}

impl LinkGuard<'_> {
    async fn gate(&mut self) {
        if let Some(last) = self.state.last_exchange {
            tokio::time::sleep_until(last + self.chill_time).await;
        }
    }

    fn finish<T>(&mut self, result: &io::Result<T>) {
        self.state.last_exchange = Some(Instant::now());
        self.state.stats.exchanges += 1;
        if result.is_err() {
            self.state.stats.errors += 1;
        }
    }

    /// Gated [`Link::request`].
    pub async fn request(&mut self, device: u8, command: u8, response_len: usize) -> io::Result<Vec<u8>> {
        self.gate().await;
        let result = self.state.link.request(device, command, response_len).await;
        self.finish(&result);
        result
    }

    /// Gated [`Link::send`].
    pub async fn send(&mut self, device: u8, frame: &[u8]) -> io::Result<()> {
        self.gate().await;
        let result = self.state.link.send(device, frame).await;
        self.finish(&result);
        result
    }

    /// Sub-node last selected on processor `device`, if known.
    pub fn selected(&self, device: u8) -> Option<u8> {
        self.state.selected.get(&device).copied()
    }

    /// Record (or forget) the selected sub-node of processor `device`.
    pub fn set_selected(&mut self, device: u8, sub_index: Option<u8>) {
        match sub_index {
            Some(sub) => {
                self.state.selected.insert(device, sub);
            }
            None => {
                self.state.selected.remove(&device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::{self, frame};

    #[tokio::test]
    async fn test_stream_link_request() {
        let (port, mut harness) = mock_serial::new();
        let mut link = StreamLink::new("mock", Box::new(port), Duration::from_millis(200));

        let task = tokio::spawn(async move { link.request(0, 0x04, 4).await });
        harness.exchange(&[0x04], &frame(&[80, 3, 0])).await;

        assert_eq!(task.await.unwrap().unwrap(), vec![80, 3, 0, 83]);
    }

    #[tokio::test]
    async fn test_stream_link_addressed_prefix() {
        let (port, mut harness) = mock_serial::new();
        let mut link = StreamLink::new("bridge", Box::new(port), Duration::from_millis(200)).addressed(true);
        assert!(link.is_addressable());

        let task = tokio::spawn(async move { link.send(10, &[0x51, 0x16, 0x1a, 0x81]).await });
        harness.expect_command(&[10, 0x51, 0x16, 0x1a, 0x81]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stream_link_timeout_then_drains() {
        let (port, mut harness) = mock_serial::new();
        let mut link = StreamLink::new("mock", Box::new(port), Duration::from_millis(50));

        let task = tokio::spawn(async move {
            let first = link.request(0, 0x22, 3).await;
            let second = link.request(0, 0x22, 3).await;
            (first, second)
        });

        harness.expect_command(&[0x22]).await;
        // Too short: the read times out with one byte buffered.
        harness.reply(&[0x25]).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        harness.expect_command(&[0x22]).await;
        harness.reply(&frame(&[0x25, 0x24])).unwrap();

        let (first, second) = task.await.unwrap();
        assert_eq!(first.unwrap_err().kind(), io::ErrorKind::TimedOut);
        assert_eq!(second.unwrap(), vec![0x25, 0x24, 0x49]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_link_enforces_chill_time() {
        let (port, mut harness) = mock_serial::new();
        let link = StreamLink::new("mock", Box::new(port), Duration::from_secs(1));
        let shared = SharedLink::new(Box::new(link), Duration::from_millis(20));

        let device = tokio::spawn(async move {
            harness.expect_command(&[0x52, 0x01, 0x53]).await;
            harness.expect_command(&[0x52, 0x00, 0x52]).await;
        });

        let start = Instant::now();
        let mut guard = shared.lock().await;
        guard.send(0, &[0x52, 0x01, 0x53]).await.unwrap();
        guard.send(0, &[0x52, 0x00, 0x52]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        drop(guard);

        device.await.unwrap();
        assert_eq!(shared.stats().await, LinkStats { exchanges: 2, errors: 0 });
    }

    #[tokio::test]
    async fn test_selected_sub_node_tracking() {
        let (port, _harness) = mock_serial::new();
        let shared = SharedLink::new(
            Box::new(StreamLink::new("mock", Box::new(port), Duration::from_millis(10))),
            Duration::ZERO,
        );
        let mut guard = shared.lock().await;
        assert_eq!(guard.selected(8), None);
        guard.set_selected(8, Some(2));
        assert_eq!(guard.selected(8), Some(2));
        assert_eq!(guard.selected(10), None);
        guard.set_selected(8, None);
        assert_eq!(guard.selected(8), None);
    }
}
