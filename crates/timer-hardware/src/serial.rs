//! Opening the byte streams that node links run over.
//!
//! Anything that is `AsyncRead + AsyncWrite` can carry node frames: a
//! USB/UART port to a node processor, a TCP connection to a network
//! bridge, or a duplex pipe in tests.

use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

/// A byte stream a [`StreamLink`](crate::link::StreamLink) can drive.
pub trait NodeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> NodeStream for T {}

/// Boxed [`NodeStream`].
pub type BoxedStream = Box<dyn NodeStream>;

/// Open a node processor port at `baud_rate`, 8N1, no flow control.
///
/// The open itself may block on some platforms, so it is moved onto the
/// blocking pool.
#[cfg(feature = "serial")]
pub async fn open_serial(path: &str, baud_rate: u32, link: &str) -> anyhow::Result<BoxedStream> {
    use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

    let builder = tokio_serial::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None);
    let description = format!("{} ({} @ {} baud)", link, path, baud_rate);

    let port = tokio::task::spawn_blocking(move || builder.open_native_async())
        .await
        .context("Serial open task failed")?
        .with_context(|| format!("Failed to open serial link {}", description))?;
    Ok(Box::new(port))
}

/// Connect to a node bridge over TCP with Nagle disabled.
pub async fn connect_socket(
    address: &str,
    connect_timeout: Duration,
    link: &str,
) -> anyhow::Result<BoxedStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
        .await
        .with_context(|| format!("Link {}: no answer from {}", link, address))?
        .with_context(|| format!("Link {}: cannot connect to {}", link, address))?;
    stream
        .set_nodelay(true)
        .with_context(|| format!("Link {}: cannot disable Nagle", link))?;
    Ok(Box::new(stream))
}

/// Swallow bytes that trickle in during `window`, so a late reply to a
/// failed exchange is never parsed as the start of the next one. Returns
/// the byte count discarded.
pub async fn discard_stale<R: AsyncRead + Unpin>(stream: &mut R, window: Duration) -> usize {
    let deadline = Instant::now() + window;
    let mut scratch = [0u8; 64];
    let mut discarded = 0;
    while let Ok(Ok(n)) = timeout_at(deadline, stream.read(&mut scratch)).await {
        if n == 0 {
            break;
        }
        discarded += n;
    }
    discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_discard_stale() {
        let (mut node, mut host) = tokio::io::duplex(64);
        node.write_all(&[0x04, 0x50, 0x01]).await.unwrap();

        assert_eq!(discard_stale(&mut host, Duration::from_millis(50)).await, 3);
        assert_eq!(discard_stale(&mut host, Duration::from_millis(20)).await, 0);
    }

    #[tokio::test]
    async fn test_boxed_duplex_is_a_node_stream() {
        let (mut node, host) = tokio::io::duplex(16);
        let mut stream: BoxedStream = Box::new(host);
        node.write_all(&[0x25, 0x24]).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x25, 0x24]);
    }

    #[tokio::test]
    async fn test_connect_socket_refused_names_link() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = connect_socket(&addr, Duration::from_millis(500), "bridge")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("bridge"));
    }
}
