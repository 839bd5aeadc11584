//! In-memory stand-in for a node processor on the far end of a serial port.
//!
//! [`mock_serial::new`](new) returns a [`MockSerialPort`], handed to the
//! link under test, and a [`MockDeviceHarness`] that the test drives in the
//! role of the node firmware: it checks each command the link writes and
//! answers with whatever bytes the test scripts, well-formed or not.
//!
//! ```rust,ignore
//! let (port, mut node) = mock_serial::new();
//! let mut link = StreamLink::new("mock", Box::new(port), Duration::from_millis(100));
//! let task = tokio::spawn(async move { link.request(0, opcode::READ_RSSI, 4).await });
//! node.exchange(&[opcode::READ_RSSI], &frame(&[80, 3, 0])).await;
//! ```

#![allow(clippy::panic)]

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout, Duration};

/// How long the harness waits for the link to write a command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Link side of the pair.
#[derive(Debug)]
pub struct MockSerialPort {
    to_node: UnboundedSender<u8>,
    from_node: UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    cursor: usize,
}

/// Node side of the pair.
#[derive(Debug)]
pub struct MockDeviceHarness {
    from_link: UnboundedReceiver<u8>,
    to_link: UnboundedSender<Vec<u8>>,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (to_node, from_link) = mpsc::unbounded_channel();
    let (to_link, from_node) = mpsc::unbounded_channel();
    (
        MockSerialPort {
            to_node,
            from_node,
            pending: Vec::new(),
            cursor: 0,
        },
        MockDeviceHarness { from_link, to_link },
    )
}

/// A response payload followed by its checksum byte.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = payload.to_vec();
    out.push(timer_core::codec::checksum(payload));
    out
}

impl MockSerialPort {
    fn take_pending(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.pending.len() - self.cursor);
        buf.put_slice(&self.pending[self.cursor..self.cursor + n]);
        self.cursor += n;
        if self.cursor == self.pending.len() {
            self.pending.clear();
            self.cursor = 0;
        }
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match self.from_node.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => self.pending = bytes,
                // Node hung up: end of stream.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.take_pending(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        for &byte in buf {
            if self.to_node.send(byte).is_err() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "mock node disconnected",
                )));
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Queue bytes for the link to read.
    pub fn reply(&self, bytes: &[u8]) -> Result<(), &'static str> {
        self.to_link
            .send(bytes.to_vec())
            .map_err(|_| "mock port dropped")
    }

    /// Wait for the link to write exactly `expected` next.
    ///
    /// # Panics
    /// If the bytes differ, the port is dropped, or nothing arrives within
    /// two seconds.
    pub async fn expect_command(&mut self, expected: &[u8]) {
        let mut seen = Vec::with_capacity(expected.len());
        while seen.len() < expected.len() {
            match timeout(COMMAND_TIMEOUT, self.from_link.recv()).await {
                Ok(Some(byte)) => seen.push(byte),
                Ok(None) => panic!("mock port dropped after {:02x?}", seen),
                Err(_) => panic!("expected {:02x?}, link wrote only {:02x?}", expected, seen),
            }
        }
        assert_eq!(seen, expected, "unexpected command bytes");
    }

    /// Expect a command, then answer it with `response` as given.
    pub async fn exchange(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_command(expected).await;
        if let Err(e) = self.reply(response) {
            panic!("{}", e);
        }
    }

    /// Throw away anything the link has written so far.
    pub async fn discard_written(&mut self) {
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), self.from_link.recv()).await {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rssi_exchange() {
        let (mut port, mut node) = new();

        let link = tokio::spawn(async move {
            port.write_all(&[0x04]).await.unwrap();
            let mut buf = [0u8; 4];
            port.read_exact(&mut buf).await.unwrap();
            buf
        });

        node.exchange(&[0x04], &frame(&[80, 3, 0])).await;
        assert_eq!(link.await.unwrap(), [80, 3, 0, 83]);
    }

    #[tokio::test]
    async fn test_response_split_across_reads() {
        let (mut port, node) = new();
        node.reply(&[0x25]).unwrap();
        node.reply(&[0x24, 0x49]).unwrap();

        let mut buf = [0u8; 3];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x25, 0x24, 0x49]);
    }

    #[tokio::test]
    async fn test_silent_node_times_out() {
        let (mut port, mut node) = new();

        let link = tokio::spawn(async move {
            port.write_all(&[0x22]).await.unwrap();
            let mut buf = [0u8; 3];
            timeout(Duration::from_millis(100), port.read_exact(&mut buf)).await
        });

        node.expect_command(&[0x22]).await;
        assert!(link.await.unwrap().is_err());
    }
}
