//! In-memory streams and a recording handler for exercising handshakes
//! without real network connections.

use std::{
    collections::VecDeque,
    io,
    net::{Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Waker},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{AssociatePacketChannel, ConnectionMetadata, Handler, ProxyStream};

/// Local address reported by streams from [`create_mock_stream`].
pub const MOCK_LOCAL_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1080);

/// A mock implementation of a bidirectional stream that can be used for testing
/// asynchronous network code without requiring actual network connections.
#[derive(Debug)]
pub struct MockStream {
    rx: Arc<Mutex<SharedState>>,
    tx: Arc<Mutex<SharedState>>,
    local_addr: SocketAddr,
}

/// Internal shared state for the stream's read and write buffers.
#[derive(Debug, Default)]
struct SharedState {
    buffer: VecDeque<u8>,
    closed: bool,
    waker: Option<Waker>,
}

impl SharedState {
    fn push(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "writing to a closed stream",
            ));
        }

        self.buffer.extend(data.iter().copied());
        self.wake();
        Ok(data.len())
    }

    fn close(&mut self) {
        self.closed = true;
        self.wake();
    }

    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Creates a pair of connected mock streams.
///
/// Data written to one stream can be read from the other. Both report
/// [`MOCK_LOCAL_ADDR`] as their local address.
pub fn create_mock_stream() -> (MockStream, MockStream) {
    let state1 = Arc::new(Mutex::new(SharedState::default()));
    let state2 = Arc::new(Mutex::new(SharedState::default()));

    // read from state1, write to state2
    let stream1 = MockStream {
        rx: state1.clone(),
        tx: state2.clone(),
        local_addr: MOCK_LOCAL_ADDR,
    };

    // read from state2, write to state1
    let stream2 = MockStream {
        rx: state2,
        tx: state1,
        local_addr: MOCK_LOCAL_ADDR,
    };

    (stream1, stream2)
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut rx = self.rx.lock().unwrap();

        if !rx.buffer.is_empty() {
            let to_read = std::cmp::min(buf.remaining(), rx.buffer.len());
            let chunk: Vec<u8> = rx.buffer.drain(..to_read).collect();
            buf.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else if rx.closed {
            // EOF
            Poll::Ready(Ok(()))
        } else {
            rx.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.tx.lock().unwrap().push(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.lock().unwrap().close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        // The peer reads EOF, like a closed socket
        if let Ok(mut tx) = self.tx.lock() {
            tx.close();
        }
    }
}

impl ProxyStream for MockStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

impl MockStream {
    /// Overrides the reported local address.
    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }

    /// Immediately writes data to the stream without using async operations.
    pub fn write_immediate(&self, data: &[u8]) -> io::Result<usize> {
        self.tx.lock().unwrap().push(data)
    }

    /// Immediately reads all available data from the stream without waiting.
    pub fn read_available(&self) -> io::Result<Vec<u8>> {
        let mut rx = self.rx.lock().unwrap();
        Ok(rx.buffer.drain(..).collect())
    }

    /// Closes the writing end, so the peer reads EOF once it drains the buffer.
    pub fn close_write(&self) {
        self.tx.lock().unwrap().close();
    }

    /// Checks if the peer has shut down its writing end.
    pub fn is_closed(&self) -> bool {
        self.rx.lock().unwrap().closed
    }
}

/// Everything a [`RecordingHandler`] has been handed.
#[derive(Debug)]
pub struct HandlerEvents<S> {
    #[allow(missing_docs)]
    pub streams: mpsc::UnboundedReceiver<(S, ConnectionMetadata)>,
    #[allow(missing_docs)]
    pub channels: mpsc::UnboundedReceiver<(Arc<AssociatePacketChannel>, ConnectionMetadata)>,
    #[allow(missing_docs)]
    pub errors: mpsc::UnboundedReceiver<io::Error>,
}

/// A [`Handler`] that forwards whatever it receives to a [`HandlerEvents`].
///
/// Datagram channels are shared with the test, and the hand-off returns once
/// the channel is closed.
#[derive(Debug)]
pub struct RecordingHandler<S> {
    streams: mpsc::UnboundedSender<(S, ConnectionMetadata)>,
    channels: mpsc::UnboundedSender<(Arc<AssociatePacketChannel>, ConnectionMetadata)>,
    errors: mpsc::UnboundedSender<io::Error>,
    fail_channels: AtomicBool,
}

impl<S> RecordingHandler<S> {
    /// Makes `handle_datagram_channel` fail with "relay failed".
    pub fn fail_channels(&self) {
        self.fail_channels.store(true, Ordering::SeqCst);
    }
}

/// Creates a recording handler and the receiving side of its events.
pub fn recording_handler<S>() -> (Arc<RecordingHandler<S>>, HandlerEvents<S>) {
    let (streams_tx, streams) = mpsc::unbounded_channel();
    let (channels_tx, channels) = mpsc::unbounded_channel();
    let (errors_tx, errors) = mpsc::unbounded_channel();

    let handler = RecordingHandler {
        streams: streams_tx,
        channels: channels_tx,
        errors: errors_tx,
        fail_channels: AtomicBool::new(false),
    };
    let events = HandlerEvents {
        streams,
        channels,
        errors,
    };
    (Arc::new(handler), events)
}

#[async_trait]
impl<S> Handler<S> for RecordingHandler<S>
where
    S: Send + 'static,
{
    async fn handle_stream(
        &self,
        _cancel: CancellationToken,
        stream: S,
        metadata: ConnectionMetadata,
    ) -> io::Result<()> {
        self.streams
            .send((stream, metadata))
            .map_err(|_| io::Error::other("events dropped"))
    }

    async fn handle_datagram_channel(
        &self,
        _cancel: CancellationToken,
        channel: AssociatePacketChannel,
        metadata: ConnectionMetadata,
    ) -> io::Result<()> {
        if self.fail_channels.load(Ordering::SeqCst) {
            return Err(io::Error::other("relay failed"));
        }

        // Stay in the relay until the association is closed
        let channel = Arc::new(channel);
        self.channels
            .send((channel.clone(), metadata))
            .map_err(|_| io::Error::other("events dropped"))?;
        channel.closed().await;
        Ok(())
    }

    fn handle_error(&self, err: io::Error) {
        let _ = self.errors.send(err);
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_basic_read_write() {
        let (mut stream1, mut stream2) = create_mock_stream();

        let data = b"Hello, world!";
        let write_len = stream1.write(data).await.unwrap();
        assert_eq!(write_len, data.len());

        let mut buf = vec![0u8; 20];
        let read_len = stream2.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..read_len], data);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (mut stream1, mut stream2) = create_mock_stream();

        stream1.write_all(b"Last message").await.unwrap();
        stream1.shutdown().await.unwrap();

        let mut buf = vec![0u8; 20];
        let read_len = stream2.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..read_len], b"Last message");

        let read_len = stream2.read(&mut buf).await.unwrap();
        assert_eq!(read_len, 0);
        assert!(stream2.is_closed());

        let err = stream1.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_drop_closes_peer() {
        let (stream1, mut stream2) = create_mock_stream();

        stream1.write_immediate(b"bye").unwrap();
        drop(stream1);

        let mut buf = Vec::new();
        stream2.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
        assert!(stream2.is_closed());
    }

    #[tokio::test]
    async fn test_local_addr() {
        let (stream1, _stream2) = create_mock_stream();
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        let stream1 = stream1.with_local_addr(addr);
        assert_eq!(ProxyStream::local_addr(&stream1).unwrap(), addr);
    }
}
