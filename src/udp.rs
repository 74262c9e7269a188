use std::{
    fmt,
    io::{self, ErrorKind},
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
};

use log::{debug, error, trace, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::{net::UdpSocket, sync::Mutex as AsyncMutex, task::AbortHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    Address,
    handler::{ConnectionMetadata, Handler},
    socks5::{socks5_read_udp_header, socks5_write_udp_header},
};

const MAXIMUM_UDP_PAYLOAD_SIZE: usize = 65536;

/// Opens the local relay socket of a UDP association on an ephemeral port.
///
/// An IPv4 `bind` yields an IPv4-only socket. Anything else yields an IPv6
/// socket with `IPV6_V6ONLY` cleared so IPv4 clients can still reach it.
pub fn open_relay_socket(bind: IpAddr) -> io::Result<UdpSocket> {
    let addr = SocketAddr::new(bind, 0);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if bind.is_ipv6()
        && let Err(err) = socket.set_only_v6(false)
    {
        // Not fatal, the socket still serves IPv6 clients
        warn!("failed to set IPV6_V6ONLY: false for relay socket, error: {}", err);
    }

    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;

    let socket = UdpSocket::from_std(socket.into())?;
    debug!("opened UDP relay socket {}", socket.local_addr()?);
    Ok(socket)
}

/// Datagram side of a UDP association.
///
/// Owns the relay socket. Datagrams from the client carry the SOCKS5 UDP
/// header, which is stripped on receive and prepended on send. The client
/// endpoint is learned from the most recent datagram received.
pub struct AssociatePacketChannel {
    socket: UdpSocket,
    destination: Address,
    client: Mutex<Option<SocketAddr>>,
    closed: CancellationToken,
    recv_buf: AsyncMutex<Box<[u8]>>,
}

impl fmt::Debug for AssociatePacketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociatePacketChannel")
            .field("socket", &self.socket)
            .field("destination", &self.destination)
            .field("client", &self.client_addr())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl AssociatePacketChannel {
    fn new(socket: UdpSocket, destination: Address, closed: CancellationToken) -> Self {
        Self {
            socket,
            destination,
            client: Mutex::new(None),
            closed,
            recv_buf: AsyncMutex::new(vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE].into_boxed_slice()),
        }
    }

    /// Destination the client declared in its `UDP ASSOCIATE` request.
    pub fn destination(&self) -> &Address {
        &self.destination
    }

    #[allow(missing_docs)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Client endpoint of the last datagram received, if any.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        *self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the controlling stream has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Completes once the association is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Receives one client datagram into `buf`, returning the payload length
    /// and the target address from its header.
    ///
    /// Payloads larger than `buf` are truncated. Malformed and fragmented
    /// datagrams are dropped.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)> {
        let mut packet = self.recv_buf.lock().await;

        loop {
            let (recv_len, src) = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(closed_error()),
                r = self.socket.recv_from(&mut packet[..]) => r?,
            };

            trace!("received UDP packet from {}, length {} bytes", src, recv_len);

            let (target, header_len) = match socks5_read_udp_header(&packet[..recv_len]) {
                Ok(h) => h,
                Err(err) => {
                    error!(
                        "received unrecognized UDP packet from {}, length {} bytes, error: {}",
                        src, recv_len, err
                    );
                    continue;
                }
            };

            *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(src);

            let payload = &packet[header_len..recv_len];
            let n = payload.len().min(buf.len());
            buf[..n].copy_from_slice(&payload[..n]);
            return Ok((n, target));
        }
    }

    /// Sends `payload` to the client, tagged as coming from `from`.
    pub async fn send_to(&self, payload: &[u8], from: &Address) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let client = self.client_addr().ok_or_else(|| {
            io::Error::new(
                ErrorKind::NotConnected,
                "no datagram has been received from the client",
            )
        })?;

        let mut packet = vec![0u8; 3 + from.serialized_len() + payload.len()];
        let header_len = socks5_write_udp_header(from, &mut packet)?;
        packet[header_len..].copy_from_slice(payload);

        self.socket.send_to(&packet, client).await?;
        Ok(payload.len())
    }
}

fn closed_error() -> io::Error {
    io::Error::new(ErrorKind::ConnectionAborted, "UDP association closed")
}

/// Scoped ownership of a running UDP association.
///
/// Dropping it closes the channel and aborts the hand-off task, which
/// releases the relay socket unless the handler moved the channel elsewhere.
#[derive(Debug)]
pub struct Association {
    closed: CancellationToken,
    finished: CancellationToken,
    task: AbortHandle,
}

impl Association {
    /// Starts `handler.handle_datagram_channel` on a new task. Its error, if
    /// any, goes to `handler.handle_error`. The association is over once the
    /// handler returns.
    ///
    /// Cancelling `cancel` also closes the channel.
    pub fn spawn<S, H>(
        handler: Arc<H>,
        cancel: CancellationToken,
        socket: UdpSocket,
        destination: Address,
        metadata: ConnectionMetadata,
    ) -> Self
    where
        S: Send + 'static,
        H: Handler<S>,
    {
        let closed = cancel.child_token();
        let channel = AssociatePacketChannel::new(socket, destination, closed.clone());
        let finished = CancellationToken::new();

        let done = finished.clone();
        let task = tokio::spawn(async move {
            // Fires after the error sink has run, or when the task is aborted
            let _done = done.drop_guard();

            if let Err(err) = handler
                .handle_datagram_channel(cancel, channel, metadata)
                .await
            {
                handler.handle_error(err);
            }
        });

        Self {
            closed,
            finished,
            task: task.abort_handle(),
        }
    }

    /// Whether the hand-off task has returned.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Completes once the hand-off task has returned and any error it
    /// produced has been passed to `handle_error`.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        self.closed.cancel();
        self.task.abort();
    }
}
