use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use crate::{Address, udp::AssociatePacketChannel};

/// Protocol tag recorded in [`ConnectionMetadata`] by a completed handshake.
pub const PROTOCOL_SOCKS: &str = "socks";

/// A stream a handshake can run on.
///
/// The local address is reported to the client as the bound address of a
/// `CONNECT` reply.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    #[allow(missing_docs)]
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl ProxyStream for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

/// Session context travelling with a connection.
///
/// Built by the caller, moved into the handshake, completed there and moved
/// on to the [`Handler`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionMetadata {
    /// Set to [`PROTOCOL_SOCKS`] once the command has been accepted.
    pub protocol: Option<&'static str>,
    /// Peer address of the accepted connection.
    pub source: Option<SocketAddr>,
    /// Destination requested by the client.
    pub destination: Option<Address>,
}

impl ConnectionMetadata {
    /// Metadata for a connection accepted from `source`.
    pub fn from_source(source: SocketAddr) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }
}

/// Downstream consumer of completed handshakes.
///
/// One handler is shared by every connection of a listener.
#[async_trait]
pub trait Handler<S>: Send + Sync + 'static
where
    S: Send + 'static,
{
    /// Takes over a `CONNECT` stream; the success reply has already been sent.
    async fn handle_stream(
        &self,
        cancel: CancellationToken,
        stream: S,
        metadata: ConnectionMetadata,
    ) -> io::Result<()>;

    /// Takes over a `UDP ASSOCIATE` relay. Runs on its own task; the channel
    /// is closed once the client closes the controlling stream.
    async fn handle_datagram_channel(
        &self,
        cancel: CancellationToken,
        channel: AssociatePacketChannel,
        metadata: ConnectionMetadata,
    ) -> io::Result<()>;

    /// Error sink for failures that have no caller to return to.
    fn handle_error(&self, err: io::Error);
}
