use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, error, info};
use tokio::{
    net::{TcpListener, TcpStream},
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerConfig,
    handler::{ConnectionMetadata, Handler},
    handshake::Socks5Acceptor,
};

/// TCP front end running a [`Socks5Acceptor`] for every accepted connection.
#[derive(Debug)]
pub struct Socks5Listener<H> {
    listener: TcpListener,
    acceptor: Arc<Socks5Acceptor<H>>,
    cancel: CancellationToken,
}

impl<H> Socks5Listener<H>
where
    H: Handler<TcpStream>,
{
    /// Binds `config.listen`. Connections are not accepted until
    /// [`serve`](Socks5Listener::serve) runs.
    pub async fn bind(config: &ServerConfig, handler: Arc<H>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let acceptor = Socks5Acceptor::new(config.authenticator(), handler)
            .with_method_rejection(config.method_rejection);

        Ok(Self {
            listener,
            acceptor: Arc::new(acceptor),
            cancel: CancellationToken::new(),
        })
    }

    #[allow(missing_docs)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Stops the accept loop. Every handler call made by this listener sees
    /// its token cancelled.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Accepts connections until [`close`](Socks5Listener::close) is called.
    ///
    /// Each connection runs on its own task. Failed handshakes are reported
    /// to the handler's error sink.
    pub async fn serve(&self) -> io::Result<()> {
        info!("socks5 TCP listening on {}", self.listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.listener.accept() => r,
            };

            let (stream, peer_addr) = match accepted {
                Ok(s) => s,
                Err(err) => {
                    error!("accept failed with error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                let bind = match stream.local_addr() {
                    Ok(addr) => addr.ip().to_canonical(),
                    Err(err) => {
                        acceptor.handler().handle_error(err);
                        return;
                    }
                };

                let metadata = ConnectionMetadata::from_source(peer_addr);
                if let Err(err) = acceptor.run(cancel, stream, bind, metadata).await {
                    debug!("socks5 connection from {} failed: {}", peer_addr, err);
                    acceptor.handler().handle_error(err.into());
                }
            });
        }

        info!("socks5 TCP listener {} closed", self.listener.local_addr()?);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::ErrorKind,
        net::{IpAddr, Ipv4Addr},
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::UdpSocket,
        task::JoinHandle,
        time::timeout,
    };

    use super::*;
    use crate::{
        Address,
        PROTOCOL_SOCKS,
        socks5::{
            AuthRequest,
            Request,
            SOCKS5_VERSION,
            Socks5AuthMethod,
            Socks5Command,
            Socks5Reply,
            UsernamePasswordAuthRequest,
            UsernamePasswordStatus,
            read_auth_response,
            read_response,
            read_user_auth_response,
            socks5_read_udp_header,
            socks5_write_udp_header,
            write_auth_request,
            write_request,
            write_user_auth_request,
        },
        test_utils::{HandlerEvents, RecordingHandler, recording_handler},
    };

    type TestListener = Arc<Socks5Listener<RecordingHandler<TcpStream>>>;

    async fn start(
        config: ServerConfig,
    ) -> (TestListener, HandlerEvents<TcpStream>, JoinHandle<io::Result<()>>) {
        let (handler, events) = recording_handler();
        let listener = Arc::new(Socks5Listener::bind(&config, handler).await.unwrap());
        let task = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.serve().await })
        };
        (listener, events, task)
    }

    fn loopback_config() -> ServerConfig {
        ServerConfig::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }

    async fn greet(client: &mut TcpStream, method: Socks5AuthMethod) {
        write_auth_request(
            client,
            &AuthRequest {
                version: SOCKS5_VERSION,
                methods: vec![method],
            },
        )
        .await
        .unwrap();
        assert_eq!(read_auth_response(client).await.unwrap().method, method);
    }

    #[tokio::test]
    async fn test_connect_over_tcp() {
        let config = loopback_config().with_user("user", "pass");
        let (listener, mut events, task) = start(config).await;
        let server_addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(server_addr).await.unwrap();
        greet(&mut client, Socks5AuthMethod::UserPass).await;
        write_user_auth_request(
            &mut client,
            &UsernamePasswordAuthRequest {
                username: "user".to_string(),
                password: "pass".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            read_user_auth_response(&mut client).await.unwrap().status,
            UsernamePasswordStatus::Success
        );

        let destination = Address::DomainName(("example.com".to_string(), 80));
        write_request(
            &mut client,
            &Request {
                version: SOCKS5_VERSION,
                command: Socks5Command::Connect,
                destination: destination.clone(),
            },
        )
        .await
        .unwrap();
        let response = read_response(&mut client).await.unwrap();
        assert_eq!(response.reply, Socks5Reply::Succeeded);
        assert_eq!(response.bind, Address::from(server_addr));

        let (mut stream, metadata) = events.streams.recv().await.unwrap();
        assert_eq!(metadata.protocol, Some(PROTOCOL_SOCKS));
        assert_eq!(metadata.source, Some(client.local_addr().unwrap()));
        assert_eq!(metadata.destination, Some(destination));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        listener.close();
        timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_handshake_goes_to_error_sink() {
        let (listener, mut events, _task) = start(loopback_config()).await;

        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let err = events.errors.recv().await.unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().starts_with("read auth request failed"));
        listener.close();
    }

    #[tokio::test]
    async fn test_udp_associate_over_tcp() {
        let (listener, mut events, _task) = start(loopback_config()).await;

        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        greet(&mut client, Socks5AuthMethod::NoAuth).await;
        write_request(
            &mut client,
            &Request {
                version: SOCKS5_VERSION,
                command: Socks5Command::UdpAssociate,
                destination: Address::IPv4((Ipv4Addr::UNSPECIFIED, 0)),
            },
        )
        .await
        .unwrap();
        let response = read_response(&mut client).await.unwrap();
        assert_eq!(response.reply, Socks5Reply::Succeeded);
        let relay = response.bind.socket_addr().unwrap();
        assert_eq!(relay.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let (channel, metadata) = events.channels.recv().await.unwrap();
        assert_eq!(metadata.protocol, Some(PROTOCOL_SOCKS));

        let udp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let target = Address::IPv4((Ipv4Addr::new(8, 8, 8, 8), 53));
        let mut packet = vec![0u8; 3 + target.serialized_len() + 5];
        let header_len = socks5_write_udp_header(&target, &mut packet).unwrap();
        packet[header_len..].copy_from_slice(b"hello");
        udp.send_to(&packet, relay).await.unwrap();

        let mut buf = [0u8; 32];
        let (n, received_target) = channel.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(received_target, target);

        channel.send_to(b"world", &target).await.unwrap();
        let (len, _) = udp.recv_from(&mut buf).await.unwrap();
        let (from, header_len) = socks5_read_udp_header(&buf[..len]).unwrap();
        assert_eq!(from, target);
        assert_eq!(&buf[header_len..len], b"world");

        // Closing the controlling connection ends the association
        drop(client);
        timeout(Duration::from_secs(5), channel.closed())
            .await
            .unwrap();
        listener.close();
    }

    #[tokio::test]
    async fn test_close_cancels_handler_token() {
        let (handler, _events) = recording_handler::<TcpStream>();
        let listener = Socks5Listener::bind(&loopback_config(), handler)
            .await
            .unwrap();
        let child = listener.cancel.child_token();

        listener.close();
        assert!(child.is_cancelled());
        timeout(Duration::from_secs(5), listener.serve())
            .await
            .unwrap()
            .unwrap();
    }
}
