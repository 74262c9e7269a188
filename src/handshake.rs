use std::{
    fmt::{self, Display, Formatter},
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use log::{debug, warn};
use tokio::io::{copy, sink};
use tokio_util::sync::CancellationToken;

use crate::{
    Address,
    auth::Authenticator,
    handler::{ConnectionMetadata, Handler, PROTOCOL_SOCKS, ProxyStream},
    socks5::{
        self,
        AuthRequest,
        AuthResponse,
        Request,
        Response,
        Socks5AuthMethod,
        Socks5Command,
        Socks5Error,
        Socks5Reply,
        UsernamePasswordAuthResponse,
        UsernamePasswordStatus,
    },
    udp::{Association, open_relay_socket},
};

/// Outcome of matching the client's offered methods against the required one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MethodDecision {
    /// The client offered the required method.
    Accepted(Socks5AuthMethod),
    /// The client did not offer the required method.
    Rejected,
}

/// Matches the client's offer against the single method the server requires.
pub fn select_method(offered: &[Socks5AuthMethod], required: Socks5AuthMethod) -> MethodDecision {
    if offered.contains(&required) {
        MethodDecision::Accepted(required)
    } else {
        MethodDecision::Rejected
    }
}

/// What to do after answering a client that offered no acceptable method.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum MethodRejection {
    /// Write the `no acceptable methods` reply, then also select the
    /// required method and keep negotiating. Clients that do support the
    /// method despite not listing it can still complete the handshake.
    #[default]
    Continue,
    /// Write the `no acceptable methods` reply and end the handshake with an
    /// error.
    Terminate,
}

/// Handshake step at which a [`HandshakeError`] occurred.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum HandshakeStep {
    #[allow(missing_docs)]
    ReadAuthRequest,
    #[allow(missing_docs)]
    NegotiateMethod,
    #[allow(missing_docs)]
    WriteAuthResponse,
    #[allow(missing_docs)]
    ReadUserAuthRequest,
    #[allow(missing_docs)]
    WriteUserAuthResponse,
    #[allow(missing_docs)]
    ReadRequest,
    #[allow(missing_docs)]
    LocalAddress,
    #[allow(missing_docs)]
    BindUdpSocket,
    #[allow(missing_docs)]
    WriteResponse,
    #[allow(missing_docs)]
    HandleStream,
    #[allow(missing_docs)]
    DrainControlStream,
}

impl Display for HandshakeStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadAuthRequest => write!(f, "read auth request"),
            Self::NegotiateMethod => write!(f, "negotiate auth method"),
            Self::WriteAuthResponse => write!(f, "write auth response"),
            Self::ReadUserAuthRequest => write!(f, "read user auth request"),
            Self::WriteUserAuthResponse => write!(f, "write user auth response"),
            Self::ReadRequest => write!(f, "read request"),
            Self::LocalAddress => write!(f, "query local address"),
            Self::BindUdpSocket => write!(f, "bind UDP relay socket"),
            Self::WriteResponse => write!(f, "write response"),
            Self::HandleStream => write!(f, "handle stream"),
            Self::DrainControlStream => write!(f, "drain control stream"),
        }
    }
}

/// A handshake failure, tagged with the step that failed.
#[derive(Debug)]
pub struct HandshakeError {
    step: HandshakeStep,
    source: io::Error,
}

impl HandshakeError {
    #[allow(missing_docs)]
    pub fn new(step: HandshakeStep, source: io::Error) -> Self {
        Self { step, source }
    }

    #[allow(missing_docs)]
    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    /// Kind of the underlying I/O error.
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    #[allow(missing_docs)]
    pub fn into_inner(self) -> io::Error {
        self.source
    }
}

impl Display for HandshakeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.source)
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<HandshakeError> for io::Error {
    fn from(e: HandshakeError) -> Self {
        io::Error::new(e.kind(), e)
    }
}

trait StepExt<T> {
    fn at(self, step: HandshakeStep) -> Result<T, HandshakeError>;
}

impl<T> StepExt<T> for io::Result<T> {
    fn at(self, step: HandshakeStep) -> Result<T, HandshakeError> {
        self.map_err(|source| HandshakeError::new(step, source))
    }
}

/// Server side of the SOCKS5 handshake.
///
/// One acceptor serves any number of connections; each [`run`] services
/// exactly one command on one stream.
///
/// [`run`]: Socks5Acceptor::run
pub struct Socks5Acceptor<H> {
    authenticator: Option<Arc<dyn Authenticator>>,
    handler: Arc<H>,
    method_rejection: MethodRejection,
}

impl<H> fmt::Debug for Socks5Acceptor<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Acceptor")
            .field("authenticated", &self.authenticator.is_some())
            .field("method_rejection", &self.method_rejection)
            .finish_non_exhaustive()
    }
}

impl<H> Socks5Acceptor<H> {
    /// Without an authenticator clients must offer `no authentication`;
    /// with one they must offer `username/password`.
    pub fn new(authenticator: Option<Arc<dyn Authenticator>>, handler: Arc<H>) -> Self {
        Self {
            authenticator,
            handler,
            method_rejection: MethodRejection::default(),
        }
    }

    #[allow(missing_docs)]
    pub fn with_method_rejection(mut self, method_rejection: MethodRejection) -> Self {
        self.method_rejection = method_rejection;
        self
    }

    #[allow(missing_docs)]
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Runs the whole handshake on `stream` and dispatches its command.
    ///
    /// `bind` is the address UDP relay sockets are opened on, normally the
    /// local IP the stream was accepted on. `cancel` is passed to the handler
    /// untouched.
    ///
    /// For `CONNECT` this returns whatever the handler returns. For
    /// `UDP ASSOCIATE` it returns once the client closes the stream or the
    /// datagram handler returns, closing the stream in the latter case.
    pub async fn run<S>(
        &self,
        cancel: CancellationToken,
        mut stream: S,
        bind: IpAddr,
        metadata: ConnectionMetadata,
    ) -> Result<(), HandshakeError>
    where
        S: ProxyStream,
        H: Handler<S>,
    {
        let auth_request = socks5::read_auth_request(&mut stream)
            .await
            .at(HandshakeStep::ReadAuthRequest)?;
        self.negotiate(auth_request, cancel, stream, bind, metadata)
            .await
    }

    /// Same as [`run`](Socks5Acceptor::run) for a stream whose first byte
    /// (the protocol version) the caller has already consumed.
    pub async fn run_after_version<S>(
        &self,
        cancel: CancellationToken,
        mut stream: S,
        bind: IpAddr,
        metadata: ConnectionMetadata,
    ) -> Result<(), HandshakeError>
    where
        S: ProxyStream,
        H: Handler<S>,
    {
        let auth_request = socks5::read_auth_request_after_version(&mut stream)
            .await
            .at(HandshakeStep::ReadAuthRequest)?;
        self.negotiate(auth_request, cancel, stream, bind, metadata)
            .await
    }

    async fn negotiate<S>(
        &self,
        auth_request: AuthRequest,
        cancel: CancellationToken,
        mut stream: S,
        bind: IpAddr,
        metadata: ConnectionMetadata,
    ) -> Result<(), HandshakeError>
    where
        S: ProxyStream,
        H: Handler<S>,
    {
        let authenticator = self.authenticator.as_deref();
        let required = match authenticator {
            Some(_) => Socks5AuthMethod::UserPass,
            None => Socks5AuthMethod::NoAuth,
        };

        if select_method(&auth_request.methods, required) == MethodDecision::Rejected {
            warn!(
                "socks5 client offered {:?}, required {:?}",
                auth_request.methods, required
            );
            socks5::write_auth_response(
                &mut stream,
                &AuthResponse {
                    version: auth_request.version,
                    method: Socks5AuthMethod::NoAcceptable,
                },
            )
            .await
            .at(HandshakeStep::WriteAuthResponse)?;

            if self.method_rejection == MethodRejection::Terminate {
                return Err(HandshakeError::new(
                    HandshakeStep::NegotiateMethod,
                    Socks5Error::NoAcceptableAuthMethod.into(),
                ));
            }
        }

        socks5::write_auth_response(
            &mut stream,
            &AuthResponse {
                version: auth_request.version,
                method: required,
            },
        )
        .await
        .at(HandshakeStep::WriteAuthResponse)?;

        if let Some(authenticator) = authenticator {
            let user_request = socks5::read_user_auth_request(&mut stream)
                .await
                .at(HandshakeStep::ReadUserAuthRequest)?;

            let status = if authenticator.verify(&user_request.username, &user_request.password)
            {
                UsernamePasswordStatus::Success
            } else {
                // The client is expected to hang up after a failure status
                warn!(
                    "socks5 authentication failed for user {:?}",
                    user_request.username
                );
                UsernamePasswordStatus::Failure
            };

            socks5::write_user_auth_response(&mut stream, &UsernamePasswordAuthResponse { status })
                .await
                .at(HandshakeStep::WriteUserAuthResponse)?;
        }

        let request = socks5::read_request(&mut stream)
            .await
            .at(HandshakeStep::ReadRequest)?;

        debug!(
            "socks5 {:?} request to {} from {:?}",
            request.command, request.destination, metadata.source
        );

        match request.command {
            Socks5Command::Connect => self.connect(cancel, stream, request, metadata).await,
            Socks5Command::UdpAssociate => {
                self.udp_associate(cancel, stream, bind, request, metadata)
                    .await
            }
            Socks5Command::Bind | Socks5Command::Unsupported(_) => {
                socks5::write_response(
                    &mut stream,
                    &Response {
                        version: request.version,
                        reply: Socks5Reply::CommandNotSupported,
                        bind: Address::IPv4((Ipv4Addr::UNSPECIFIED, 0)),
                    },
                )
                .await
                .at(HandshakeStep::WriteResponse)?;
                Ok(())
            }
        }
    }

    async fn connect<S>(
        &self,
        cancel: CancellationToken,
        mut stream: S,
        request: Request,
        mut metadata: ConnectionMetadata,
    ) -> Result<(), HandshakeError>
    where
        S: ProxyStream,
        H: Handler<S>,
    {
        let local_addr = stream.local_addr().at(HandshakeStep::LocalAddress)?;
        socks5::write_response(
            &mut stream,
            &Response {
                version: request.version,
                reply: Socks5Reply::Succeeded,
                bind: Address::from(local_addr),
            },
        )
        .await
        .at(HandshakeStep::WriteResponse)?;

        metadata.protocol = Some(PROTOCOL_SOCKS);
        metadata.destination = Some(request.destination);

        self.handler
            .handle_stream(cancel, stream, metadata)
            .await
            .at(HandshakeStep::HandleStream)
    }

    async fn udp_associate<S>(
        &self,
        cancel: CancellationToken,
        mut stream: S,
        bind: IpAddr,
        request: Request,
        mut metadata: ConnectionMetadata,
    ) -> Result<(), HandshakeError>
    where
        S: ProxyStream,
        H: Handler<S>,
    {
        let socket = open_relay_socket(bind).at(HandshakeStep::BindUdpSocket)?;
        let relay_addr = socket.local_addr().at(HandshakeStep::BindUdpSocket)?;

        socks5::write_response(
            &mut stream,
            &Response {
                version: request.version,
                reply: Socks5Reply::Succeeded,
                bind: Address::from(relay_addr),
            },
        )
        .await
        .at(HandshakeStep::WriteResponse)?;

        metadata.protocol = Some(PROTOCOL_SOCKS);
        metadata.destination = Some(request.destination.clone());

        debug!(
            "UDP association {} <-> {:?} started",
            relay_addr, metadata.source
        );
        let association = Association::spawn::<S, H>(
            self.handler.clone(),
            cancel,
            socket,
            request.destination,
            metadata,
        );

        // Ends when the client closes the controlling stream or the handler
        // leaves the relay; the stream is closed on return either way
        let mut discard = sink();
        let drained = tokio::select! {
            r = copy(&mut stream, &mut discard) => r.map(|_| ()),
            _ = association.finished() => {
                debug!("UDP association {} ended by handler", relay_addr);
                Ok(())
            }
        };
        drop(association);
        debug!("UDP association {} closed", relay_addr);

        drained.at(HandshakeStep::DrainControlStream)
    }
}
