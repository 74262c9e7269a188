use std::{
    fmt::{self, Display, Formatter},
    io::{Error, ErrorKind, Result},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Address;

/// SOCKS protocol version handled by this crate.
pub const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_VER: u8 = 0x01;

/// SOCKS5 authentication methods as defined in RFC 1928 section 3.
///
/// Method bytes this crate does not know are kept as [`Unassigned`] so that
/// a client's offer is never silently altered.
///
/// [`Unassigned`]: Socks5AuthMethod::Unassigned
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Socks5AuthMethod {
    /// `0x00`, no authentication required.
    NoAuth,
    /// `0x01`, GSSAPI.
    GssApi,
    /// `0x02`, username/password (RFC 1929).
    UserPass,
    /// `0xFF`, none of the offered methods is acceptable.
    NoAcceptable,
    /// Any other method byte.
    Unassigned(u8),
}

impl From<u8> for Socks5AuthMethod {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Socks5AuthMethod::NoAuth,
            0x01 => Socks5AuthMethod::GssApi,
            0x02 => Socks5AuthMethod::UserPass,
            0xFF => Socks5AuthMethod::NoAcceptable,
            other => Socks5AuthMethod::Unassigned(other),
        }
    }
}

impl From<Socks5AuthMethod> for u8 {
    fn from(value: Socks5AuthMethod) -> Self {
        match value {
            Socks5AuthMethod::NoAuth => 0x00,
            Socks5AuthMethod::GssApi => 0x01,
            Socks5AuthMethod::UserPass => 0x02,
            Socks5AuthMethod::NoAcceptable => 0xFF,
            Socks5AuthMethod::Unassigned(other) => other,
        }
    }
}

/// SOCKS5 commands as defined in RFC 1928 section 4.
///
/// These commands specify the type of proxy operation requested by the client:
/// - `CONNECT`: Establish a TCP/IP connection to the target.
/// - `BIND`: Request the server to bind to a port for incoming connections.
/// - `UDP_ASSOCIATE`: Establish a UDP relay.
///
/// Reference: <https://datatracker.ietf.org/doc/html/rfc1928#section-4>
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Socks5Command {
    #[allow(missing_docs)]
    Connect,
    #[allow(missing_docs)]
    Bind,
    #[allow(missing_docs)]
    UdpAssociate,
    /// A command byte outside of RFC 1928.
    Unsupported(u8),
}

impl From<u8> for Socks5Command {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Socks5Command::Connect,
            0x02 => Socks5Command::Bind,
            0x03 => Socks5Command::UdpAssociate,
            other => Socks5Command::Unsupported(other),
        }
    }
}

impl From<Socks5Command> for u8 {
    fn from(value: Socks5Command) -> Self {
        match value {
            Socks5Command::Connect => 0x01,
            Socks5Command::Bind => 0x02,
            Socks5Command::UdpAssociate => 0x03,
            Socks5Command::Unsupported(other) => other,
        }
    }
}

/// SOCKS5 server reply codes as defined in RFC 1928 section 6.
///
/// These reply codes indicate the status of a client's request:
/// - Succeeded (0x00): Request granted.
/// - Various error codes (0x01-0x08): Different failure reasons.
///
/// Reference: <https://datatracker.ietf.org/doc/html/rfc1928#section-6>
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Socks5Reply {
    #[allow(missing_docs)]
    Succeeded = 0x00,
    #[allow(missing_docs)]
    GeneralFailure = 0x01,
    #[allow(missing_docs)]
    ConnectionNotAllowed = 0x02,
    #[allow(missing_docs)]
    NetworkUnreachable = 0x03,
    #[allow(missing_docs)]
    HostUnreachable = 0x04,
    #[allow(missing_docs)]
    ConnectionRefused = 0x05,
    #[allow(missing_docs)]
    TTLExpired = 0x06,
    #[allow(missing_docs)]
    CommandNotSupported = 0x07,
    #[allow(missing_docs)]
    AddressTypeNotSupported = 0x08,
}

impl TryFrom<u8> for Socks5Reply {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Socks5Reply::Succeeded),
            0x01 => Ok(Socks5Reply::GeneralFailure),
            0x02 => Ok(Socks5Reply::ConnectionNotAllowed),
            0x03 => Ok(Socks5Reply::NetworkUnreachable),
            0x04 => Ok(Socks5Reply::HostUnreachable),
            0x05 => Ok(Socks5Reply::ConnectionRefused),
            0x06 => Ok(Socks5Reply::TTLExpired),
            0x07 => Ok(Socks5Reply::CommandNotSupported),
            0x08 => Ok(Socks5Reply::AddressTypeNotSupported),
            _ => Err(Socks5Error::InvalidReply.into()),
        }
    }
}

/// Client greeting, listing the authentication methods the client offers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthRequest {
    #[allow(missing_docs)]
    pub version: u8,
    #[allow(missing_docs)]
    pub methods: Vec<Socks5AuthMethod>,
}

/// Server greeting, carrying the method the server selected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AuthResponse {
    #[allow(missing_docs)]
    pub version: u8,
    #[allow(missing_docs)]
    pub method: Socks5AuthMethod,
}

/// RFC 1929 username/password sub-negotiation request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UsernamePasswordAuthRequest {
    #[allow(missing_docs)]
    pub username: String,
    #[allow(missing_docs)]
    pub password: String,
}

/// Outcome of a username/password sub-negotiation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UsernamePasswordStatus {
    /// `0x00`
    Success,
    /// Any non-zero status; written as `0x01`.
    Failure,
}

/// RFC 1929 username/password sub-negotiation response.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UsernamePasswordAuthResponse {
    #[allow(missing_docs)]
    pub status: UsernamePasswordStatus,
}

/// Command request sent by the client after authentication.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    #[allow(missing_docs)]
    pub version: u8,
    #[allow(missing_docs)]
    pub command: Socks5Command,
    #[allow(missing_docs)]
    pub destination: Address,
}

/// Command response sent by the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    #[allow(missing_docs)]
    pub version: u8,
    #[allow(missing_docs)]
    pub reply: Socks5Reply,
    #[allow(missing_docs)]
    pub bind: Address,
}

/// According to RFC 1928, client hello format is:
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
/// VER: SOCKS protocol version, must be 0x05
/// NMETHODS: Number of authentication methods supported by client
/// METHODS: List of authentication methods supported by client
pub async fn read_auth_request<T>(reader: &mut T) -> Result<AuthRequest>
where
    T: AsyncRead + Unpin,
{
    // Read version number
    let ver = reader.read_u8().await?;
    if ver != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidSocksVersion.into());
    }

    read_auth_request_after_version(reader).await
}

/// Reads the remainder of a client hello whose version byte has already been
/// consumed by the caller, e.g. a listener sniffing the protocol.
pub async fn read_auth_request_after_version<T>(reader: &mut T) -> Result<AuthRequest>
where
    T: AsyncRead + Unpin,
{
    // Read number of authentication methods
    let nmethods = reader.read_u8().await? as usize;

    // Read authentication methods list
    let mut raw = vec![0u8; nmethods];
    reader.read_exact(&mut raw).await?;

    Ok(AuthRequest {
        version: SOCKS5_VERSION,
        methods: raw.into_iter().map(Socks5AuthMethod::from).collect(),
    })
}

#[allow(missing_docs)]
pub async fn write_auth_request<T>(writer: &mut T, request: &AuthRequest) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    if request.methods.len() > 255 {
        return Err(Socks5Error::TooManyAuthMethods.into());
    }

    writer.write_u8(request.version).await?;
    writer.write_u8(request.methods.len() as u8).await?;
    for method in &request.methods {
        writer.write_u8((*method).into()).await?;
    }

    writer.flush().await?;
    Ok(())
}

/// According to RFC 1928, server hello format is:
/// ```text
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
/// VER: SOCKS protocol version, must be 0x05
/// METHOD: Server's selected authentication method, 0xFF means none of the client's methods are acceptable
pub async fn read_auth_response<T>(reader: &mut T) -> Result<AuthResponse>
where
    T: AsyncRead + Unpin,
{
    let ver = reader.read_u8().await?;
    if ver != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidSocksVersion.into());
    }

    let method = Socks5AuthMethod::from(reader.read_u8().await?);
    Ok(AuthResponse {
        version: ver,
        method,
    })
}

#[allow(missing_docs)]
pub async fn write_auth_response<T>(writer: &mut T, response: &AuthResponse) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    writer.write_u8(response.version).await?;
    writer.write_u8(response.method.into()).await?;

    writer.flush().await?;
    Ok(())
}

/// According to RFC 1929, username/password authentication request format is:
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
/// VER: Authentication sub-protocol version, must be 0x01.
/// ULEN: Username length (1-255 bytes).
/// UNAME: Username.
/// PLEN: Password length (1-255 bytes).
/// PASSWD: Password.
pub async fn read_user_auth_request<T>(reader: &mut T) -> Result<UsernamePasswordAuthRequest>
where
    T: AsyncRead + Unpin,
{
    // Read authentication sub-protocol version number
    let ver = reader.read_u8().await?;
    if ver != SOCKS5_AUTH_VER {
        return Err(Socks5Error::InvalidAuthVersion.into());
    }

    // Read username
    let ulen = reader.read_u8().await? as usize;
    let mut uname = vec![0u8; ulen];
    reader.read_exact(&mut uname).await?;
    let username = String::from_utf8(uname).map_err(|_| Socks5Error::InvalidUsernameEncoding)?;

    // Read password
    let plen = reader.read_u8().await? as usize;
    let mut passwd = vec![0u8; plen];
    reader.read_exact(&mut passwd).await?;
    let password = String::from_utf8(passwd).map_err(|_| Socks5Error::InvalidPasswordEncoding)?;

    Ok(UsernamePasswordAuthRequest { username, password })
}

#[allow(missing_docs)]
pub async fn write_user_auth_request<T>(
    writer: &mut T,
    request: &UsernamePasswordAuthRequest,
) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let username_bytes = request.username.as_bytes();
    if username_bytes.len() > 255 {
        return Err(Socks5Error::UsernameTooLong.into());
    }
    let password_bytes = request.password.as_bytes();
    if password_bytes.len() > 255 {
        return Err(Socks5Error::PasswordTooLong.into());
    }

    writer.write_u8(SOCKS5_AUTH_VER).await?;
    writer.write_u8(username_bytes.len() as u8).await?;
    writer.write_all(username_bytes).await?;
    writer.write_u8(password_bytes.len() as u8).await?;
    writer.write_all(password_bytes).await?;

    writer.flush().await?;
    Ok(())
}

/// According to RFC 1929, username/password authentication response format is:
/// ```text
/// +----+--------+
/// |VER | STATUS |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
/// VER: Authentication sub-protocol version, must be 0x01.
/// STATUS: Authentication result, 0x00 means success, other values mean failure.
pub async fn read_user_auth_response<T>(reader: &mut T) -> Result<UsernamePasswordAuthResponse>
where
    T: AsyncRead + Unpin,
{
    let ver = reader.read_u8().await?;
    if ver != SOCKS5_AUTH_VER {
        return Err(Socks5Error::InvalidAuthVersion.into());
    }

    let status = match reader.read_u8().await? {
        0 => UsernamePasswordStatus::Success,
        _ => UsernamePasswordStatus::Failure,
    };
    Ok(UsernamePasswordAuthResponse { status })
}

#[allow(missing_docs)]
pub async fn write_user_auth_response<T>(
    writer: &mut T,
    response: &UsernamePasswordAuthResponse,
) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    writer.write_u8(SOCKS5_AUTH_VER).await?;
    writer
        .write_u8(match response.status {
            UsernamePasswordStatus::Success => 0,
            UsernamePasswordStatus::Failure => 1,
        })
        .await?;

    writer.flush().await?;
    Ok(())
}

/// According to RFC 1928, connection request format is:
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
/// VER: SOCKS protocol version, must be 0x05.
/// CMD: Command code - 0x01 (CONNECT), 0x02 (BIND), 0x03 (UDP ASSOCIATE).
/// RSV: Reserved field, read and ignored.
/// ATYP: Address type - 0x01 (IPv4), 0x03 (domain name), 0x04 (IPv6).
/// DST.ADDR: Destination address, format depends on ATYP.
/// DST.PORT: Destination port, network byte order (big-endian).
pub async fn read_request<T>(reader: &mut T) -> Result<Request>
where
    T: AsyncRead + Unpin,
{
    let ver = reader.read_u8().await?;
    if ver != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidSocksVersion.into());
    }

    let command = Socks5Command::from(reader.read_u8().await?);

    // Reserved
    reader.read_u8().await?;

    let (destination, _) = Address::decode_from_reader(reader).await?;

    Ok(Request {
        version: ver,
        command,
        destination,
    })
}

#[allow(missing_docs)]
pub async fn write_request<T>(writer: &mut T, request: &Request) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    writer.write_u8(request.version).await?;
    writer.write_u8(request.command.into()).await?;
    writer.write_u8(0).await?;
    request.destination.encode_to_writer(writer).await?;

    writer.flush().await?;
    Ok(())
}

/// According to RFC 1928, the connection response format is:
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
/// VER: SOCKS protocol version, must be 0x05.
/// REP: Reply code - 0x00 (succeeded), 0x01-0x08 (various errors).
/// RSV: Reserved field, must be 0x00.
/// ATYP: Address type - 0x01 (IPv4), 0x03 (domain name), 0x04 (IPv6).
/// BND.ADDR: Server bound address, format depends on ATYP.
/// BND.PORT: Server bound port, network byte order (big-endian).
pub async fn read_response<T>(reader: &mut T) -> Result<Response>
where
    T: AsyncRead + Unpin,
{
    let ver = reader.read_u8().await?;
    if ver != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidSocksVersion.into());
    }

    let reply = Socks5Reply::try_from(reader.read_u8().await?)?;

    // Reserved
    reader.read_u8().await?;

    let (bind, _) = Address::decode_from_reader(reader).await?;

    Ok(Response {
        version: ver,
        reply,
        bind,
    })
}

#[allow(missing_docs)]
pub async fn write_response<T>(writer: &mut T, response: &Response) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    writer.write_u8(response.version).await?;
    writer.write_u8(response.reply as u8).await?;
    writer.write_u8(0).await?;
    response.bind.encode_to_writer(writer).await?;

    writer.flush().await?;
    Ok(())
}

/// Reads and parses the SOCKS5 UDP header information and destination address from a UDP packet buffer.
///
/// Per RFC 1928 Section 7, SOCKS5 UDP requests/responses contain a header in the following format:
/// ```text
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
/// RSV: Reserved field, must be 0
/// FRAG: Fragment number, fragmented datagrams are rejected
/// ATYP/DST.ADDR/DST.PORT: Destination address encoded in the same format as SOCKS5 requests
///
/// Returns the destination address and the total header length in bytes.
pub fn socks5_read_udp_header(buf: &[u8]) -> Result<(Address, usize)> {
    let first = buf
        .first_chunk::<3>()
        .ok_or(Error::new(ErrorKind::UnexpectedEof, "buffer too short"))?;
    if first[..2] != [0, 0] {
        return Err(Error::new(ErrorKind::InvalidData, "invalid UDP header"));
    }
    if first[2] != 0 {
        return Err(Socks5Error::FragmentedDatagram.into());
    }
    let (address, len) = Address::decode_from_buf(&buf[3..])?;
    Ok((address, 2 + 1 + len))
}

/// Writes the SOCKS5 UDP header and destination address into a buffer,
/// returning the header length in bytes.
pub fn socks5_write_udp_header(address: &Address, buf: &mut [u8]) -> Result<usize> {
    let first = buf
        .first_chunk_mut::<3>()
        .ok_or(Error::new(ErrorKind::UnexpectedEof, "buffer too short"))?;
    *first = [0, 0, 0];
    let len = address.encode_to_buf(&mut buf[3..])?;
    Ok(2 + 1 + len)
}

/// Errors that can occur during SOCKS5 protocol operations.
///
/// Each variant represents a specific error condition that may arise when
/// decoding or encoding SOCKS5 messages, as defined in RFC 1928 and RFC 1929.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Socks5Error {
    /// None of the client's offered methods matches the method the server requires.
    NoAcceptableAuthMethod,
    /// Peer sent an incorrect SOCKS version (expected 0x05).
    InvalidSocksVersion,
    /// Peer sent an incorrect authentication subprotocol version.
    InvalidAuthVersion,
    /// The reply byte is not a valid SOCKS5 reply code.
    InvalidReply,
    /// The username contains invalid UTF-8 encoding.
    InvalidUsernameEncoding,
    /// The password contains invalid UTF-8 encoding.
    InvalidPasswordEncoding,
    /// The username exceeds maximum allowed length (255 bytes).
    UsernameTooLong,
    /// The password exceeds maximum allowed length (255 bytes).
    PasswordTooLong,
    /// More than 255 authentication methods were offered.
    TooManyAuthMethods,
    /// A UDP datagram carried a non-zero fragment number.
    FragmentedDatagram,
}

impl Display for Socks5Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAcceptableAuthMethod => write!(f, "No acceptable authentication method"),
            Self::InvalidSocksVersion => write!(f, "Invalid SOCKS version"),
            Self::InvalidAuthVersion => write!(f, "Invalid auth version"),
            Self::InvalidReply => write!(f, "Invalid Reply"),
            Self::InvalidUsernameEncoding => write!(f, "Invalid username encoding"),
            Self::InvalidPasswordEncoding => write!(f, "Invalid password encoding"),
            Self::UsernameTooLong => write!(f, "Username too long"),
            Self::PasswordTooLong => write!(f, "Password too long"),
            Self::TooManyAuthMethods => write!(f, "Too many authentication methods"),
            Self::FragmentedDatagram => write!(f, "UDP fragmentation is not supported"),
        }
    }
}

impl std::error::Error for Socks5Error {}

impl From<Socks5Error> for Error {
    fn from(e: Socks5Error) -> Self {
        match e {
            Socks5Error::NoAcceptableAuthMethod => Error::new(ErrorKind::PermissionDenied, e),
            Socks5Error::InvalidSocksVersion => Error::new(ErrorKind::InvalidData, e),
            Socks5Error::InvalidAuthVersion => Error::new(ErrorKind::InvalidData, e),
            Socks5Error::InvalidReply => Error::new(ErrorKind::InvalidData, e),
            Socks5Error::InvalidUsernameEncoding => Error::new(ErrorKind::InvalidData, e),
            Socks5Error::InvalidPasswordEncoding => Error::new(ErrorKind::InvalidData, e),
            Socks5Error::UsernameTooLong => Error::new(ErrorKind::InvalidInput, e),
            Socks5Error::PasswordTooLong => Error::new(ErrorKind::InvalidInput, e),
            Socks5Error::TooManyAuthMethods => Error::new(ErrorKind::InvalidInput, e),
            Socks5Error::FragmentedDatagram => Error::new(ErrorKind::Unsupported, e),
        }
    }
}
