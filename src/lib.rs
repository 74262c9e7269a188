//! Server-side SOCKS5 handshake and command dispatch for a single accepted
//! stream connection.
//!
//! The crate negotiates an authentication method, optionally checks
//! username/password credentials, reads exactly one client command and then
//! hands the outcome over to user code:
//!
//! - `CONNECT`: the stream itself is handed to [`Handler::handle_stream`],
//!   which owns all byte forwarding from then on.
//! - `UDP ASSOCIATE`: a local relay socket is opened and an
//!   [`AssociatePacketChannel`] wrapping it is handed to
//!   [`Handler::handle_datagram_channel`] on a separate task, while the
//!   controlling stream is drained until the client closes it.
//! - Anything else is answered with a `command not supported` reply.
//!
//! ### Handshake
//!
//! - [`Socks5Acceptor`] drives the handshake; build one per listener with an
//!   optional [`Authenticator`] and a shared [`Handler`].
//! - [`select_method`] is the pure method-selection step, and
//!   [`MethodRejection`] decides what happens when the client offers nothing
//!   acceptable.
//! - [`Socks5Listener`] accepts TCP connections and runs an acceptor on each.
//!
//! ### Codec
//!
//! The [`socks5`] module reads and writes every RFC 1928/1929 message used by
//! the handshake, and [`Address`] encodes SOCKS5-style addresses to streams
//! ([`decode_from_reader`], [`encode_to_writer`]) and buffers
//! ([`decode_from_buf`], [`encode_to_buf`]).
//!
//! [`decode_from_reader`]: Address::decode_from_reader
//! [`encode_to_writer`]: Address::encode_to_writer
//! [`decode_from_buf`]: Address::decode_from_buf
//! [`encode_to_buf`]: Address::encode_to_buf
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]
use std::{
    fmt::{self, Display, Formatter},
    io::{Error, ErrorKind, Result},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

mod auth;
mod config;
mod handler;
mod handshake;
mod listener;
pub mod socks5;
mod udp;

#[cfg(test)]
#[doc(hidden)]
pub mod test_utils;

pub use auth::{Authenticator, User, UserAuthenticator};
pub use config::ServerConfig;
pub use handler::{ConnectionMetadata, Handler, PROTOCOL_SOCKS, ProxyStream};
pub use handshake::{
    HandshakeError,
    HandshakeStep,
    MethodDecision,
    MethodRejection,
    Socks5Acceptor,
    select_method,
};
pub use listener::Socks5Listener;
pub use socks5::{Socks5AuthMethod, Socks5Command, Socks5Error, Socks5Reply};
pub use udp::{AssociatePacketChannel, Association, open_relay_socket};

/// Represents a network address in various supported formats.
///
/// This enum is used for SOCKS5 destinations and bound addresses,
/// supporting IPv4, IPv6, and domain name address types as defined in RFC 1928.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Address {
    /// An IPv4 address with a port number.
    IPv4((Ipv4Addr, u16)),

    /// A domain name with a port number.
    DomainName((String, u16)),

    /// An IPv6 address with a port number.
    IPv6((Ipv6Addr, u16)),
}

impl Address {
    /// Decodes a SOCKS5-like address from an asynchronous reader.
    ///
    /// This method reads a network address from the provided asynchronous reader using the
    /// SOCKS5 address format (RFC 1928). It reads the address type byte, followed by the
    /// appropriate address data and port number.
    ///
    /// According to RFC 1928, SOCKS5 address format is:
    /// ```text
    /// +------+----------+----------+
    /// | ATYP | DST.ADDR | DST.PORT |
    /// +------+----------+----------+
    /// |  1   | Variable |    2     |
    /// +------+----------+----------+
    /// ```
    /// `ATYP`: Address type - 0x01 (IPv4), 0x03 (domain name), 0x04 (IPv6)
    ///
    /// `ADDR`: Destination address, format depends on ATYP
    ///
    /// `PORT`: Destination port, network byte order (big-endian)
    pub async fn decode_from_reader<T>(reader: &mut T) -> Result<(Self, usize)>
    where
        T: AsyncRead + Unpin,
    {
        let addr_type = AddressType::try_from(reader.read_u8().await?)?;
        match addr_type {
            AddressType::IPv4 => {
                let mut ip = [0u8; 4];
                reader.read_exact(&mut ip).await?;
                let port = reader.read_u16().await?;

                // len(addr_type) + len(ip) + len(port)
                Ok((Address::IPv4((Ipv4Addr::from(ip), port)), 1 + 4 + 2))
            }
            AddressType::DomainName => {
                let len = reader.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                reader.read_exact(&mut domain).await?;
                let domain_str =
                    String::from_utf8(domain).map_err(|_| AddrError::InvalidDomainNameEncoding)?;
                let port = reader.read_u16().await?;

                // len(addr_type) + len(domain_len) + len(domain) + len(port)
                Ok((Address::DomainName((domain_str, port)), 1 + 1 + len + 2))
            }
            AddressType::IPv6 => {
                let mut ip = [0u8; 16];
                reader.read_exact(&mut ip).await?;
                let port = reader.read_u16().await?;

                // len(addr_type) + len(ip) + len(port)
                Ok((Address::IPv6((Ipv6Addr::from(ip), port)), 1 + 16 + 2))
            }
        }
    }

    /// Encodes the address to a SOCKS5-like format and writes it to an asynchronous writer.
    pub async fn encode_to_writer<T>(&self, writer: &mut T) -> Result<usize>
    where
        T: AsyncWrite + Unpin,
    {
        match self {
            Address::IPv4((ip, port)) => {
                writer.write_u8(AddressType::IPv4 as u8).await?;
                writer.write_all(&ip.octets()).await?;
                writer.write_u16(*port).await?;
                Ok(1 + 4 + 2)
            }
            Address::DomainName((domain, port)) => {
                let domain_bytes = domain.as_bytes();
                if domain_bytes.len() > 255 {
                    return Err(AddrError::DomainNameTooLong.into());
                }
                writer.write_u8(AddressType::DomainName as u8).await?;
                writer.write_u8(domain_bytes.len() as u8).await?;
                writer.write_all(domain_bytes).await?;
                writer.write_u16(*port).await?;
                Ok(1 + 1 + domain_bytes.len() + 2)
            }
            Address::IPv6((ip, port)) => {
                writer.write_u8(AddressType::IPv6 as u8).await?;
                writer.write_all(&ip.octets()).await?;
                writer.write_u16(*port).await?;
                Ok(1 + 16 + 2)
            }
        }
    }

    /// Decodes a SOCKS5-like address from a byte buffer.
    pub fn decode_from_buf(buf: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(buf);

        let addr_type = AddressType::try_from(cursor.read_u8()?)?;
        match addr_type {
            AddressType::IPv4 => {
                let mut ip = [0u8; 4];
                cursor.read_slice(&mut ip)?;
                let port = cursor.read_u16()?;
                Ok((Address::IPv4((Ipv4Addr::from(ip), port)), 1 + 4 + 2))
            }
            AddressType::DomainName => {
                let len = cursor.read_u8()? as usize;
                let mut domain = vec![0u8; len];
                cursor.read_slice(&mut domain)?;
                let domain_str =
                    String::from_utf8(domain).map_err(|_| AddrError::InvalidDomainNameEncoding)?;
                let port = cursor.read_u16()?;
                Ok((Address::DomainName((domain_str, port)), 1 + 1 + len + 2))
            }
            AddressType::IPv6 => {
                let mut ip = [0u8; 16];
                cursor.read_slice(&mut ip)?;
                let port = cursor.read_u16()?;
                Ok((Address::IPv6((Ipv6Addr::from(ip), port)), 1 + 16 + 2))
            }
        }
    }

    /// Encodes the address to a SOCKS5-like format and writes it to a byte buffer.
    pub fn encode_to_buf(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cursor = CursorMut::new(buf);
        match self {
            Address::IPv4((ip, port)) => {
                cursor.write_u8(AddressType::IPv4 as u8)?;
                cursor.write_slice(&ip.octets())?;
                cursor.write_u16(*port)?;
                Ok(1 + 4 + 2)
            }
            Address::DomainName((domain, port)) => {
                let domain_bytes = domain.as_bytes();
                if domain_bytes.len() > 255 {
                    return Err(AddrError::DomainNameTooLong.into());
                }
                cursor.write_u8(AddressType::DomainName as u8)?;
                cursor.write_u8(domain_bytes.len() as u8)?;
                cursor.write_slice(domain_bytes)?;
                cursor.write_u16(*port)?;
                Ok(1 + 1 + domain_bytes.len() + 2)
            }
            Address::IPv6((ip, port)) => {
                cursor.write_u8(AddressType::IPv6 as u8)?;
                cursor.write_slice(&ip.octets())?;
                cursor.write_u16(*port)?;
                Ok(1 + 16 + 2)
            }
        }
    }

    /// Number of bytes [`encode_to_buf`](Address::encode_to_buf) writes for this address.
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::IPv4(_) => 1 + 4 + 2,
            Address::DomainName((domain, _)) => 1 + 1 + domain.len() + 2,
            Address::IPv6(_) => 1 + 16 + 2,
        }
    }

    /// The port component.
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4((_, port)) | Address::DomainName((_, port)) | Address::IPv6((_, port)) => {
                *port
            }
        }
    }

    /// The address as a socket address, if it is not a domain name.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::IPv4((ip, port)) => Some(SocketAddr::new(IpAddr::V4(*ip), *port)),
            Address::IPv6((ip, port)) => Some(SocketAddr::new(IpAddr::V6(*ip), *port)),
            Address::DomainName(_) => None,
        }
    }
}

impl From<SocketAddr> for Address {
    /// IPv4-mapped IPv6 addresses are reported as plain IPv4, which is what
    /// a client expects to see as a bound address on a dual-stack socket.
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::IPv4((*v4.ip(), v4.port())),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => Address::IPv4((ip, v6.port())),
                None => Address::IPv6((*v6.ip(), v6.port())),
            },
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4((ip, port)) => write!(f, "{}:{}", ip, port),
            // IPv6 addresses need to be enclosed in square brackets
            Address::IPv6((ip, port)) => write!(f, "[{}]:{}", ip, port),
            Address::DomainName((domain, port)) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(AddressType::IPv4),
            0x03 => Ok(AddressType::DomainName),
            0x04 => Ok(AddressType::IPv6),
            _ => Err(AddrError::UnsupportedAddressType.into()),
        }
    }
}

/// Errors that can occur address decoding operations.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AddrError {
    /// The address type byte is not a supported address type.
    UnsupportedAddressType,
    /// The domain name exceeds maximum allowed length (255 bytes).
    DomainNameTooLong,
    /// The domain name contains invalid UTF-8 encoding.
    InvalidDomainNameEncoding,
}

impl Display for AddrError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedAddressType => write!(f, "Unsupported address type"),
            Self::DomainNameTooLong => write!(f, "Domain name too long"),
            Self::InvalidDomainNameEncoding => write!(f, "Invalid domain name encoding"),
        }
    }
}

impl std::error::Error for AddrError {}

impl From<AddrError> for Error {
    fn from(e: AddrError) -> Self {
        match e {
            AddrError::UnsupportedAddressType => Error::new(ErrorKind::InvalidData, e),
            AddrError::DomainNameTooLong => Error::new(ErrorKind::InvalidInput, e),
            AddrError::InvalidDomainNameEncoding => Error::new(ErrorKind::InvalidData, e),
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let p = self
            .buf
            .get(self.pos)
            .ok_or(Error::new(ErrorKind::UnexpectedEof, "buffer underflow"))?;
        self.pos += 1;
        Ok(*p)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut p = [0u8; 2];
        self.read_slice(&mut p)?;
        Ok(u16::from_be_bytes(p))
    }

    fn read_slice(&mut self, buf: &mut [u8]) -> Result<()> {
        let p = self
            .buf
            .get(self.pos..self.pos + buf.len())
            .ok_or(Error::new(ErrorKind::UnexpectedEof, "buffer underflow"))?;
        self.pos += buf.len();
        buf.copy_from_slice(p);
        Ok(())
    }
}

struct CursorMut<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> CursorMut<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn write_u8(&mut self, value: u8) -> Result<()> {
        let p = self
            .buf
            .get_mut(self.pos)
            .ok_or(Error::new(ErrorKind::WriteZero, "buffer overflow"))?;
        *p = value;
        self.pos += 1;
        Ok(())
    }

    fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_slice(&value.to_be_bytes())
    }

    fn write_slice(&mut self, value: &[u8]) -> Result<()> {
        let p = self
            .buf
            .get_mut(self.pos..self.pos + value.len())
            .ok_or(Error::new(ErrorKind::WriteZero, "buffer overflow"))?;
        p.copy_from_slice(value);
        self.pos += value.len();
        Ok(())
    }
}
