//! SOCKS5 wire protocol (RFC 1928)
//!
//! Only the subset the local listener speaks: method NONE, command
//! CONNECT. The server side of the exchange is used by the acceptor; the
//! client side backs [`crate::client::Client::dial`] and the tests.

use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS5 version byte
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required" method
pub const METHOD_NONE: u8 = 0x00;

/// "No acceptable methods" answer
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Reply code for success
pub const REP_SUCCESS: u8 = 0x00;

/// SOCKS errors
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid SOCKS version: {0}")]
    InvalidVersion(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("request failed with code {0}")]
    RequestFailed(u8),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = SocksError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(SocksError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = SocksError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(SocksError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Target address carried by requests, replies and CONNECT frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the address type byte
    pub fn atyp(&self) -> AddressType {
        match self {
            Address::Ipv4(..) => AddressType::Ipv4,
            Address::Domain(..) => AddressType::Domain,
            Address::Ipv6(..) => AddressType::Ipv6,
        }
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Raw address bytes as they appear on the tunnel wire
    /// (no length byte for domains)
    pub fn raw(&self) -> &[u8] {
        match self {
            Address::Ipv4(ip, _) => ip,
            Address::Ipv6(ip, _) => ip,
            Address::Domain(domain, _) => domain.as_bytes(),
        }
    }

    /// Rebuild an address from its type, raw bytes and port
    pub fn from_raw(atyp: AddressType, raw: &[u8], port: u16) -> Result<Self, SocksError> {
        match atyp {
            AddressType::Ipv4 => {
                let ip: [u8; 4] = raw
                    .try_into()
                    .map_err(|_| SocksError::InvalidAddress(format!("ipv4 length {}", raw.len())))?;
                Ok(Address::Ipv4(ip, port))
            }
            AddressType::Ipv6 => {
                let ip: [u8; 16] = raw
                    .try_into()
                    .map_err(|_| SocksError::InvalidAddress(format!("ipv6 length {}", raw.len())))?;
                Ok(Address::Ipv6(ip, port))
            }
            AddressType::Domain => {
                let domain = std::str::from_utf8(raw)
                    .map_err(|_| SocksError::InvalidAddress("domain not utf-8".to_string()))?;
                if domain.is_empty() || domain.len() > 255 {
                    return Err(SocksError::InvalidAddress(format!(
                        "domain length {}",
                        domain.len()
                    )));
                }
                Ok(Address::Domain(domain.to_string(), port))
            }
        }
    }

    /// Read an address body (after the ATYP byte) from a stream
    async fn read_body<S>(stream: &mut S, atyp: AddressType) -> Result<Self, SocksError>
    where
        S: AsyncRead + Unpin,
    {
        match atyp {
            AddressType::Ipv4 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                let port = read_port(stream).await?;
                Ok(Address::Ipv4(ip, port))
            }
            AddressType::Domain => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                let port = read_port(stream).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| SocksError::InvalidAddress("domain not utf-8".to_string()))?;
                Ok(Address::Domain(domain, port))
            }
            AddressType::Ipv6 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                let port = read_port(stream).await?;
                Ok(Address::Ipv6(ip, port))
            }
        }
    }

    /// Append the RFC 1928 encoding (ATYP, address, port) to a buffer
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.atyp() as u8);
        match self {
            Address::Ipv4(ip, port) => {
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Ipv6(ip, port) => {
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => {
                write!(f, "[{}]:{}", std::net::Ipv6Addr::from(*ip), port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16, SocksError> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// Server side: perform the no-auth negotiation.
///
/// Fails the connection if the client does not offer method NONE.
pub async fn negotiate<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(head[0]));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NONE) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableMethod);
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NONE]).await?;
    Ok(())
}

/// Server side: read the request and return the CONNECT destination.
///
/// Any command other than CONNECT is answered with the matching failure
/// reply before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<Address, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(head[0]));
    }

    match Command::try_from(head[1]) {
        Ok(Command::Connect) => {}
        _ => {
            let reply_to = Address::Ipv4([0; 4], 0);
            write_reply(stream, Reply::CommandNotSupported as u8, &reply_to).await?;
            return Err(SocksError::UnsupportedCommand(head[1]));
        }
    }

    let atyp = match AddressType::try_from(head[3]) {
        Ok(atyp) => atyp,
        Err(e) => {
            let reply_to = Address::Ipv4([0; 4], 0);
            write_reply(stream, Reply::AddressTypeNotSupported as u8, &reply_to).await?;
            return Err(e);
        }
    };

    Address::read_body(stream, atyp).await
}

/// Write a SOCKS5 reply with the given code and bound address
pub async fn write_reply<W>(stream: &mut W, rep: u8, bound: &Address) -> Result<(), SocksError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![SOCKS_VERSION, rep, 0x00];
    bound.encode_into(&mut buf);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Client side: negotiate with method NONE
pub async fn client_negotiate<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS_VERSION, 1, METHOD_NONE]).await?;

    let mut answer = [0u8; 2];
    stream.read_exact(&mut answer).await?;
    if answer[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(answer[0]));
    }
    if answer[1] != METHOD_NONE {
        return Err(SocksError::NoAcceptableMethod);
    }
    Ok(())
}

/// Client side: send a CONNECT request
pub async fn client_request<S>(stream: &mut S, target: &Address) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = vec![SOCKS_VERSION, Command::Connect as u8, 0x00];
    target.encode_into(&mut buf);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Client side: read a reply, returning the code and bound address
pub async fn client_read_reply<S>(stream: &mut S) -> Result<(u8, Address), SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(head[0]));
    }
    let atyp = AddressType::try_from(head[3])?;
    let bound = Address::read_body(stream, atyp).await?;
    Ok((head[1], bound))
}

/// Client side: full CONNECT exchange; errors unless the reply succeeds
pub async fn client_connect<S>(stream: &mut S, target: &Address) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client_negotiate(stream).await?;
    client_request(stream, target).await?;
    let (rep, _) = client_read_reply(stream).await?;
    if rep != REP_SUCCESS {
        return Err(SocksError::RequestFailed(rep));
    }
    Ok(())
}
