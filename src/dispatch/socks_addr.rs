//! SOCKS5 address encoding
//!
//! Layout: `ATYP(1) | ADDR(4 / 1+len / 16) | PORT(2, big-endian)`.
//!
//! The bridge itself only tags datagrams with [`SocksAddr::Ip`]. The domain
//! form, [`SocksAddr::domain`] and [`SocksAddr::parse`] are public API for the
//! substrate: rewriting a target to the hostname it maps to, or decoding the
//! address header of a SOCKS5 UDP relay packet.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

const IPV4_ADDR_SIZE: usize = 4;
const IPV6_ADDR_SIZE: usize = 16;
const PORT_SIZE: usize = 2;
const MAX_DOMAIN_LEN: usize = 255;

/// Errors decoding a SOCKS5 address
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocksAddrError {
    /// Input ended before the address was complete
    #[error("address truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    /// Unknown ATYP byte
    #[error("unsupported address type {0:#04x}")]
    UnsupportedType(u8),

    /// Domain name is not valid UTF-8 or too long
    #[error("invalid domain name")]
    InvalidDomain,
}

/// A SOCKS5 destination address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocksAddr {
    /// IP literal with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl SocksAddr {
    /// Domain address, rejecting names longer than 255 bytes
    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self, SocksAddrError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
            return Err(SocksAddrError::InvalidDomain);
        }
        Ok(Self::Domain(name, port))
    }

    /// Destination port
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    /// ATYP byte of this address
    #[must_use]
    pub const fn atyp(&self) -> u8 {
        match self {
            Self::Ip(SocketAddr::V4(_)) => ATYP_IPV4,
            Self::Ip(SocketAddr::V6(_)) => ATYP_IPV6,
            Self::Domain(..) => ATYP_DOMAIN,
        }
    }

    /// The socket address, if this is an IP literal
    #[must_use]
    pub const fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Ip(addr) => Some(*addr),
            Self::Domain(..) => None,
        }
    }

    /// Length of the encoded form
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Ip(SocketAddr::V4(_)) => IPV4_ADDR_SIZE,
            Self::Ip(SocketAddr::V6(_)) => IPV6_ADDR_SIZE,
            Self::Domain(name, _) => 1 + name.len(),
        } + PORT_SIZE
    }

    /// Append the encoded form to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        match self {
            Self::Ip(SocketAddr::V4(v4)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&v4.ip().octets());
                buf.put_u16(v4.port());
            }
            Self::Ip(SocketAddr::V6(v6)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&v6.ip().octets());
                buf.put_u16(v6.port());
            }
            Self::Domain(name, port) => {
                buf.put_u8(ATYP_DOMAIN);
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    /// Encoded form as owned bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Decode an address from the front of `buf`, returning it and the number
    /// of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), SocksAddrError> {
        let atyp = *buf.first().ok_or(SocksAddrError::Truncated {
            needed: 1,
            actual: 0,
        })?;

        match atyp {
            ATYP_IPV4 => {
                let needed = 1 + IPV4_ADDR_SIZE + PORT_SIZE;
                ensure_len(buf, needed)?;
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Self::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port))), needed))
            }
            ATYP_IPV6 => {
                let needed = 1 + IPV6_ADDR_SIZE + PORT_SIZE;
                ensure_len(buf, needed)?;
                let mut octets = [0u8; IPV6_ADDR_SIZE];
                octets.copy_from_slice(&buf[1..=IPV6_ADDR_SIZE]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((
                    Self::Ip(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))),
                    needed,
                ))
            }
            ATYP_DOMAIN => {
                ensure_len(buf, 2)?;
                let len = usize::from(buf[1]);
                let needed = 2 + len + PORT_SIZE;
                ensure_len(buf, needed)?;
                let name = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| SocksAddrError::InvalidDomain)?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((Self::domain(name, port)?, needed))
            }
            other => Err(SocksAddrError::UnsupportedType(other)),
        }
    }
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<(), SocksAddrError> {
    if buf.len() < needed {
        return Err(SocksAddrError::Truncated {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

impl From<SocketAddr> for SocksAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}
