use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use crate::errors::{Error, ErrorKind};

/// Address family preference used when resolving a hostname.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FamilyPreference {
    V4,
    V6,
    Either,
}

/// A validated UDP endpoint: an IPv4 or IPv6 address paired with a non-zero
/// port. Two endpoints compare equal iff family, address bytes, and port all
/// match, which falls out of deriving `PartialEq` on top of `SocketAddr`.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Validates and wraps a `SocketAddr`. Rejects port 0 and wildcard
    /// addresses (`0.0.0.0`, `::`).
    pub fn new(addr: SocketAddr) -> Result<Endpoint, Error> {
        if addr.port() == 0 {
            return Err(ErrorKind::ZeroPort.into());
        }
        let is_wildcard = match addr.ip() {
            IpAddr::V4(v4) => v4 == Ipv4Addr::UNSPECIFIED,
            IpAddr::V6(v6) => v6 == Ipv6Addr::UNSPECIFIED,
        };
        if is_wildcard {
            return Err(ErrorKind::WildcardAddress.into());
        }
        Ok(Endpoint(addr))
    }

    /// Parses `"a.b.c.d:port"` or `"[addr]:port"`, trying the IPv4
    /// presentation form first, per §4.2.
    pub fn parse(address: &str, port: u16) -> Result<Endpoint, Error> {
        if address.is_empty() {
            return Err(ErrorKind::InvalidAddress {
                address: address.to_string(),
            }
            .into());
        }
        let ip: IpAddr = address
            .parse::<Ipv4Addr>()
            .map(IpAddr::V4)
            .or_else(|_| address.parse::<Ipv6Addr>().map(IpAddr::V6))
            .map_err(|_| ErrorKind::InvalidAddress {
                address: address.to_string(),
            })?;
        Endpoint::new(SocketAddr::new(ip, port))
    }

    /// Resolves a hostname via the system resolver. A named side-entry, not
    /// used on the hot path: `start()`/bootstrap is the only caller.
    pub fn resolve(
        host: &str,
        port: u16,
        family_preference: FamilyPreference,
    ) -> Result<Endpoint, Error> {
        let lookup = format!("{}:{}", host, port);
        let mut resolved = lookup
            .to_socket_addrs()
            .map_err(|cause| ErrorKind::ResolveFailed {
                host: host.to_string(),
                cause: cause.to_string(),
            })?;

        let chosen = match family_preference {
            FamilyPreference::V4 => resolved.find(SocketAddr::is_ipv4),
            FamilyPreference::V6 => resolved.find(SocketAddr::is_ipv6),
            FamilyPreference::Either => resolved.next(),
        }
        .ok_or_else(|| ErrorKind::ResolveFailed {
            host: host.to_string(),
            cause: "no address of the requested family".to_string(),
        })?;

        Endpoint::new(chosen)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn is_v4(&self) -> bool {
        self.0.is_ipv4()
    }

    pub fn is_v6(&self) -> bool {
        self.0.is_ipv6()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for Endpoint {
    /// Infallible conversion for addresses already known to be valid (e.g.
    /// `UdpSocket::peer_addr`/`recv_from`). Panics on a wildcard or zero
    /// port, which a real peer address never is.
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr).expect("socket address observed on the wire must be a valid endpoint")
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wildcard_and_zero_port() {
        assert!(Endpoint::parse("0.0.0.0", 6881).is_err());
        assert!(Endpoint::parse("::", 6881).is_err());
        assert!(Endpoint::parse("1.2.3.4", 0).is_err());
    }

    #[test]
    fn accepts_v4_and_v6() {
        let v4 = Endpoint::parse("127.0.0.1", 6881).unwrap();
        assert!(v4.is_v4());
        let v6 = Endpoint::parse("::1", 6881).unwrap();
        assert!(v6.is_v6());
    }

    #[test]
    fn equality_compares_family_address_and_port() {
        let a = Endpoint::parse("1.2.3.4", 6881).unwrap();
        let b = Endpoint::parse("1.2.3.4", 6881).unwrap();
        let c = Endpoint::parse("1.2.3.4", 6882).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
