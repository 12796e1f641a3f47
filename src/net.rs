//! IP interface values and NetworkManager wire encodings

use crate::error::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// IPv4 address with prefix length (e.g. "10.0.0.2/24")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ipv4Interface {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

/// IPv6 address with prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ipv6Interface {
    pub address: Ipv6Addr,
    pub prefix: u8,
}

/// Either family of interface address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpInterface {
    V4(Ipv4Interface),
    V6(Ipv6Interface),
}

impl Ipv4Interface {
    pub fn new(address: Ipv4Addr, prefix: u8) -> PluginResult<Self> {
        if prefix > 32 {
            return Err(PluginError::InvalidSettings(format!("Invalid IPv4 prefix: {}", prefix)));
        }
        Ok(Self { address, prefix })
    }

    /// Network address (host bits cleared)
    pub fn network(&self) -> Ipv4Addr {
        let mask = if self.prefix == 0 { 0 } else { u32::MAX << (32 - self.prefix) };
        Ipv4Addr::from(u32::from(self.address) & mask)
    }

    /// True if the address names a single host rather than a network
    pub fn is_host_address(&self) -> bool {
        self.network() != self.address || self.prefix == 32
    }
}

impl Ipv6Interface {
    pub fn new(address: Ipv6Addr, prefix: u8) -> PluginResult<Self> {
        if prefix > 128 {
            return Err(PluginError::InvalidSettings(format!("Invalid IPv6 prefix: {}", prefix)));
        }
        Ok(Self { address, prefix })
    }

    pub fn network(&self) -> Ipv6Addr {
        let mask = if self.prefix == 0 { 0 } else { u128::MAX << (128 - self.prefix) };
        Ipv6Addr::from(u128::from(self.address) & mask)
    }

    pub fn is_host_address(&self) -> bool {
        self.network() != self.address || self.prefix == 128
    }
}

impl IpInterface {
    pub fn address(&self) -> IpAddr {
        match self {
            IpInterface::V4(v4) => IpAddr::V4(v4.address),
            IpInterface::V6(v6) => IpAddr::V6(v6.address),
        }
    }

    pub fn prefix(&self) -> u8 {
        match self {
            IpInterface::V4(v4) => v4.prefix,
            IpInterface::V6(v6) => v6.prefix,
        }
    }

    pub fn is_host_address(&self) -> bool {
        match self {
            IpInterface::V4(v4) => v4.is_host_address(),
            IpInterface::V6(v6) => v6.is_host_address(),
        }
    }

    /// The network this interface belongs to, as an interface value
    pub fn network(&self) -> IpInterface {
        match self {
            IpInterface::V4(v4) => IpInterface::V4(Ipv4Interface { address: v4.network(), prefix: v4.prefix }),
            IpInterface::V6(v6) => IpInterface::V6(Ipv6Interface { address: v6.network(), prefix: v6.prefix }),
        }
    }
}

fn split_cidr(s: &str) -> PluginResult<(IpAddr, Option<u8>)> {
    let s = s.trim();
    let (addr, prefix) = match s.split_once('/') {
        Some((addr, prefix)) => {
            let prefix = prefix
                .parse::<u8>()
                .map_err(|_| PluginError::InvalidSettings(format!("Invalid prefix length in '{}'", s)))?;
            (addr, Some(prefix))
        }
        None => (s, None),
    };
    let addr = addr
        .parse::<IpAddr>()
        .map_err(|_| PluginError::InvalidSettings(format!("Invalid IP address: '{}'", s)))?;
    Ok((addr, prefix))
}

impl FromStr for IpInterface {
    type Err = PluginError;

    /// Parses "addr/prefix"; a bare address gets a full-length prefix
    fn from_str(s: &str) -> PluginResult<Self> {
        match split_cidr(s)? {
            (IpAddr::V4(addr), prefix) => Ok(IpInterface::V4(Ipv4Interface::new(addr, prefix.unwrap_or(32))?)),
            (IpAddr::V6(addr), prefix) => Ok(IpInterface::V6(Ipv6Interface::new(addr, prefix.unwrap_or(128))?)),
        }
    }
}

impl fmt::Display for IpInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address(), self.prefix())
    }
}

/// Picks the last IPv4 and last IPv6 entry out of a list of interface strings
pub fn addresses_by_family<S: AsRef<str>>(
    addrs: &[S],
) -> PluginResult<(Option<Ipv4Interface>, Option<Ipv6Interface>)> {
    let mut ipv4 = None;
    let mut ipv6 = None;
    for addr in addrs {
        match addr.as_ref().parse::<IpInterface>()? {
            IpInterface::V4(v4) => ipv4 = Some(v4),
            IpInterface::V6(v6) => ipv6 = Some(v6),
        }
    }
    Ok((ipv4, ipv6))
}

/// IPv4 address as NetworkManager expects it on the wire: the network-order
/// octets reinterpreted as a native-endian u32.
pub fn ipv4_to_u32(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

/// IPv6 address as 16 network-order bytes
pub fn ipv6_to_bytes(addr: Ipv6Addr) -> Vec<u8> {
    addr.octets().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interfaces() {
        let v4: IpInterface = "10.1.2.3/24".parse().unwrap();
        assert_eq!(v4.prefix(), 24);
        assert_eq!(v4.to_string(), "10.1.2.3/24");

        let bare: IpInterface = "100.64.0.1".parse().unwrap();
        assert_eq!(bare.prefix(), 32);

        let v6: IpInterface = "fd7a:115c:a1e0::1/48".parse().unwrap();
        assert!(matches!(v6, IpInterface::V6(_)));

        assert!("10.0.0.1/33".parse::<IpInterface>().is_err());
        assert!("not-an-ip/24".parse::<IpInterface>().is_err());
    }

    #[test]
    fn test_host_address() {
        let host: IpInterface = "10.0.0.5/24".parse().unwrap();
        assert!(host.is_host_address());
        assert_eq!(host.network().to_string(), "10.0.0.0/24");

        let net: IpInterface = "10.0.0.0/24".parse().unwrap();
        assert!(!net.is_host_address());

        let single: IpInterface = "10.0.0.0/32".parse().unwrap();
        assert!(single.is_host_address());
    }

    #[test]
    fn test_addresses_by_family() {
        let (v4, v6) = addresses_by_family(&["100.64.0.7", "fd7a:115c:a1e0::7"]).unwrap();
        assert_eq!(v4.unwrap().address, Ipv4Addr::new(100, 64, 0, 7));
        assert_eq!(v6.unwrap().prefix, 128);

        let (v4, v6) = addresses_by_family::<&str>(&[]).unwrap();
        assert!(v4.is_none() && v6.is_none());
    }

    #[test]
    fn test_wire_encoding() {
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(ipv4_to_u32(addr).to_ne_bytes(), [10, 0, 0, 1]);
        assert_eq!(ipv4_to_u32(Ipv4Addr::BROADCAST), u32::MAX);
        assert_eq!(ipv6_to_bytes(Ipv6Addr::LOCALHOST)[15], 1);
    }
}
