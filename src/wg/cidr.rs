//! IPv4 CIDR blocks used for the tunnel address space.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("missing '/' prefix length")]
    MissingPrefix,
    #[error("invalid address: {0}")]
    Address(String),
    #[error("invalid prefix length: {0}")]
    Prefix(String),
    #[error("prefix /{0} leaves no usable hosts")]
    TooSmall(u8),
}

/// An IPv4 network such as `10.0.0.0/24`.
///
/// The first usable host is reserved for the tunnel interface; the
/// remaining hosts form the leasable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    fn broadcast(&self) -> u32 {
        u32::from(self.network) | !self.mask()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == u32::from(self.network)
    }

    /// Address of the tunnel interface (first usable host).
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// Leasable addresses in ascending order: every host except the
    /// network, broadcast and gateway addresses.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network) + 2;
        let last = self.broadcast() - 1;
        (first..=last).map(Ipv4Addr::from)
    }

    pub fn capacity(&self) -> u64 {
        (self.broadcast() - u32::from(self.network)) as u64 - 2
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.trim().split_once('/').ok_or(CidrError::MissingPrefix)?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| CidrError::Address(addr.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| CidrError::Prefix(prefix.to_string()))?;
        if prefix > 32 {
            return Err(CidrError::Prefix(prefix.to_string()));
        }
        // network + gateway + broadcast + at least one lease
        if prefix > 30 {
            return Err(CidrError::TooSmall(prefix));
        }
        let mut cidr = Cidr {
            network: addr,
            prefix,
        };
        cidr.network = Ipv4Addr::from(u32::from(addr) & cidr.mask());
        Ok(cidr)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}
