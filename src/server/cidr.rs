//! CIDR ranges for filter chain address predicates.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidrError {
    #[error("missing '/' in CIDR range '{0}'")]
    MissingPrefixLen(String),

    #[error("invalid address in CIDR range '{0}'")]
    InvalidAddress(String),

    #[error("prefix length {len} exceeds {max} in CIDR range '{range}'")]
    PrefixTooLong { range: String, len: u8, max: u8 },

    #[error("invalid prefix length in CIDR range '{0}'")]
    InvalidPrefixLen(String),
}

/// An address prefix such as `192.168.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidrRange {
    addr: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, CidrError> {
        let max = max_prefix_len(&addr);
        if prefix_len > max {
            return Err(CidrError::PrefixTooLong {
                range: format!("{addr}/{prefix_len}"),
                len: prefix_len,
                max,
            });
        }
        Ok(Self { addr, prefix_len })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// IPv4-mapped IPv6 addresses are compared as IPv4.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let (net, prefix_len) = self.canonical();
        match (net, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_eq(u32::from(net).into(), u32::from(ip).into(), 32, prefix_len)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_eq(u128::from(net), u128::from(ip), 128, prefix_len)
            }
            _ => false,
        }
    }

    /// A mapped range becomes IPv4; its prefix loses the 96 mapping bits.
    fn canonical(&self) -> (IpAddr, u8) {
        match self.addr {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => (IpAddr::V4(v4), self.prefix_len.saturating_sub(96)),
                None => (self.addr, self.prefix_len),
            },
            IpAddr::V4(_) => (self.addr, self.prefix_len),
        }
    }
}

fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn prefix_eq(a: u128, b: u128, width: u32, prefix_len: u8) -> bool {
    let prefix_len = u32::from(prefix_len).min(width);
    if prefix_len == 0 {
        return true;
    }
    let shift = width - prefix_len;
    (a >> shift) == (b >> shift)
}

impl FromStr for CidrRange {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| CidrError::MissingPrefixLen(s.to_string()))?;
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| CidrError::InvalidAddress(s.to_string()))?;
        let len: u8 = len
            .trim()
            .parse()
            .map_err(|_| CidrError::InvalidPrefixLen(s.to_string()))?;
        Self::new(addr, len)
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}
