//! CIDR codec: family-tagged, fixed-width prefixes.
//!
//! Both families share one 128-bit representation. IPv4 addresses live in
//! the low 32 bits, so ordering is `(family, address, length)` and the
//! containment predicates are plain mask arithmetic.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidrError {
    #[error("'{0}' is not a valid address or prefix")]
    Syntax(String),

    #[error("prefix length /{len} is out of range for IPv{family}")]
    Length { family: u8, len: u8 },

    #[error("'{input}' has host bits set, the network is {canonical}")]
    HostBits { input: String, canonical: String },
}

/// What to do with input whose host bits are set, e.g. `10.1.2.3/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostBits {
    /// Refuse the input and tell the caller what the network is.
    #[default]
    Reject,
    /// Silently clear the host bits.
    Mask,
}

/// Address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Address width in bits.
    pub fn width(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// The number used on the wire: 4 or 6.
    pub fn number(self) -> u8 {
        match self {
            Family::V4 => 4,
            Family::V6 => 6,
        }
    }

    pub fn from_number(n: i64) -> Option<Self> {
        match n {
            4 => Some(Family::V4),
            6 => Some(Family::V6),
            _ => None,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl Serialize for Family {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.number())
    }
}

impl<'de> Deserialize<'de> for Family {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = i64::deserialize(deserializer)?;
        Family::from_number(n)
            .ok_or_else(|| serde::de::Error::custom("family must be 4 or 6"))
    }
}

/// Bits below the prefix length.
fn host_mask(width: u8, len: u8) -> u128 {
    let bits = u32::from(width - len);
    if bits == 0 {
        0
    } else if bits >= 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    }
}

/// An address plus prefix length, always stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cidr {
    family: Family,
    addr: u128,
    len: u8,
}

impl Cidr {
    /// Canonicalize an `ipnet` prefix, applying `policy` to host bits.
    pub fn from_net(net: IpNet, policy: HostBits) -> Result<Self, CidrError> {
        let canonical = net.trunc();
        if canonical != net && policy == HostBits::Reject {
            return Err(CidrError::HostBits {
                input: net.to_string(),
                canonical: canonical.to_string(),
            });
        }
        Ok(Cidr::from(canonical))
    }

    /// Build from parts already known to be canonical. Used for range
    /// bounds and sub-block arithmetic inside the crate.
    pub(crate) fn from_parts(family: Family, addr: u128, len: u8) -> Self {
        debug_assert!(len <= family.width());
        Cidr {
            family,
            addr: addr & !host_mask(family.width(), len),
            len,
        }
    }

    /// A single address as a full-length prefix.
    pub fn host(ip: IpAddr) -> Self {
        let (family, addr) = from_ip(ip);
        Cidr { family, addr, len: family.width() }
    }

    /// Parse CIDR text. Accepts `addr/len`, a bare address (full length)
    /// and shortened IPv4 forms such as `10/8` or `172.16/12`.
    pub fn parse(input: &str, policy: HostBits) -> Result<Self, CidrError> {
        let s = input.trim();
        if let Ok(net) = s.parse::<IpNet>() {
            return Cidr::from_net(net, policy);
        }

        let (addr_part, len_part) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (s, None),
        };
        let ip = match addr_part.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) if len_part.is_some() => expand_ipv4(addr_part)
                .ok_or_else(|| CidrError::Syntax(input.to_string()))?,
            Err(_) => return Err(CidrError::Syntax(input.to_string())),
        };
        let len = match len_part {
            Some(l) => l
                .parse::<u8>()
                .map_err(|_| CidrError::Syntax(input.to_string()))?,
            None => from_ip(ip).0.width(),
        };

        let net = IpNet::new(ip, len).map_err(|_| CidrError::Length {
            family: from_ip(ip).0.number(),
            len,
        })?;
        Cidr::from_net(net, policy)
    }

    /// The same prefix as an `ipnet` value.
    pub fn to_ipnet(&self) -> IpNet {
        // `len` never exceeds the family width
        match self.network_ip() {
            IpAddr::V4(a) => IpNet::V4(Ipv4Net::new(a, self.len).unwrap_or_default()),
            IpAddr::V6(a) => IpNet::V6(Ipv6Net::new(a, self.len).unwrap_or_default()),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    /// First address as an integer.
    pub fn network(&self) -> u128 {
        self.addr
    }

    /// Last address as an integer.
    pub fn last(&self) -> u128 {
        self.addr | host_mask(self.family.width(), self.len)
    }

    pub fn network_ip(&self) -> IpAddr {
        to_ip(self.family, self.addr)
    }

    /// True for a single-address prefix (/32 or /128).
    pub fn is_host(&self) -> bool {
        self.len == self.family.width()
    }

    /// Number of addresses covered, saturating for `::/0`.
    pub fn total_addresses(&self) -> u128 {
        let bits = u32::from(self.family.width() - self.len);
        1u128.checked_shl(bits).unwrap_or(u128::MAX)
    }

    /// The prefix of length `len` that contains this one.
    pub fn truncate(&self, len: u8) -> Self {
        Cidr::from_parts(self.family, self.addr, len.min(self.len))
    }

    /// The `index`-th sub-block of length `len`, or `None` when `len` is
    /// shorter than this prefix or `index` is past the end.
    pub fn subnet(&self, index: u128, len: u8) -> Option<Cidr> {
        if len < self.len || len > self.family.width() {
            return None;
        }
        let span = u32::from(len - self.len);
        if span < 128 && index >> span != 0 {
            return None;
        }
        let shift = u32::from(self.family.width() - len);
        let offset = if shift >= 128 { 0 } else { index << shift };
        Some(Cidr::from_parts(self.family, self.addr | offset, len))
    }

    /// `self` covers `other` (equal counts).
    pub fn contains(&self, other: &Cidr) -> bool {
        self.family == other.family && self.to_ipnet().contains(&other.to_ipnet())
    }

    /// `self` covers `other` and is strictly larger.
    pub fn contains_strict(&self, other: &Cidr) -> bool {
        self.len < other.len && self.contains(other)
    }

    /// Equal, containing or contained.
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Address rendered with another prefix length, e.g. a host shown with
    /// the mask of the assignment it lives in.
    pub fn display_with_len(&self, len: u8) -> String {
        format!("{}/{}", self.network_ip(), len)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_ipnet().fmt(f)
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cidr::parse(s, HostBits::Reject)
    }
}

/// Takes the network of `net`; host bits are dropped.
impl From<IpNet> for Cidr {
    fn from(net: IpNet) -> Self {
        let (family, addr) = from_ip(net.network());
        Cidr { family, addr, len: net.prefix_len() }
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn from_ip(ip: IpAddr) -> (Family, u128) {
    match ip {
        IpAddr::V4(a) => (Family::V4, u128::from(u32::from(a))),
        IpAddr::V6(a) => (Family::V6, u128::from(a)),
    }
}

fn to_ip(family: Family, addr: u128) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from(addr as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(addr)),
    }
}

/// Complete a shortened dotted quad (`10`, `10.1`, `10.1.2`) with zero
/// octets. Returns `None` unless every octet is a valid decimal byte.
pub fn expand_ipv4(partial: &str) -> Option<IpAddr> {
    let octets: Vec<&str> = partial.trim_end_matches('.').split('.').collect();
    if octets.is_empty() || octets.len() > 4 {
        return None;
    }
    let mut bytes = [0u8; 4];
    for (i, o) in octets.iter().enumerate() {
        if o.is_empty() || o.len() > 3 || !o.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        bytes[i] = o.parse().ok()?;
    }
    Some(IpAddr::V4(Ipv4Addr::from(bytes)))
}
