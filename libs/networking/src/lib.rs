//! Networking utilities for the agent.
//!
//! This library provides helpers for:
//! - IPv4 prefix math (network, netmask, hostmask) for subnet-scoped config
//! - Interface addressing (a port's address combined with its subnet prefix)
//! - Trunk port numbering used to map hosting ports onto device interfaces
//! - VLAN validation

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Only IPv4 is supported on device-facing configuration.
    #[error("unsupported address family for {0}: only IPv4 is supported")]
    UnsupportedFamily(String),

    /// Hosting port name does not follow the trunk naming scheme.
    #[error("unknown hosting port name: {0}")]
    InvalidPortName(String),

    /// VLAN outside 1..=4094.
    #[error("invalid VLAN id: {0} (must be between 1 and 4094)")]
    InvalidVlan(u32),
}

// ============================================================================
// IPv4 prefixes
// ============================================================================

/// IPv4 prefix (network address plus prefix length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Prefix {
    /// Network address of the prefix (host bits cleared).
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    /// Create a new prefix. The address is masked to the prefix.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.0.0.0/24").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let (address, prefix_len) = split_cidr(s)?;
        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Dotted netmask, e.g. 255.255.255.0 for /24.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_mask(self.prefix_len))
    }

    /// Dotted hostmask (wildcard), e.g. 0.0.0.255 for /24.
    pub fn hostmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(!prefix_mask(self.prefix_len))
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.address
    }
}

impl std::fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & prefix_mask(prefix_len))
}

fn split_cidr(s: &str) -> Result<(Ipv4Addr, u8), NetworkError> {
    let Some((addr_str, prefix_str)) = s.split_once('/') else {
        return Err(NetworkError::InvalidPrefix(format!(
            "missing '/' in CIDR: {}",
            s
        )));
    };

    let address = parse_ipv4(addr_str)?;
    let prefix_len = prefix_str
        .parse::<u8>()
        .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

    Ok((address, prefix_len))
}

/// Parse an address string, rejecting IPv6.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, NetworkError> {
    match IpAddr::from_str(s.trim()) {
        Ok(IpAddr::V4(addr)) => Ok(addr),
        Ok(IpAddr::V6(_)) => Err(NetworkError::UnsupportedFamily(s.to_string())),
        Err(_) => Err(NetworkError::InvalidAddress(s.to_string())),
    }
}

// ============================================================================
// Interface addressing
// ============================================================================

/// An address assigned to an interface, with the prefix length of its subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceAddress {
    /// Host address on the interface.
    pub address: Ipv4Addr,

    /// Prefix length of the attached subnet.
    pub prefix_len: u8,
}

impl InterfaceAddress {
    /// Combine a fixed IP with the CIDR of the subnet it was allocated from.
    pub fn from_subnet(ip: &str, subnet_cidr: &str) -> Result<Self, NetworkError> {
        let address = parse_ipv4(ip)?;
        let subnet = Ipv4Prefix::from_cidr(subnet_cidr)?;
        Ok(Self {
            address,
            prefix_len: subnet.prefix_len,
        })
    }

    /// Parse from "address/len" notation without masking the host bits.
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let (address, prefix_len) = split_cidr(s)?;
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// The subnet this address belongs to.
    pub fn prefix(&self) -> Ipv4Prefix {
        Ipv4Prefix {
            address: mask_ipv4(self.address, self.prefix_len),
            prefix_len: self.prefix_len,
        }
    }

    /// Dotted netmask of the attached subnet.
    pub fn netmask(&self) -> Ipv4Addr {
        self.prefix().netmask()
    }
}

impl std::fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

// ============================================================================
// Trunk port numbering
// ============================================================================

/// Name prefix of hosting ports attached to the first trunk.
pub const T1_PORT_PREFIX: &str = "t1_p:";

/// Name prefix of hosting ports attached to the second trunk.
pub const T2_PORT_PREFIX: &str = "t2_p:";

/// Map a hosting port name onto the device's data interface number.
///
/// `t1_p:<n>` ports land on interface `2n`, `t2_p:<n>` ports on `2n + 1`.
pub fn trunk_interface_number(hosting_port_name: &str) -> Result<u32, NetworkError> {
    let (base, offset) = if let Some(rest) = hosting_port_name.strip_prefix(T1_PORT_PREFIX) {
        (rest, 0)
    } else if let Some(rest) = hosting_port_name.strip_prefix(T2_PORT_PREFIX) {
        (rest, 1)
    } else {
        return Err(NetworkError::InvalidPortName(hosting_port_name.to_string()));
    };

    let index: u32 = base
        .trim()
        .parse()
        .map_err(|_| NetworkError::InvalidPortName(hosting_port_name.to_string()))?;

    index
        .checked_mul(2)
        .and_then(|n| n.checked_add(offset))
        .ok_or_else(|| NetworkError::InvalidPortName(hosting_port_name.to_string()))
}

/// Minimum valid 802.1Q VLAN id.
pub const MIN_VLAN: u32 = 1;

/// Maximum valid 802.1Q VLAN id.
pub const MAX_VLAN: u32 = 4094;

/// Validate an 802.1Q VLAN id.
pub fn validate_vlan(vlan: u32) -> Result<u16, NetworkError> {
    if !(MIN_VLAN..=MAX_VLAN).contains(&vlan) {
        return Err(NetworkError::InvalidVlan(vlan));
    }
    Ok(vlan as u16)
}
