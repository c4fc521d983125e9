// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical IP prefixes and the address arithmetic behind them

use crate::cidr_for;
use crate::parse_cidr;
use crate::IpamError;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::str::FromStr;

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Number of bits in an address of this version
    pub const fn width(self) -> u8 {
        match self {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "IPv4"),
            IpVersion::V6 => write!(f, "IPv6"),
        }
    }
}

/// An IP prefix in canonical form: no host bits are set in its base address.
///
/// Addresses of both versions are held as `u128` so that the allocator can do
/// its arithmetic once.  Ordering is by version, then base address, then
/// length.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Prefix {
    version: IpVersion,
    base: u128,
    len: u8,
}

/// Returns the mask covering the low `host_bits` bits.
pub(crate) fn host_mask(host_bits: u8) -> u128 {
    if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    }
}

impl Prefix {
    /// Builds a prefix from an address and length.
    ///
    /// Fails if the length does not fit the address family or if `addr` has
    /// bits set below the prefix length.
    pub fn new(addr: IpAddr, len: u8) -> Result<Prefix, IpamError> {
        let prefix = Prefix::masked(addr, len)?;
        if prefix.addr() != addr {
            return Err(IpamError::InvalidCidr {
                cidr: cidr_for(addr, len),
                reason: format!("host bits are set; did you mean {}?", prefix),
            });
        }
        Ok(prefix)
    }

    /// Builds a prefix from an address, discarding any host bits.
    pub fn masked(addr: IpAddr, len: u8) -> Result<Prefix, IpamError> {
        let (version, base) = match addr {
            IpAddr::V4(a) => (IpVersion::V4, u128::from(u32::from(a))),
            IpAddr::V6(a) => (IpVersion::V6, u128::from(a)),
        };
        if len > version.width() {
            return Err(IpamError::InvalidCidr {
                cidr: cidr_for(addr, len),
                reason: format!(
                    "{} prefix length must be at most {}",
                    version,
                    version.width()
                ),
            });
        }
        let host_bits = version.width() - len;
        Ok(Prefix { version, base: base & !host_mask(host_bits), len })
    }

    pub(crate) fn from_parts(version: IpVersion, base: u128, len: u8) -> Self {
        Prefix { version, base, len }
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    /// Network address of this prefix
    pub fn addr(&self) -> IpAddr {
        match self.version {
            // The base of an IPv4 prefix always fits in 32 bits.
            IpVersion::V4 => IpAddr::V4(Ipv4Addr::from(self.base as u32)),
            IpVersion::V6 => IpAddr::V6(Ipv6Addr::from(self.base)),
        }
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub(crate) fn base(&self) -> u128 {
        self.base
    }

    pub(crate) fn host_bits(&self) -> u8 {
        self.version.width() - self.len
    }

    /// Last address covered by this prefix
    pub(crate) fn last(&self) -> u128 {
        self.base | host_mask(self.host_bits())
    }

    /// Number of addresses covered, saturating at `u128::MAX` for `::/0`
    pub fn size(&self) -> u128 {
        host_mask(self.host_bits()).saturating_add(1)
    }

    /// Returns true if `other` lies entirely within `self`.
    pub fn contains(&self, other: &Prefix) -> bool {
        self.version == other.version
            && self.len <= other.len
            && other.base >= self.base
            && other.last() <= self.last()
    }

    pub fn overlaps(&self, other: &Prefix) -> bool {
        self.version == other.version
            && self.base <= other.last()
            && other.base <= self.last()
    }

    /// This prefix as the network type the ledger stores
    pub fn network(&self) -> Result<IpNetwork, IpamError> {
        IpNetwork::new(self.addr(), self.len).map_err(|e| {
            IpamError::InvalidCidr {
                cidr: self.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

impl TryFrom<IpNetwork> for Prefix {
    type Error = IpamError;

    /// Fails for a network whose address has host bits set.
    fn try_from(network: IpNetwork) -> Result<Self, Self::Error> {
        Prefix::new(network.ip(), network.prefix())
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&cidr_for(self.addr(), self.len))
    }
}

impl FromStr for Prefix {
    type Err = IpamError;

    /// Parses `"<addr>/<len>"`, rejecting non-canonical prefixes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cidr(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_and_display() {
        let p: Prefix = "10.0.0.0/16".parse().unwrap();
        assert_eq!(p.version(), IpVersion::V4);
        assert_eq!(p.len(), 16);
        assert_eq!(p.size(), 65536);
        assert_eq!(p.to_string(), "10.0.0.0/16");

        let p: Prefix = "fd00:1122::/48".parse().unwrap();
        assert_eq!(p.version(), IpVersion::V6);
        assert_eq!(p.to_string(), "fd00:1122::/48");
    }

    #[test]
    fn test_non_canonical_rejected() {
        let err = "10.0.0.1/16".parse::<Prefix>().unwrap_err();
        assert_matches!(err, IpamError::InvalidCidr { reason, .. } => {
            assert!(reason.contains("10.0.0.0/16"), "{reason}");
        });
        assert_matches!(
            "10.0.0.0/33".parse::<Prefix>(),
            Err(IpamError::InvalidCidr { .. })
        );
        assert_matches!(
            "not-a-cidr".parse::<Prefix>(),
            Err(IpamError::InvalidCidr { .. })
        );
    }

    #[test]
    fn test_containment() {
        let parent: Prefix = "10.0.0.0/16".parse().unwrap();
        let child: Prefix = "10.0.4.0/22".parse().unwrap();
        let outside: Prefix = "10.1.0.0/24".parse().unwrap();
        let v6: Prefix = "::/16".parse().unwrap();

        assert!(parent.contains(&child));
        assert!(!child.contains(&parent));
        assert!(parent.overlaps(&child) && child.overlaps(&parent));
        assert!(!parent.contains(&outside));
        assert!(!parent.overlaps(&outside));
        assert!(!parent.overlaps(&v6));
    }

    #[test]
    fn test_network_conversion() {
        let p: Prefix = "10.2.0.0/20".parse().unwrap();
        let network = p.network().unwrap();
        assert_eq!(network.to_string(), "10.2.0.0/20");
        assert_eq!(Prefix::try_from(network).unwrap(), p);

        // A network can carry host bits; a prefix cannot.
        let loose: IpNetwork = "10.2.0.9/20".parse().unwrap();
        assert_matches!(
            Prefix::try_from(loose),
            Err(IpamError::InvalidCidr { .. })
        );
    }

    #[test]
    fn test_full_width_prefix() {
        let all: Prefix = "::/0".parse().unwrap();
        assert_eq!(all.size(), u128::MAX);
        assert_eq!(all.last(), u128::MAX);
        let host: Prefix = "192.168.1.7/32".parse().unwrap();
        assert_eq!(host.size(), 1);
    }
}
