// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key derivation shared by the allocator and its callers

use crate::IpamError;
use crate::Prefix;
use std::fmt::Display;
use std::net::IpAddr;
use uuid::Uuid;

/// Returns the allocator namespace for blocks of one routing type owned by
/// one provider at one site: `"<routingType>/<providerID>/<siteID>"`.
pub fn namespace_for(
    routing_type: impl Display,
    provider_id: Uuid,
    site_id: Uuid,
) -> String {
    format!("{}/{}/{}", routing_type, provider_id, site_id)
}

/// Returns `"<prefix>/<length>"`.
pub fn cidr_for(prefix: IpAddr, length: u8) -> String {
    format!("{}/{}", prefix, length)
}

/// Parses `"<prefix>/<length>"` into a canonical [`Prefix`].
///
/// A CIDR with host bits set, such as `10.0.0.7/24`, is rejected rather than
/// masked.
pub fn parse_cidr(cidr: &str) -> Result<Prefix, IpamError> {
    let (addr, len) =
        cidr.split_once('/').ok_or_else(|| IpamError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: String::from("missing prefix length"),
        })?;
    let addr: IpAddr = addr.parse().map_err(|e: std::net::AddrParseError| {
        IpamError::InvalidCidr { cidr: cidr.to_string(), reason: e.to_string() }
    })?;
    let len: u8 = len.parse().map_err(|e: std::num::ParseIntError| {
        IpamError::InvalidCidr { cidr: cidr.to_string(), reason: e.to_string() }
    })?;
    Prefix::new(addr, len)
}
