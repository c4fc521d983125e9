// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Params define the request bodies of API endpoints for creating or
//! updating resources.

use ironplane_db_model::AllocationResourceType;
use ironplane_db_model::ConstraintType;
use ironplane_db_model::RoutingType;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Create-time parameters for an `Allocation`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AllocationCreate {
    pub name: String,
    pub description: Option<String>,
    pub infrastructure_provider_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub constraints: Vec<AllocationConstraintCreate>,
}

/// Create-time parameters for an `AllocationConstraint`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AllocationConstraintCreate {
    pub resource_type: AllocationResourceType,
    pub resource_type_id: Uuid,
    pub constraint_type: ConstraintType,
    /// A Machine count for an InstanceType, a prefix length for an IpBlock
    pub constraint_value: u32,
}

/// Create-time parameters for a provider-owned `IpBlock`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IpBlockCreate {
    pub name: String,
    pub infrastructure_provider_id: Uuid,
    pub site_id: Uuid,
    pub routing_type: RoutingType,
    /// The block's CIDR, with no host bits set
    pub cidr: String,
}

/// Create-time parameters for a block carved out of a tenant's own block
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DerivedIpBlockCreate {
    pub name: String,
    pub tenant_id: Uuid,
    /// The tenant-owned block to carve from
    pub source_ip_block_id: Uuid,
    pub prefix_length: u8,
}
