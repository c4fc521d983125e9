// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::impl_enum_type;
use crate::impl_resource;
use crate::schema::ip_block;
use chrono::DateTime;
use chrono::Utc;
use ipnetwork::IpNetwork;
use ironplane_ipam::cidr_for;
use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;
use uuid::Uuid;

impl_enum_type!(
    #[derive(SqlType, Debug, QueryId)]
    #[diesel(postgres_type(name = "routing_type"))]
    pub struct RoutingTypeEnum;

    #[derive(
        Clone,
        Copy,
        Debug,
        AsExpression,
        FromSqlRow,
        Deserialize,
        Eq,
        PartialEq,
        Serialize,
        strum::Display,
    )]
    pub enum RoutingType;

    Public => b"public"
    DatacenterOnly => b"datacenter_only"
);

impl_enum_type!(
    #[derive(SqlType, Debug, QueryId)]
    #[diesel(postgres_type(name = "protocol_version"))]
    pub struct ProtocolVersionEnum;

    #[derive(
        Clone,
        Copy,
        Debug,
        AsExpression,
        FromSqlRow,
        Deserialize,
        Eq,
        PartialEq,
        Serialize,
        strum::Display,
    )]
    pub enum ProtocolVersion;

    IPv4 => b"ipv4"
    IPv6 => b"ipv6"
);

impl ProtocolVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => ProtocolVersion::IPv4,
            IpAddr::V6(_) => ProtocolVersion::IPv6,
        }
    }
}

impl_enum_type!(
    #[derive(SqlType, Debug, QueryId)]
    #[diesel(postgres_type(name = "ip_block_status"))]
    pub struct IpBlockStatusEnum;

    #[derive(
        Clone,
        Copy,
        Debug,
        AsExpression,
        FromSqlRow,
        Deserialize,
        Eq,
        PartialEq,
        Serialize,
        strum::Display,
    )]
    pub enum IpBlockStatus;

    /// The Site has been asked to provision it.
    Provisioning => b"provisioning"
    Ready => b"ready"
    /// The Site refused it.  Only removal is possible from here.
    Error => b"error"
);

/// A CIDR range record
///
/// Parent blocks are provider-owned (`tenant_id` is `None`).  Derived blocks
/// are tenant-owned and record the block they were carved from in
/// `parent_id`; every derived block has a live reservation in the prefix
/// allocator under its parent's namespace.
#[derive(
    Clone,
    Debug,
    Deserialize,
    PartialEq,
    Serialize,
    Queryable,
    Insertable,
    Selectable,
    AsChangeset,
)]
#[diesel(table_name = ip_block, treat_none_as_null = true)]
pub struct IpBlock {
    pub id: Uuid,
    pub name: String,
    pub site_id: Uuid,
    pub infrastructure_provider_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub routing_type: RoutingType,
    pub network: IpNetwork,
    pub protocol_version: ProtocolVersion,
    /// Set on a block whose whole range has been granted to a single child
    /// without an allocator reservation.
    pub full_grant: bool,
    pub status: IpBlockStatus,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

impl IpBlock {
    /// Describes a new provider-owned block.
    pub fn new_parent(
        name: impl Into<String>,
        infrastructure_provider_id: Uuid,
        site_id: Uuid,
        routing_type: RoutingType,
        network: IpNetwork,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            site_id,
            infrastructure_provider_id,
            tenant_id: None,
            parent_id: None,
            routing_type,
            protocol_version: ProtocolVersion::of(&network.ip()),
            network,
            full_grant: false,
            status: IpBlockStatus::Ready,
            time_created: now,
            time_modified: now,
        }
    }

    /// Describes a tenant-owned block carved out of `self`.
    pub fn new_derived(
        &self,
        name: impl Into<String>,
        tenant_id: Uuid,
        network: IpNetwork,
        status: IpBlockStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            site_id: self.site_id,
            infrastructure_provider_id: self.infrastructure_provider_id,
            tenant_id: Some(tenant_id),
            parent_id: Some(self.id),
            routing_type: self.routing_type,
            protocol_version: self.protocol_version,
            network,
            full_grant: false,
            status,
            time_created: now,
            time_modified: now,
        }
    }

    pub fn is_derived(&self) -> bool {
        self.tenant_id.is_some()
    }

    /// Network address of the block
    pub fn prefix(&self) -> IpAddr {
        self.network.ip()
    }

    pub fn prefix_length(&self) -> u8 {
        self.network.prefix()
    }

    pub fn cidr(&self) -> String {
        cidr_for(self.prefix(), self.prefix_length())
    }
}

impl_resource!(IpBlock, IpBlock);
