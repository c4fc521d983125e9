// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::impl_enum_type;
use crate::impl_resource;
use crate::schema::allocation_constraint;
use crate::SqlU32;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

impl_enum_type!(
    #[derive(SqlType, Debug, QueryId)]
    #[diesel(postgres_type(name = "allocation_resource_type"))]
    pub struct AllocationResourceTypeEnum;

    /// Kind of resource a constraint bounds
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
    pub enum AllocationResourceType;

    /// The value counts Machines of one InstanceType.
    InstanceType => b"instance_type"
    /// The value is the prefix length of a block carved from a parent
    /// IpBlock.
    IpBlock => b"ip_block"
);

impl_enum_type!(
    #[derive(SqlType, Debug, QueryId)]
    #[diesel(postgres_type(name = "constraint_type"))]
    pub struct ConstraintTypeEnum;

    /// How the constrained resource is guaranteed
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
    pub enum ConstraintType;

    Reserved => b"reserved"
    OnDemand => b"on_demand"
    Preemptible => b"preemptible"
);

/// A typed quota line on an [`crate::Allocation`]
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
#[diesel(table_name = allocation_constraint, treat_none_as_null = true)]
pub struct AllocationConstraint {
    pub id: Uuid,
    pub allocation_id: Uuid,
    pub resource_type: AllocationResourceType,
    /// The InstanceType, or the parent IpBlock, backing this constraint
    pub resource_type_id: Uuid,
    pub constraint_type: ConstraintType,
    pub constraint_value: SqlU32,
    /// The child IpBlock carved for an IpBlock constraint
    pub derived_resource_id: Option<Uuid>,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

impl AllocationConstraint {
    pub fn new(
        allocation_id: Uuid,
        resource_type: AllocationResourceType,
        resource_type_id: Uuid,
        constraint_type: ConstraintType,
        constraint_value: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            allocation_id,
            resource_type,
            resource_type_id,
            constraint_type,
            constraint_value: SqlU32::new(constraint_value),
            derived_resource_id: None,
            time_created: now,
            time_modified: now,
        }
    }

    pub fn is_reserved_instance_type(&self) -> bool {
        self.resource_type == AllocationResourceType::InstanceType
            && self.constraint_type == ConstraintType::Reserved
    }
}

impl_resource!(AllocationConstraint, AllocationConstraint);
