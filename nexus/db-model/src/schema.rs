// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes the Diesel database schema.
//!
//! NOTE: Should be kept up-to-date with dbinit.sql.

table! {
    allocation (id) {
        id -> Uuid,
        name -> Text,
        description -> Nullable<Text>,
        infrastructure_provider_id -> Uuid,
        tenant_id -> Uuid,
        site_id -> Uuid,
        time_created -> Timestamptz,
        time_modified -> Timestamptz,
    }
}

table! {
    allocation_constraint (id) {
        id -> Uuid,
        allocation_id -> Uuid,
        resource_type -> crate::AllocationResourceTypeEnum,
        resource_type_id -> Uuid,
        constraint_type -> crate::ConstraintTypeEnum,
        constraint_value -> Int8,
        derived_resource_id -> Nullable<Uuid>,
        time_created -> Timestamptz,
        time_modified -> Timestamptz,
    }
}

table! {
    instance (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        site_id -> Uuid,
        allocation_id -> Uuid,
        allocation_constraint_id -> Uuid,
        instance_type_id -> Uuid,
        machine_id -> Uuid,
        time_created -> Timestamptz,
    }
}

table! {
    instance_type (id) {
        id -> Uuid,
        name -> Text,
        infrastructure_provider_id -> Uuid,
        site_id -> Uuid,
        time_created -> Timestamptz,
    }
}

table! {
    ip_block (id) {
        id -> Uuid,
        name -> Text,
        site_id -> Uuid,
        infrastructure_provider_id -> Uuid,
        tenant_id -> Nullable<Uuid>,
        parent_id -> Nullable<Uuid>,
        routing_type -> crate::RoutingTypeEnum,
        network -> Inet,
        protocol_version -> crate::ProtocolVersionEnum,
        full_grant -> Bool,
        status -> crate::IpBlockStatusEnum,
        time_created -> Timestamptz,
        time_modified -> Timestamptz,
    }
}

table! {
    machine (id) {
        id -> Uuid,
        infrastructure_provider_id -> Uuid,
        site_id -> Uuid,
        instance_type_id -> Nullable<Uuid>,
        status -> crate::MachineStatusEnum,
        time_created -> Timestamptz,
        time_modified -> Timestamptz,
    }
}

table! {
    machine_instance_type (id) {
        id -> Uuid,
        machine_id -> Uuid,
        instance_type_id -> Uuid,
        time_created -> Timestamptz,
    }
}

table! {
    subnet (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        ip_block_id -> Uuid,
        time_created -> Timestamptz,
    }
}

allow_tables_to_appear_in_same_query!(
    allocation,
    allocation_constraint,
    instance,
    instance_type,
    ip_block,
    machine,
    machine_instance_type,
    subnet,
);
