// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::impl_resource;
use crate::schema::instance_type;
use crate::schema::machine_instance_type;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// A group of Machines with matching capabilities at one Site
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
#[diesel(table_name = instance_type)]
pub struct InstanceType {
    pub id: Uuid,
    pub name: String,
    pub infrastructure_provider_id: Uuid,
    pub site_id: Uuid,
    pub time_created: DateTime<Utc>,
}

impl InstanceType {
    pub fn new(
        name: impl Into<String>,
        infrastructure_provider_id: Uuid,
        site_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            infrastructure_provider_id,
            site_id,
            time_created: Utc::now(),
        }
    }
}

impl_resource!(InstanceType, InstanceType);

/// Association of one Machine with one InstanceType
///
/// A Machine has at most one association at any time.
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
#[diesel(table_name = machine_instance_type)]
pub struct MachineInstanceType {
    pub id: Uuid,
    pub machine_id: Uuid,
    pub instance_type_id: Uuid,
    pub time_created: DateTime<Utc>,
}

impl MachineInstanceType {
    pub fn new(machine_id: Uuid, instance_type_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            machine_id,
            instance_type_id,
            time_created: Utc::now(),
        }
    }
}

impl_resource!(MachineInstanceType, MachineInstanceType);
