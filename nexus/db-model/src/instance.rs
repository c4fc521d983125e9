// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::impl_resource;
use crate::schema::instance;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// A tenant workload running on a Machine
///
/// Instances are created elsewhere; the consistency engine only counts them.
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
#[diesel(table_name = instance, treat_none_as_null = true)]
pub struct Instance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub allocation_id: Uuid,
    pub allocation_constraint_id: Uuid,
    pub instance_type_id: Uuid,
    pub machine_id: Uuid,
    pub time_created: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        tenant_id: Uuid,
        site_id: Uuid,
        allocation_id: Uuid,
        allocation_constraint_id: Uuid,
        instance_type_id: Uuid,
        machine_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            site_id,
            allocation_id,
            allocation_constraint_id,
            instance_type_id,
            machine_id,
            time_created: Utc::now(),
        }
    }
}

impl_resource!(Instance, Instance);
