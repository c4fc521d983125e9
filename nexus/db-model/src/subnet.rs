// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::impl_resource;
use crate::schema::subnet;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// A tenant network drawing its addresses from a derived IpBlock
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
#[diesel(table_name = subnet, treat_none_as_null = true)]
pub struct Subnet {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub ip_block_id: Uuid,
    pub time_created: DateTime<Utc>,
}

impl Subnet {
    pub fn new(tenant_id: Uuid, ip_block_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            ip_block_id,
            time_created: Utc::now(),
        }
    }
}

impl_resource!(Subnet, Subnet);
