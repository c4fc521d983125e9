// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::impl_resource;
use crate::schema::allocation;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// A Tenant's grant to consume resources at a Site from one provider
///
/// The provider/tenant/site binding never changes after creation.
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
#[diesel(table_name = allocation, treat_none_as_null = true)]
pub struct Allocation {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub infrastructure_provider_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

impl Allocation {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        infrastructure_provider_id: Uuid,
        tenant_id: Uuid,
        site_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description,
            infrastructure_provider_id,
            tenant_id,
            site_id,
            time_created: now,
            time_modified: now,
        }
    }
}

impl_resource!(Allocation, Allocation);
