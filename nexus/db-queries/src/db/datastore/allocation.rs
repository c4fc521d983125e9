// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Transaction`] methods on [`Allocation`]s.

use super::Transaction;
use crate::db::Query;
use ironplane_common::api::external::Error;
use ironplane_common::api::external::ListResultVec;
use ironplane_db_model::Allocation;
use uuid::Uuid;

impl Transaction {
    /// Lists the allocations `tenant_id` holds at `site_id` from one
    /// provider.
    pub async fn allocations_for_tenant_at_site(
        &mut self,
        infrastructure_provider_id: Uuid,
        tenant_id: Uuid,
        site_id: Uuid,
    ) -> ListResultVec<Allocation> {
        self.list(Query::AllocationsForTenantAtSite {
            infrastructure_provider_id: Some(infrastructure_provider_id),
            tenant_id,
            site_id,
        })
        .await
    }

    /// Returns whether `tenant_id` holds any allocation at `site_id`, from
    /// any provider.
    pub async fn tenant_has_allocation_at_site(
        &mut self,
        tenant_id: Uuid,
        site_id: Uuid,
    ) -> Result<bool, Error> {
        let count = self
            .count::<Allocation>(Query::AllocationsForTenantAtSite {
                infrastructure_provider_id: None,
                tenant_id,
                site_id,
            })
            .await?;
        Ok(count > 0)
    }
}
