// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Transaction`] methods on [`IpBlock`]s.

use super::Transaction;
use crate::db::Query;
use ipnetwork::IpNetwork;
use ironplane_common::api::external::Error;
use ironplane_common::api::external::ListResultVec;
use ironplane_db_model::IpBlock;
use ironplane_db_model::RoutingType;
use uuid::Uuid;

impl Transaction {
    /// Lists the blocks carved out of `parent_id`.
    pub async fn child_ip_blocks(
        &mut self,
        parent_id: Uuid,
    ) -> ListResultVec<IpBlock> {
        self.list(Query::IpBlocksWithParent { parent_id }).await
    }

    /// Looks up a provider-owned block by its network.
    pub async fn parent_ip_block_by_network(
        &mut self,
        infrastructure_provider_id: Uuid,
        site_id: Uuid,
        routing_type: RoutingType,
        network: IpNetwork,
    ) -> Result<Option<IpBlock>, Error> {
        let blocks: Vec<IpBlock> = self
            .list(Query::ParentIpBlocksByNetwork {
                infrastructure_provider_id,
                site_id,
                routing_type,
                network,
            })
            .await?;
        Ok(blocks.into_iter().next())
    }
}
