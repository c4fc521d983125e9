// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Transaction`] methods on [`Subnet`]s.

use super::Transaction;
use crate::db::Query;
use ironplane_common::api::external::Error;
use ironplane_db_model::Subnet;
use uuid::Uuid;

impl Transaction {
    /// Counts the subnets drawing addresses from the given IpBlock.
    pub async fn subnet_count_for_block(
        &mut self,
        ip_block_id: Uuid,
    ) -> Result<usize, Error> {
        self.count::<Subnet>(Query::SubnetsForBlock { ip_block_id }).await
    }
}
