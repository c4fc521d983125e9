// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Transaction`] methods on [`Machine`]s.

use super::Transaction;
use crate::db::Query;
use ironplane_common::api::external::Error;
use ironplane_db_model::Machine;
use uuid::Uuid;

impl Transaction {
    /// Counts the machines of an InstanceType that can back a reservation.
    pub async fn machine_supply(
        &mut self,
        instance_type_id: Uuid,
    ) -> Result<u64, Error> {
        let count = self
            .count::<Machine>(Query::SupplyMachines { instance_type_id })
            .await?;
        Ok(count as u64)
    }
}
