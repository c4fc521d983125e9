// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Transaction`] methods on [`Instance`]s.

use super::Transaction;
use crate::db::Query;
use ironplane_common::api::external::Error;
use ironplane_db_model::Instance;
use uuid::Uuid;

impl Transaction {
    /// Counts the instances consuming the given constraint.
    pub async fn instance_count_for_constraint(
        &mut self,
        allocation_constraint_id: Uuid,
    ) -> Result<usize, Error> {
        self.count::<Instance>(Query::InstancesForConstraint {
            allocation_constraint_id,
        })
        .await
    }

    pub async fn instance_on_machine(
        &mut self,
        machine_id: Uuid,
    ) -> Result<Option<Instance>, Error> {
        let instances: Vec<Instance> =
            self.list(Query::InstancesOnMachine { machine_id }).await?;
        Ok(instances.into_iter().next())
    }
}
