// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Transaction`] methods on [`MachineInstanceType`] associations.

use super::Transaction;
use crate::db::Query;
use ironplane_common::api::external::Error;
use ironplane_common::api::external::ListResultVec;
use ironplane_db_model::MachineInstanceType;
use uuid::Uuid;

impl Transaction {
    /// Returns the association of `machine_id` with an InstanceType, if any.
    pub async fn association_for_machine(
        &mut self,
        machine_id: Uuid,
    ) -> Result<Option<MachineInstanceType>, Error> {
        let associations: Vec<MachineInstanceType> =
            self.list(Query::AssociationsForMachine { machine_id }).await?;
        Ok(associations.into_iter().next())
    }

    pub async fn associations_for_instance_type(
        &mut self,
        instance_type_id: Uuid,
    ) -> ListResultVec<MachineInstanceType> {
        self.list(Query::AssociationsForInstanceType { instance_type_id })
            .await
    }
}
