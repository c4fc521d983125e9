// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Transaction`] methods on [`AllocationConstraint`]s.

use super::Transaction;
use crate::db::Query;
use ironplane_common::api::external::Error;
use ironplane_common::api::external::ListResultVec;
use ironplane_db_model::AllocationConstraint;
use ironplane_db_model::AllocationResourceType;
use uuid::Uuid;

impl Transaction {
    pub async fn constraints_for_allocation(
        &mut self,
        allocation_id: Uuid,
    ) -> ListResultVec<AllocationConstraint> {
        self.list(Query::ConstraintsForAllocation { allocation_id }).await
    }

    /// Lists every constraint, across all allocations, that bounds the
    /// given resource.
    pub async fn constraints_referencing(
        &mut self,
        resource_type: AllocationResourceType,
        resource_type_id: Uuid,
    ) -> ListResultVec<AllocationConstraint> {
        self.list(Query::ConstraintsReferencing {
            resource_type,
            resource_type_id,
        })
        .await
    }

    /// Counts the constraints whose derived block is `ip_block_id`.
    pub async fn constraint_count_for_derived_block(
        &mut self,
        ip_block_id: Uuid,
    ) -> Result<usize, Error> {
        self.count::<AllocationConstraint>(Query::ConstraintsForDerivedBlock {
            ip_block_id,
        })
        .await
    }

    /// Sums the values of the Reserved constraints on an InstanceType,
    /// across every tenant.
    ///
    /// `excluding` leaves one constraint out of the sum, so that an update
    /// can be checked against the demand of everyone else.
    pub async fn reserved_demand(
        &mut self,
        instance_type_id: Uuid,
        excluding: Option<Uuid>,
    ) -> Result<u64, Error> {
        let demand = self
            .constraints_referencing(
                AllocationResourceType::InstanceType,
                instance_type_id,
            )
            .await?
            .iter()
            .filter(|c| c.is_reserved_instance_type())
            .filter(|c| Some(c.id) != excluding)
            .map(|c| u64::from(*c.constraint_value))
            .sum();
        Ok(demand)
    }
}

#[cfg(test)]
mod test {
    use crate::db::pub_test_utils::datastore_test;
    use ironplane_db_model::AllocationConstraint;
    use ironplane_db_model::AllocationResourceType;
    use ironplane_db_model::ConstraintType;
    use ironplane_test_utils::dev::test_setup_log;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_reserved_demand() {
        let logctx = test_setup_log("test_reserved_demand");
        let (opctx, datastore) = datastore_test(&logctx);
        let instance_type = Uuid::new_v4();

        let a = AllocationConstraint::new(
            Uuid::new_v4(),
            AllocationResourceType::InstanceType,
            instance_type,
            ConstraintType::Reserved,
            3,
        );
        let b = AllocationConstraint::new(
            Uuid::new_v4(),
            AllocationResourceType::InstanceType,
            instance_type,
            ConstraintType::Reserved,
            4,
        );
        // Neither of these counts as demand on `instance_type`.
        let on_demand = AllocationConstraint::new(
            a.allocation_id,
            AllocationResourceType::InstanceType,
            instance_type,
            ConstraintType::OnDemand,
            100,
        );
        let other_type = AllocationConstraint::new(
            a.allocation_id,
            AllocationResourceType::InstanceType,
            Uuid::new_v4(),
            ConstraintType::Reserved,
            100,
        );
        for c in [&a, &b, &on_demand, &other_type] {
            datastore.insert(&opctx, c.clone()).await.unwrap();
        }

        let mut tx = datastore.transaction(&opctx, "test").await.unwrap();
        assert_eq!(tx.reserved_demand(instance_type, None).await.unwrap(), 7);
        assert_eq!(
            tx.reserved_demand(instance_type, Some(b.id)).await.unwrap(),
            3
        );
        assert_eq!(tx.reserved_demand(Uuid::new_v4(), None).await.unwrap(), 0);
        assert_eq!(
            tx.constraints_for_allocation(a.allocation_id)
                .await
                .unwrap()
                .len(),
            3
        );
        assert_eq!(
            tx.constraints_referencing(
                AllocationResourceType::InstanceType,
                instance_type
            )
            .await
            .unwrap()
            .len(),
            3
        );
        drop(tx);
        logctx.cleanup_successful();
    }
}
