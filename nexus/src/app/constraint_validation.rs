// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checks that a proposed quota change can be backed by real capacity
//!
//! Every check here reads the ledger through an open transaction, and must
//! run after that transaction has taken the advisory locks covering what it
//! reads.

use ironplane_common::api::external::Error;
use ironplane_db_model::AllocationConstraint;
use ironplane_db_queries::db::Transaction;
use slog::Logger;
use uuid::Uuid;

/// Machine capacity of one InstanceType
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct MachineCapacity {
    /// Machines that can back a reservation
    pub supply: u64,
    /// Machines already promised by Reserved constraints
    pub reserved: u64,
}

impl MachineCapacity {
    pub(crate) async fn read(
        tx: &mut Transaction,
        instance_type_id: Uuid,
        excluding: Option<Uuid>,
    ) -> Result<MachineCapacity, Error> {
        Ok(MachineCapacity {
            supply: tx.machine_supply(instance_type_id).await?,
            reserved: tx.reserved_demand(instance_type_id, excluding).await?,
        })
    }

    /// Machines neither promised nor spoken for.  Negative when promises
    /// exceed supply.
    pub(crate) fn available(&self) -> i128 {
        i128::from(self.supply) - i128::from(self.reserved)
    }
}

/// Checks that `requested` Machines of an InstanceType can be reserved on
/// top of every Reserved constraint other than `excluding`.
pub(crate) async fn check_machine_capacity(
    log: &Logger,
    tx: &mut Transaction,
    instance_type_id: Uuid,
    requested: u64,
    excluding: Option<Uuid>,
) -> Result<(), Error> {
    let capacity =
        MachineCapacity::read(tx, instance_type_id, excluding).await?;
    if capacity.available() < i128::from(requested) {
        warn!(log, "insufficient machine capacity";
            "instance_type_id" => %instance_type_id,
            "supply" => capacity.supply,
            "reserved" => capacity.reserved,
            "requested" => requested,
        );
        return Err(Error::insufficient_capacity(
            format!(
                "not enough Machines of InstanceType {} are available to \
                 reserve {}",
                instance_type_id, requested
            ),
            format!(
                "supply {}, already reserved {}, requested {}",
                capacity.supply, capacity.reserved, requested
            ),
        ));
    }
    Ok(())
}

/// Validates a new value for an InstanceType constraint.
///
/// The value may never drop below the Instances already consuming the
/// constraint.  A Reserved constraint may only grow by as many Machines as
/// are available.
pub(crate) async fn check_instance_type_update(
    log: &Logger,
    tx: &mut Transaction,
    constraint: &AllocationConstraint,
    new_value: u32,
) -> Result<(), Error> {
    let consumed = tx.instance_count_for_constraint(constraint.id).await?;
    if u64::from(new_value) < consumed as u64 {
        warn!(log, "constraint value below consumption";
            "constraint_id" => %constraint.id,
            "new_value" => new_value,
            "consumed" => consumed,
        );
        return Err(Error::invalid_request(format!(
            "constraint value {} is less than the {} Instances already using \
             it",
            new_value, consumed
        )));
    }

    if constraint.is_reserved_instance_type()
        && new_value > *constraint.constraint_value
    {
        check_machine_capacity(
            log,
            tx,
            constraint.resource_type_id,
            u64::from(new_value),
            Some(constraint.id),
        )
        .await?;
    }
    Ok(())
}

/// Checks that every Reserved constraint on an InstanceType is still backed
/// by enough Machines, as this transaction sees the ledger.  Used after
/// taking a Machine away from the InstanceType.
pub(crate) async fn check_reservations_satisfied(
    log: &Logger,
    tx: &mut Transaction,
    instance_type_id: Uuid,
) -> Result<(), Error> {
    let capacity = MachineCapacity::read(tx, instance_type_id, None).await?;
    if capacity.available() < 0 {
        warn!(log, "change would break reservations";
            "instance_type_id" => %instance_type_id,
            "supply" => capacity.supply,
            "reserved" => capacity.reserved,
        );
        return Err(Error::insufficient_capacity(
            format!(
                "InstanceType {} would no longer have enough Machines for its \
                 Reserved allocations",
                instance_type_id
            ),
            format!(
                "supply would be {}, reserved {}",
                capacity.supply, capacity.reserved
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use ironplane_db_model::AllocationResourceType;
    use ironplane_db_model::ConstraintType;
    use ironplane_db_model::Instance;
    use ironplane_db_model::Machine;
    use ironplane_db_model::MachineStatus;
    use ironplane_db_queries::db::pub_test_utils::datastore_test;
    use ironplane_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn test_instance_type_update_checks() {
        let logctx = test_setup_log("test_instance_type_update_checks");
        let (opctx, datastore) = datastore_test(&logctx);
        let instance_type = Uuid::new_v4();
        for _ in 0..4 {
            let mut machine = Machine::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                MachineStatus::Ready,
            );
            machine.instance_type_id = Some(instance_type);
            datastore.insert(&opctx, machine).await.unwrap();
        }
        let constraint = AllocationConstraint::new(
            Uuid::new_v4(),
            AllocationResourceType::InstanceType,
            instance_type,
            ConstraintType::Reserved,
            2,
        );
        datastore.insert(&opctx, constraint.clone()).await.unwrap();
        for _ in 0..2 {
            let instance = Instance::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                constraint.allocation_id,
                constraint.id,
                instance_type,
                Uuid::new_v4(),
            );
            datastore.insert(&opctx, instance).await.unwrap();
        }

        let mut tx = datastore.transaction(&opctx, "test").await.unwrap();
        let log = &logctx.log;
        assert_matches!(
            check_instance_type_update(log, &mut tx, &constraint, 1).await,
            Err(Error::InvalidRequest { .. })
        );
        check_instance_type_update(log, &mut tx, &constraint, 2)
            .await
            .unwrap();
        check_instance_type_update(log, &mut tx, &constraint, 4)
            .await
            .unwrap();
        assert_matches!(
            check_instance_type_update(log, &mut tx, &constraint, 5).await,
            Err(Error::InsufficientCapacity { .. })
        );
        let capacity =
            MachineCapacity::read(&mut tx, instance_type, None).await.unwrap();
        assert_eq!(capacity.available(), 2);
        check_reservations_satisfied(log, &mut tx, instance_type)
            .await
            .unwrap();
        drop(tx);
        logctx.cleanup_successful();
    }
}
