// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Associating Machines with InstanceTypes
//!
//! Associations are the supply side of InstanceType capacity, so they are
//! changed under the same InstanceType lock that constraint changes take.
//! Each Machine's own id is locked after that to keep a Machine from being
//! claimed by two InstanceTypes at once.

use super::constraint_validation::check_reservations_satisfied;
use chrono::Utc;
use ironplane_common::api::external::CreateResult;
use ironplane_common::api::external::DeleteResult;
use ironplane_common::api::external::Error;
use ironplane_db_model::InstanceType;
use ironplane_db_model::Machine;
use ironplane_db_model::MachineInstanceType;
use ironplane_db_queries::context::OpContext;
use site_agent_client::AssociateMachinesWithInstanceType;
use site_agent_client::RemoveMachineInstanceTypeAssociation;
use site_agent_client::SiteCommand;
use std::collections::BTreeSet;
use uuid::Uuid;

impl super::Nexus {
    /// Associates each of `machine_ids` with an InstanceType.
    ///
    /// Either every Machine is associated or none is.
    pub async fn instance_type_associate_machines(
        &self,
        opctx: &OpContext,
        instance_type_id: Uuid,
        machine_ids: &[Uuid],
    ) -> CreateResult<Vec<MachineInstanceType>> {
        if machine_ids.is_empty() {
            return Err(Error::invalid_request("no Machines to associate"));
        }
        let sorted: BTreeSet<Uuid> = machine_ids.iter().copied().collect();
        if sorted.len() != machine_ids.len() {
            return Err(Error::invalid_request(
                "a Machine appears more than once",
            ));
        }

        let mut tx = self
            .datastore
            .transaction(opctx, "instance_type_associate_machines")
            .await?;
        tx.advisory_lock(opctx, &instance_type_id.to_string()).await?;
        for machine_id in &sorted {
            tx.advisory_lock(opctx, &machine_id.to_string()).await?;
        }

        let instance_type =
            tx.fetch::<InstanceType>(instance_type_id).await?;
        let mut associations = Vec::with_capacity(sorted.len());
        for machine_id in &sorted {
            let mut machine = tx.fetch::<Machine>(*machine_id).await?;
            if machine.infrastructure_provider_id
                != instance_type.infrastructure_provider_id
                || machine.site_id != instance_type.site_id
            {
                return Err(Error::invalid_request(format!(
                    "Machine {} does not belong to the provider and Site of \
                     InstanceType {}",
                    machine.id, instance_type.id
                )));
            }
            if !machine.status.is_assignable() {
                return Err(Error::invalid_request(format!(
                    "Machine {} is {} and cannot be associated",
                    machine.id, machine.status
                )));
            }
            if let Some(existing) =
                tx.association_for_machine(machine.id).await?
            {
                return Err(Error::conflict(format!(
                    "Machine {} is already associated with InstanceType {}",
                    machine.id, existing.instance_type_id
                )));
            }

            associations.push(
                tx.insert(MachineInstanceType::new(
                    machine.id,
                    instance_type.id,
                ))
                .await?,
            );
            machine.instance_type_id = Some(instance_type.id);
            machine.time_modified = Utc::now();
            tx.update(machine).await?;
        }
        tx.commit().await?;
        info!(opctx.log, "associated machines with instance type";
            "instance_type_id" => %instance_type.id,
            "machines" => associations.len(),
        );

        associations.sort_by_key(|a| a.id);
        let command = SiteCommand::AssociateMachinesWithInstanceType(
            AssociateMachinesWithInstanceType {
                instance_type_id: instance_type.id,
                associations: associations
                    .iter()
                    .map(|a| (a.id, a.machine_id))
                    .collect(),
            },
        );
        self.site_dispatch(opctx, instance_type.site_id, command).await?;
        Ok(associations)
    }

    /// Removes one Machine's association with its InstanceType.
    ///
    /// Refused while the Machine hosts an Instance, or if the InstanceType's
    /// remaining Machines could no longer back its Reserved constraints.
    pub async fn instance_type_disassociate_machine(
        &self,
        opctx: &OpContext,
        association_id: Uuid,
    ) -> DeleteResult {
        // The pair never changes, so it can be read before locking.
        let association = self
            .datastore
            .fetch::<MachineInstanceType>(opctx, association_id)
            .await?;

        let mut tx = self
            .datastore
            .transaction(opctx, "instance_type_disassociate_machine")
            .await?;
        tx.advisory_lock(opctx, &association.instance_type_id.to_string())
            .await?;
        tx.advisory_lock(opctx, &association.machine_id.to_string()).await?;
        let association =
            tx.fetch::<MachineInstanceType>(association_id).await?;

        if let Some(instance) =
            tx.instance_on_machine(association.machine_id).await?
        {
            return Err(Error::invalid_request(format!(
                "Machine {} is running Instance {}",
                association.machine_id, instance.id
            )));
        }

        tx.delete::<MachineInstanceType>(association.id).await?;
        let mut machine = tx.fetch::<Machine>(association.machine_id).await?;
        machine.instance_type_id = None;
        machine.time_modified = Utc::now();
        tx.update(machine).await?;
        check_reservations_satisfied(
            &opctx.log,
            &mut tx,
            association.instance_type_id,
        )
        .await?;
        tx.commit().await?;
        info!(opctx.log, "removed machine instance type association";
            "association_id" => %association.id,
            "machine_id" => %association.machine_id,
            "instance_type_id" => %association.instance_type_id,
        );

        let instance_type = self
            .datastore
            .fetch::<InstanceType>(opctx, association.instance_type_id)
            .await?;
        let command = SiteCommand::RemoveMachineInstanceTypeAssociation(
            RemoveMachineInstanceTypeAssociation {
                association_id: association.id,
                machine_id: association.machine_id,
                instance_type_id: association.instance_type_id,
            },
        );
        // Already absent on the Site is as good as removed.
        self.site_dispatch(opctx, instance_type.site_id, command).await?;
        Ok(())
    }
}
