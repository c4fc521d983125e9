// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Allocations and their constraints

use super::compensation::AllocatorUndo;
use super::constraint_validation::check_instance_type_update;
use super::constraint_validation::check_machine_capacity;
use super::ip_block::tenant_block_lock;
use super::params;
use chrono::Utc;
use ironplane_common::api::external::CreateResult;
use ironplane_common::api::external::DeleteResult;
use ironplane_common::api::external::Error;
use ironplane_common::api::external::ResourceType;
use ironplane_common::api::external::UpdateResult;
use ironplane_db_model::Allocation;
use ironplane_db_model::AllocationConstraint;
use ironplane_db_model::AllocationResourceType;
use ironplane_db_model::ConstraintType;
use ironplane_db_model::InstanceType;
use ironplane_db_model::IpBlock;
use ironplane_db_model::IpBlockStatus;
use ironplane_db_model::SqlU32;
use ironplane_db_queries::context::OpContext;
use ironplane_db_queries::db::Transaction;
use site_agent_client::CreateTenant;
use site_agent_client::SiteCommand;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Advisory lock identity serializing changes to one tenant's allocations
/// from one provider at one Site
fn allocation_lock(allocation: &Allocation) -> String {
    tenant_allocation_lock(
        allocation.infrastructure_provider_id,
        allocation.site_id,
        allocation.tenant_id,
    )
}

fn tenant_allocation_lock(
    infrastructure_provider_id: Uuid,
    site_id: Uuid,
    tenant_id: Uuid,
) -> String {
    format!("{}-{}-{}", infrastructure_provider_id, site_id, tenant_id)
}

fn prefix_length(value: u32) -> Result<u8, Error> {
    u8::try_from(value).map_err(|_| {
        Error::invalid_value(
            "constraint_value",
            format!("{} is not a prefix length", value),
        )
    })
}

/// Takes the locks an operation on `constraints` contends on.
///
/// Backing resources (InstanceTypes and parent IpBlocks) are locked first,
/// then each tenant block carved for a constraint, each group in sorted
/// order.  The allocation's own lock must already be held.
async fn lock_constraint_resources(
    tx: &mut Transaction,
    opctx: &OpContext,
    tenant_id: Uuid,
    constraints: &[(Uuid, Option<Uuid>)],
) -> Result<(), Error> {
    let resources: BTreeSet<Uuid> =
        constraints.iter().map(|(resource_id, _)| *resource_id).collect();
    for resource_id in resources {
        tx.advisory_lock(opctx, &resource_id.to_string()).await?;
    }
    let derived: BTreeSet<Uuid> =
        constraints.iter().filter_map(|(_, derived)| *derived).collect();
    for derived_id in derived {
        tx.advisory_lock(opctx, &tenant_block_lock(tenant_id, derived_id))
            .await?;
    }
    Ok(())
}

impl super::Nexus {
    /// Creates an Allocation with its constraints.
    ///
    /// Every constraint is validated against current capacity, and a tenant
    /// block is carved for each IpBlock constraint.  If this is the tenant's
    /// first allocation at the Site, the Site is then asked to create the
    /// tenant.
    pub async fn allocation_create(
        &self,
        opctx: &OpContext,
        params: &params::AllocationCreate,
    ) -> CreateResult<(Allocation, Vec<AllocationConstraint>)> {
        let mut resources = BTreeSet::new();
        for constraint in &params.constraints {
            if !resources.insert(constraint.resource_type_id) {
                return Err(Error::invalid_request(format!(
                    "resource {} appears in more than one constraint",
                    constraint.resource_type_id
                )));
            }
        }

        let mut tx =
            self.datastore.transaction(opctx, "allocation_create").await?;
        tx.advisory_lock(
            opctx,
            &tenant_allocation_lock(
                params.infrastructure_provider_id,
                params.site_id,
                params.tenant_id,
            ),
        )
        .await?;
        let locks: Vec<(Uuid, Option<Uuid>)> =
            resources.iter().map(|id| (*id, None)).collect();
        lock_constraint_resources(&mut tx, opctx, params.tenant_id, &locks)
            .await?;

        if tx
            .allocations_for_tenant_at_site(
                params.infrastructure_provider_id,
                params.tenant_id,
                params.site_id,
            )
            .await?
            .iter()
            .any(|a| a.name == params.name)
        {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Allocation,
                object_name: params.name.clone(),
            });
        }
        let first_at_site = !tx
            .tenant_has_allocation_at_site(params.tenant_id, params.site_id)
            .await?;
        let allocation = tx
            .insert(Allocation::new(
                params.name.clone(),
                params.description.clone(),
                params.infrastructure_provider_id,
                params.tenant_id,
                params.site_id,
            ))
            .await?;

        let mut undo = AllocatorUndo::new(&opctx.log, &self.ipam);
        let mut constraints = Vec::with_capacity(params.constraints.len());
        for constraint in &params.constraints {
            constraints.push(
                self.allocation_constraint_insert(
                    opctx,
                    &mut tx,
                    &mut undo,
                    &allocation,
                    constraint,
                )
                .await?,
            );
        }
        tx.commit().await?;
        undo.disarm();
        info!(opctx.log, "created allocation";
            "allocation_id" => %allocation.id,
            "tenant_id" => %allocation.tenant_id,
            "site_id" => %allocation.site_id,
            "constraints" => constraints.len(),
        );

        if first_at_site {
            let command = SiteCommand::CreateTenant(CreateTenant {
                tenant_id: allocation.tenant_id,
                site_id: allocation.site_id,
            });
            self.site_dispatch(opctx, allocation.site_id, command).await?;
        }
        Ok((allocation, constraints))
    }

    /// Deletes an Allocation, its constraints, and the tenant blocks carved
    /// for them.
    ///
    /// Refused while any constraint is still in use.
    pub async fn allocation_delete(
        &self,
        opctx: &OpContext,
        allocation_id: Uuid,
    ) -> DeleteResult {
        // The tenant/provider/site binding never changes, so the lock
        // identity can be read before locking.
        let allocation =
            self.datastore.fetch::<Allocation>(opctx, allocation_id).await?;
        let mut tx =
            self.datastore.transaction(opctx, "allocation_delete").await?;
        tx.advisory_lock(opctx, &allocation_lock(&allocation)).await?;
        let allocation = tx.fetch::<Allocation>(allocation_id).await?;
        let constraints = tx.constraints_for_allocation(allocation.id).await?;
        let locks: Vec<_> = constraints
            .iter()
            .map(|c| (c.resource_type_id, c.derived_resource_id))
            .collect();
        lock_constraint_resources(&mut tx, opctx, allocation.tenant_id, &locks)
            .await?;

        for constraint in &constraints {
            self.allocation_constraint_check_unused(opctx, &mut tx, constraint)
                .await?;
        }
        let mut undo = AllocatorUndo::new(&opctx.log, &self.ipam);
        for constraint in &constraints {
            self.allocation_constraint_remove(&mut tx, &mut undo, constraint)
                .await?;
        }
        tx.delete::<Allocation>(allocation.id).await?;
        tx.commit().await?;
        undo.disarm();
        info!(opctx.log, "deleted allocation";
            "allocation_id" => %allocation.id,
            "constraints" => constraints.len(),
        );
        Ok(())
    }

    /// Adds one constraint to an existing Allocation.
    pub async fn allocation_constraint_create(
        &self,
        opctx: &OpContext,
        allocation_id: Uuid,
        params: &params::AllocationConstraintCreate,
    ) -> CreateResult<AllocationConstraint> {
        let allocation =
            self.datastore.fetch::<Allocation>(opctx, allocation_id).await?;
        let mut tx = self
            .datastore
            .transaction(opctx, "allocation_constraint_create")
            .await?;
        tx.advisory_lock(opctx, &allocation_lock(&allocation)).await?;
        lock_constraint_resources(
            &mut tx,
            opctx,
            allocation.tenant_id,
            &[(params.resource_type_id, None)],
        )
        .await?;
        let allocation = tx.fetch::<Allocation>(allocation_id).await?;
        if tx
            .constraints_for_allocation(allocation.id)
            .await?
            .iter()
            .any(|c| c.resource_type_id == params.resource_type_id)
        {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::AllocationConstraint,
                object_name: format!(
                    "{} {} on allocation {}",
                    params.resource_type, params.resource_type_id, allocation.id
                ),
            });
        }

        let mut undo = AllocatorUndo::new(&opctx.log, &self.ipam);
        let constraint = self
            .allocation_constraint_insert(
                opctx,
                &mut tx,
                &mut undo,
                &allocation,
                params,
            )
            .await?;
        tx.commit().await?;
        undo.disarm();
        info!(opctx.log, "created allocation constraint";
            "constraint_id" => %constraint.id,
            "allocation_id" => %allocation.id,
        );
        Ok(constraint)
    }

    /// Changes a constraint's value.
    ///
    /// For an InstanceType constraint this is a Machine count.  For an
    /// IpBlock constraint it is a prefix length, and the tenant block is
    /// carved again at the new size.
    pub async fn allocation_constraint_update(
        &self,
        opctx: &OpContext,
        constraint_id: Uuid,
        new_value: u32,
    ) -> UpdateResult<AllocationConstraint> {
        let constraint = self
            .datastore
            .fetch::<AllocationConstraint>(opctx, constraint_id)
            .await?;
        if *constraint.constraint_value == new_value {
            return Ok(constraint);
        }
        let allocation = self
            .datastore
            .fetch::<Allocation>(opctx, constraint.allocation_id)
            .await?;

        let mut tx = self
            .datastore
            .transaction(opctx, "allocation_constraint_update")
            .await?;
        tx.advisory_lock(opctx, &allocation_lock(&allocation)).await?;
        lock_constraint_resources(
            &mut tx,
            opctx,
            allocation.tenant_id,
            &[(constraint.resource_type_id, constraint.derived_resource_id)],
        )
        .await?;

        // Re-read now that nothing else can change it.
        let mut constraint =
            tx.fetch::<AllocationConstraint>(constraint_id).await?;
        if *constraint.constraint_value == new_value {
            return Ok(constraint);
        }

        let mut undo = AllocatorUndo::new(&opctx.log, &self.ipam);
        match constraint.resource_type {
            AllocationResourceType::InstanceType => {
                check_instance_type_update(
                    &opctx.log,
                    &mut tx,
                    &constraint,
                    new_value,
                )
                .await?;
            }
            AllocationResourceType::IpBlock => {
                self.tenant_block_recarve(
                    opctx,
                    &mut tx,
                    &mut undo,
                    &constraint,
                    new_value,
                )
                .await?;
            }
        }

        let old_value = *constraint.constraint_value;
        constraint.constraint_value = SqlU32::new(new_value);
        constraint.time_modified = Utc::now();
        let constraint = tx.update(constraint).await?;
        tx.commit().await?;
        undo.disarm();
        info!(opctx.log, "updated allocation constraint";
            "constraint_id" => %constraint.id,
            "old_value" => old_value,
            "new_value" => new_value,
        );
        Ok(constraint)
    }

    /// Removes one constraint from its Allocation.
    pub async fn allocation_constraint_delete(
        &self,
        opctx: &OpContext,
        constraint_id: Uuid,
    ) -> DeleteResult {
        let constraint = self
            .datastore
            .fetch::<AllocationConstraint>(opctx, constraint_id)
            .await?;
        let allocation = self
            .datastore
            .fetch::<Allocation>(opctx, constraint.allocation_id)
            .await?;

        let mut tx = self
            .datastore
            .transaction(opctx, "allocation_constraint_delete")
            .await?;
        tx.advisory_lock(opctx, &allocation_lock(&allocation)).await?;
        lock_constraint_resources(
            &mut tx,
            opctx,
            allocation.tenant_id,
            &[(constraint.resource_type_id, constraint.derived_resource_id)],
        )
        .await?;
        let constraint =
            tx.fetch::<AllocationConstraint>(constraint_id).await?;

        self.allocation_constraint_check_unused(opctx, &mut tx, &constraint)
            .await?;
        let mut undo = AllocatorUndo::new(&opctx.log, &self.ipam);
        self.allocation_constraint_remove(&mut tx, &mut undo, &constraint)
            .await?;
        tx.commit().await?;
        undo.disarm();
        info!(opctx.log, "deleted allocation constraint";
            "constraint_id" => %constraint.id,
        );
        Ok(())
    }

    /// Validates a new constraint on `allocation` and stages it, along with
    /// the tenant block it needs.
    async fn allocation_constraint_insert(
        &self,
        opctx: &OpContext,
        tx: &mut Transaction,
        undo: &mut AllocatorUndo<'_>,
        allocation: &Allocation,
        params: &params::AllocationConstraintCreate,
    ) -> CreateResult<AllocationConstraint> {
        let mut constraint = AllocationConstraint::new(
            allocation.id,
            params.resource_type,
            params.resource_type_id,
            params.constraint_type,
            params.constraint_value,
        );

        match params.resource_type {
            AllocationResourceType::InstanceType => {
                let instance_type =
                    tx.fetch::<InstanceType>(params.resource_type_id).await?;
                if instance_type.infrastructure_provider_id
                    != allocation.infrastructure_provider_id
                    || instance_type.site_id != allocation.site_id
                {
                    return Err(Error::invalid_request(format!(
                        "InstanceType {} is not offered by this provider at \
                         this Site",
                        instance_type.id
                    )));
                }
                if params.constraint_type != ConstraintType::Reserved {
                    return Err(Error::invalid_request(format!(
                        "{} constraints are not supported for InstanceTypes",
                        params.constraint_type
                    )));
                }
                check_machine_capacity(
                    &opctx.log,
                    tx,
                    instance_type.id,
                    u64::from(params.constraint_value),
                    None,
                )
                .await?;
            }
            AllocationResourceType::IpBlock => {
                let parent =
                    tx.fetch::<IpBlock>(params.resource_type_id).await?;
                if parent.is_derived()
                    || parent.infrastructure_provider_id
                        != allocation.infrastructure_provider_id
                    || parent.site_id != allocation.site_id
                {
                    return Err(Error::invalid_request(format!(
                        "IpBlock {} is not a provider block at this Site",
                        parent.id
                    )));
                }
                if params.constraint_type == ConstraintType::Preemptible {
                    return Err(Error::invalid_request(
                        "Preemptible constraints are not supported for \
                         IpBlocks",
                    ));
                }
                let length = prefix_length(params.constraint_value)?;
                let prefix = self
                    .ip_block_carve_child(tx, undo, &parent, length)
                    .await?;
                let block = tx
                    .insert(parent.new_derived(
                        format!("{}-{}", allocation.name, parent.name),
                        allocation.tenant_id,
                        prefix.network()?,
                        IpBlockStatus::Ready,
                    ))
                    .await?;
                info!(opctx.log, "carved tenant block";
                    "ip_block_id" => %block.id,
                    "parent_id" => %parent.id,
                    "cidr" => block.cidr(),
                );
                constraint.derived_resource_id = Some(block.id);
            }
        }
        tx.insert(constraint).await
    }

    /// Fails if anything still consumes `constraint`.
    async fn allocation_constraint_check_unused(
        &self,
        opctx: &OpContext,
        tx: &mut Transaction,
        constraint: &AllocationConstraint,
    ) -> Result<(), Error> {
        match constraint.resource_type {
            AllocationResourceType::InstanceType => {
                let instances =
                    tx.instance_count_for_constraint(constraint.id).await?;
                if instances > 0 {
                    warn!(opctx.log, "constraint still in use";
                        "constraint_id" => %constraint.id,
                        "instances" => instances,
                    );
                    return Err(Error::invalid_request(format!(
                        "allocation constraint {} is used by {} Instance(s)",
                        constraint.id, instances
                    )));
                }
            }
            AllocationResourceType::IpBlock => {
                let Some(block_id) = constraint.derived_resource_id else {
                    return Ok(());
                };
                let subnets = tx.subnet_count_for_block(block_id).await?;
                if subnets > 0 {
                    warn!(opctx.log, "constraint still in use";
                        "constraint_id" => %constraint.id,
                        "subnets" => subnets,
                    );
                    return Err(Error::invalid_request(format!(
                        "IpBlock {} of allocation constraint {} is used by {} \
                         subnet(s)",
                        block_id, constraint.id, subnets
                    )));
                }
                if !tx.child_ip_blocks(block_id).await?.is_empty() {
                    return Err(Error::invalid_request(format!(
                        "IpBlock {} of allocation constraint {} still has \
                         derived blocks",
                        block_id, constraint.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stages removal of `constraint` and the tenant block carved for it.
    async fn allocation_constraint_remove(
        &self,
        tx: &mut Transaction,
        undo: &mut AllocatorUndo<'_>,
        constraint: &AllocationConstraint,
    ) -> DeleteResult {
        if let Some(block_id) = constraint.derived_resource_id {
            match tx.get::<IpBlock>(block_id).await? {
                Some(block) => {
                    let parent = tx
                        .fetch::<IpBlock>(constraint.resource_type_id)
                        .await?;
                    self.ip_block_release_child(tx, undo, &parent, &block)
                        .await?;
                    tx.delete::<IpBlock>(block.id).await?;
                }
                None => {
                    warn!(self.log, "tenant block already gone";
                        "constraint_id" => %constraint.id,
                        "ip_block_id" => %block_id,
                    );
                }
            }
        }
        tx.delete::<AllocationConstraint>(constraint.id).await
    }

    /// Carves an IpBlock constraint's tenant block again at `new_value`
    /// bits.
    async fn tenant_block_recarve(
        &self,
        opctx: &OpContext,
        tx: &mut Transaction,
        undo: &mut AllocatorUndo<'_>,
        constraint: &AllocationConstraint,
        new_value: u32,
    ) -> Result<(), Error> {
        let length = prefix_length(new_value)?;
        let parent = tx.fetch::<IpBlock>(constraint.resource_type_id).await?;
        if length < parent.prefix_length() {
            return Err(Error::invalid_request(format!(
                "prefix length /{} is larger than IpBlock {} (/{})",
                length,
                parent.id,
                parent.prefix_length()
            )));
        }
        let block_id = constraint.derived_resource_id.ok_or_else(|| {
            Error::internal_error(&format!(
                "IpBlock constraint {} has no tenant block",
                constraint.id
            ))
        })?;
        self.allocation_constraint_check_unused(opctx, tx, constraint).await?;

        let mut block = tx.fetch::<IpBlock>(block_id).await?;
        self.ip_block_release_child(tx, undo, &parent, &block).await?;
        let prefix =
            self.ip_block_carve_child(tx, undo, &parent, length).await?;
        info!(opctx.log, "recarved tenant block";
            "ip_block_id" => %block.id,
            "old_cidr" => block.cidr(),
            "new_prefix" => %prefix,
        );
        block.network = prefix.network()?;
        block.time_modified = Utc::now();
        tx.update(block).await?;
        Ok(())
    }
}
