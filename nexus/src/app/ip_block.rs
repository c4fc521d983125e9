// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IP blocks: provider-owned parents, and the tenant-owned blocks carved out
//! of them

use super::compensation::AllocatorUndo;
use super::params;
use super::DispatchError;
use chrono::Utc;
use ironplane_common::api::external::CreateResult;
use ironplane_common::api::external::DeleteResult;
use ironplane_common::api::external::Error;
use ironplane_common::api::external::InternalContext;
use ironplane_common::api::external::LookupResult;
use ironplane_common::api::external::ResourceType;
use ironplane_common::bail_unless;
use ironplane_db_model::AllocationResourceType;
use ironplane_db_model::IpBlock;
use ironplane_db_model::IpBlockStatus;
use ironplane_db_queries::context::OpContext;
use ironplane_db_queries::db::Transaction;
use ironplane_ipam::namespace_for;
use ironplane_ipam::parse_cidr;
use ironplane_ipam::Prefix;
use ironplane_ipam::Usage;
use site_agent_client::ClientError;
use site_agent_client::CreateIpBlock;
use site_agent_client::DeleteIpBlock;
use site_agent_client::SiteCommand;
use slog_error_chain::InlineErrorChain;
use uuid::Uuid;

/// Allocator namespace holding `block`'s address space
pub(crate) fn block_namespace(block: &IpBlock) -> String {
    namespace_for(
        block.routing_type,
        block.infrastructure_provider_id,
        block.site_id,
    )
}

pub(crate) fn block_prefix(block: &IpBlock) -> Result<Prefix, Error> {
    Prefix::try_from(block.network).map_err(|err| {
        Error::internal_error(&format!(
            "IpBlock {} has an invalid prefix: {}",
            block.id,
            InlineErrorChain::new(&err)
        ))
    })
}

/// Advisory lock identity serializing all carving under one tenant's use of
/// one block
pub(crate) fn tenant_block_lock(
    tenant_id: Uuid,
    ip_block_id: Uuid,
) -> String {
    format!("{}-{}", tenant_id, ip_block_id)
}

impl super::Nexus {
    /// Carves a `/length` child out of `parent`, returning its CIDR.
    ///
    /// Asking for the parent's own length grants the whole parent: the
    /// parent is marked `full_grant` and no allocator entry is made.  The
    /// caller must hold the advisory lock on `parent`.
    pub(crate) async fn ip_block_carve_child(
        &self,
        tx: &mut Transaction,
        undo: &mut AllocatorUndo<'_>,
        parent: &IpBlock,
        length: u8,
    ) -> Result<Prefix, Error> {
        let parent = tx.fetch::<IpBlock>(parent.id).await?;
        let namespace = block_namespace(&parent);
        let parent_prefix = block_prefix(&parent)?;

        if parent.full_grant {
            return Err(Error::insufficient_capacity(
                format!("IpBlock {} is fully granted", parent.id),
                format!("requested /{} from {}", length, parent_prefix),
            ));
        }
        if length < parent_prefix.len() {
            return Err(Error::invalid_request(format!(
                "prefix length /{} is larger than IpBlock {} ({})",
                length, parent.id, parent_prefix
            )));
        }

        if length == parent_prefix.len() {
            let usage = self.ipam.usage(&namespace, parent_prefix)?;
            if usage.acquired_prefixes > 0 {
                return Err(Error::insufficient_capacity(
                    format!(
                        "IpBlock {} cannot be granted whole while parts of it \
                         are in use",
                        parent.id
                    ),
                    format!(
                        "{} has {} child prefix(es)",
                        parent_prefix, usage.acquired_prefixes
                    ),
                ));
            }
            let mut granted = parent.clone();
            granted.full_grant = true;
            granted.time_modified = Utc::now();
            tx.update(granted).await?;
            info!(self.log, "granted whole IpBlock";
                "ip_block_id" => %parent.id,
                "prefix" => %parent_prefix,
            );
            return Ok(parent_prefix);
        }

        let child =
            self.ipam.reserve_child(&namespace, parent_prefix, length)?;
        undo.reserved_child(&namespace, child);
        Ok(child)
    }

    /// Returns `child`'s address space to `parent`.  The caller must hold
    /// the advisory lock on `parent`.
    pub(crate) async fn ip_block_release_child(
        &self,
        tx: &mut Transaction,
        undo: &mut AllocatorUndo<'_>,
        parent: &IpBlock,
        child: &IpBlock,
    ) -> Result<(), Error> {
        let parent = tx.fetch::<IpBlock>(parent.id).await?;
        if parent.full_grant {
            bail_unless!(
                parent.network == child.network,
                "IpBlock {} is fully granted, but child {} has {} instead \
                 of {}",
                parent.id,
                child.id,
                child.cidr(),
                parent.cidr()
            );
            let mut released = parent.clone();
            released.full_grant = false;
            released.time_modified = Utc::now();
            tx.update(released).await?;
            return Ok(());
        }

        let namespace = block_namespace(&parent);
        let parent_prefix = block_prefix(&parent)?;
        let child_prefix = block_prefix(child)?;
        match self.ipam.release(&namespace, child_prefix) {
            Ok(()) => {
                undo.released_child(&namespace, parent_prefix, child_prefix);
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                // The ledger can be ahead of the allocator after an earlier
                // partial failure.
                warn!(self.log, "allocator entry already absent";
                    "ip_block_id" => %child.id,
                    "prefix" => %child_prefix,
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Registers a new provider-owned block.
    pub async fn ip_block_create(
        &self,
        opctx: &OpContext,
        params: &params::IpBlockCreate,
    ) -> CreateResult<IpBlock> {
        let prefix = parse_cidr(&params.cidr)?;
        self.ipam.limits().check(prefix.version(), prefix.len())?;

        let block = IpBlock::new_parent(
            params.name.clone(),
            params.infrastructure_provider_id,
            params.site_id,
            params.routing_type,
            prefix.network()?,
        );
        let namespace = block_namespace(&block);

        let mut tx =
            self.datastore.transaction(opctx, "ip_block_create").await?;
        tx.advisory_lock(opctx, &namespace).await?;
        if let Some(existing) = tx
            .parent_ip_block_by_network(
                block.infrastructure_provider_id,
                block.site_id,
                block.routing_type,
                block.network,
            )
            .await?
        {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::IpBlock,
                object_name: format!("{} ({})", block.cidr(), existing.id),
            });
        }

        let mut undo = AllocatorUndo::new(&opctx.log, &self.ipam);
        self.ipam.reserve_root(&namespace, prefix)?;
        undo.reserved_root(&namespace, prefix);
        let block = tx.insert(block).await?;
        tx.commit().await?;
        undo.disarm();

        info!(opctx.log, "created IpBlock";
            "ip_block_id" => %block.id,
            "cidr" => block.cidr(),
        );
        Ok(block)
    }

    /// Removes a provider-owned block nothing refers to any more.
    pub async fn ip_block_delete(
        &self,
        opctx: &OpContext,
        ip_block_id: Uuid,
    ) -> DeleteResult {
        let mut tx =
            self.datastore.transaction(opctx, "ip_block_delete").await?;
        tx.advisory_lock(opctx, &ip_block_id.to_string()).await?;
        let block = tx.fetch::<IpBlock>(ip_block_id).await?;
        if block.is_derived() {
            return Err(Error::invalid_request(format!(
                "IpBlock {} belongs to a tenant and is deleted with its \
                 Allocation",
                block.id
            )));
        }
        let referencing = tx
            .constraints_referencing(AllocationResourceType::IpBlock, block.id)
            .await?;
        if !referencing.is_empty() {
            warn!(opctx.log, "refusing to delete referenced IpBlock";
                "ip_block_id" => %block.id,
                "constraints" => referencing.len(),
            );
            return Err(Error::invalid_request(format!(
                "IpBlock {} is used by {} allocation constraint(s)",
                block.id,
                referencing.len()
            )));
        }
        if !tx.child_ip_blocks(block.id).await?.is_empty() {
            return Err(Error::invalid_request(format!(
                "IpBlock {} still has derived blocks",
                block.id
            )));
        }

        let namespace = block_namespace(&block);
        let prefix = block_prefix(&block)?;
        let mut undo = AllocatorUndo::new(&opctx.log, &self.ipam);
        match self.ipam.release(&namespace, prefix) {
            Ok(()) => undo.released_root(&namespace, prefix),
            Err(err) if err.is_not_found() => {
                warn!(opctx.log, "allocator entry already absent";
                    "ip_block_id" => %block.id,
                    "prefix" => %prefix,
                );
            }
            Err(err) => return Err(err.into()),
        }
        tx.delete::<IpBlock>(block.id).await?;
        tx.commit().await?;
        undo.disarm();

        info!(opctx.log, "deleted IpBlock"; "ip_block_id" => %block.id);
        Ok(())
    }

    /// Reports how much of a block has been handed out.
    pub async fn ip_block_usage(
        &self,
        opctx: &OpContext,
        ip_block_id: Uuid,
    ) -> LookupResult<Usage> {
        let block =
            self.datastore.fetch::<IpBlock>(opctx, ip_block_id).await?;
        if block.full_grant {
            // The whole block went to one child with no allocator entry.
            return Ok(Usage {
                acquired_ips: 0,
                available_ips: 0,
                acquired_prefixes: 1,
                available_prefixes: Vec::new(),
                available_smallest_prefixes: 0,
            });
        }
        let prefix = block_prefix(&block)?;
        Ok(self.ipam.usage(&block_namespace(&block), prefix)?)
    }

    /// Carves a block out of one of the tenant's own blocks, then has the
    /// Site provision it.
    ///
    /// The new block is recorded as `Provisioning`.  It becomes `Ready` once
    /// the Site has applied it, or `Error` if the Site refuses it.  When the
    /// Site fails in any other way the block stays `Provisioning` and the
    /// error is returned.
    pub async fn derived_ip_block_create(
        &self,
        opctx: &OpContext,
        params: &params::DerivedIpBlockCreate,
    ) -> CreateResult<IpBlock> {
        let lock =
            tenant_block_lock(params.tenant_id, params.source_ip_block_id);
        let mut tx = self
            .datastore
            .transaction(opctx, "derived_ip_block_create")
            .await?;
        tx.advisory_lock(opctx, &lock).await?;

        let source = tx.fetch::<IpBlock>(params.source_ip_block_id).await?;
        if source.tenant_id != Some(params.tenant_id) {
            return Err(Error::invalid_request(format!(
                "IpBlock {} does not belong to tenant {}",
                source.id, params.tenant_id
            )));
        }
        if source.status == IpBlockStatus::Error {
            return Err(Error::invalid_request(format!(
                "IpBlock {} was refused by its Site",
                source.id
            )));
        }

        let mut undo = AllocatorUndo::new(&opctx.log, &self.ipam);
        let prefix = self
            .ip_block_carve_child(
                &mut tx,
                &mut undo,
                &source,
                params.prefix_length,
            )
            .await?;
        let block = tx
            .insert(source.new_derived(
                params.name.clone(),
                params.tenant_id,
                prefix.network()?,
                IpBlockStatus::Provisioning,
            ))
            .await?;
        tx.commit().await?;
        undo.disarm();
        info!(opctx.log, "created derived IpBlock";
            "ip_block_id" => %block.id,
            "source_ip_block_id" => %source.id,
            "cidr" => block.cidr(),
        );

        let command = SiteCommand::CreateIpBlock(CreateIpBlock {
            ip_block_id: block.id,
            tenant_id: params.tenant_id,
            cidr: block.cidr(),
        });
        match self.site_dispatch(opctx, block.site_id, command).await {
            Ok(outcome) => {
                debug!(opctx.log, "site provisioned derived IpBlock";
                    "ip_block_id" => %block.id,
                    "outcome" => ?outcome,
                );
            }
            Err(
                err @ DispatchError::Remote {
                    err: ClientError::Rejected { .. },
                    ..
                },
            ) => {
                self.derived_ip_block_set_status(
                    opctx,
                    &lock,
                    &block,
                    IpBlockStatus::Error,
                )
                .await?;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        }

        let ready = self
            .derived_ip_block_set_status(
                opctx,
                &lock,
                &block,
                IpBlockStatus::Ready,
            )
            .await?;
        Ok(ready.unwrap_or(block))
    }

    /// Records what the Site made of a derived block.
    ///
    /// Returns `None` if the block was deleted while the Site worked on it.
    /// That deletion stands.
    async fn derived_ip_block_set_status(
        &self,
        opctx: &OpContext,
        lock: &str,
        block: &IpBlock,
        status: IpBlockStatus,
    ) -> Result<Option<IpBlock>, Error> {
        let mut tx = self
            .datastore
            .transaction(opctx, "derived_ip_block_set_status")
            .await?;
        tx.advisory_lock(opctx, lock).await?;
        let Some(mut current) = tx.get::<IpBlock>(block.id).await? else {
            warn!(opctx.log, "IpBlock removed before its status was recorded";
                "ip_block_id" => %block.id,
                "status" => %status,
            );
            return Ok(None);
        };
        current.status = status;
        current.time_modified = Utc::now();
        let current = tx.update(current).await?;
        tx.commit().await.with_internal_context(|| {
            format!(
                "recording IpBlock {} as {} after the Site answered",
                block.id, status
            )
        })?;
        Ok(Some(current))
    }

    /// Deletes a block carved with [`Self::derived_ip_block_create`], then
    /// has the Site remove it.
    pub async fn derived_ip_block_delete(
        &self,
        opctx: &OpContext,
        ip_block_id: Uuid,
    ) -> DeleteResult {
        let block =
            self.datastore.fetch::<IpBlock>(opctx, ip_block_id).await?;
        let (Some(tenant_id), Some(parent_id)) =
            (block.tenant_id, block.parent_id)
        else {
            return Err(Error::invalid_request(format!(
                "IpBlock {} is not a tenant block",
                block.id
            )));
        };

        let mut tx = self
            .datastore
            .transaction(opctx, "derived_ip_block_delete")
            .await?;
        tx.advisory_lock(opctx, &tenant_block_lock(tenant_id, parent_id))
            .await?;
        let block = tx.fetch::<IpBlock>(ip_block_id).await?;
        if tx.constraint_count_for_derived_block(block.id).await? > 0 {
            return Err(Error::invalid_request(format!(
                "IpBlock {} is deleted with its Allocation",
                block.id
            )));
        }
        let subnets = tx.subnet_count_for_block(block.id).await?;
        if subnets > 0 {
            return Err(Error::invalid_request(format!(
                "IpBlock {} is used by {} subnet(s)",
                block.id, subnets
            )));
        }
        if !tx.child_ip_blocks(block.id).await?.is_empty() {
            return Err(Error::invalid_request(format!(
                "IpBlock {} still has derived blocks",
                block.id
            )));
        }

        let parent = tx.fetch::<IpBlock>(parent_id).await?;
        let mut undo = AllocatorUndo::new(&opctx.log, &self.ipam);
        self.ip_block_release_child(&mut tx, &mut undo, &parent, &block)
            .await?;
        tx.delete::<IpBlock>(block.id).await?;
        tx.commit().await?;
        undo.disarm();
        info!(opctx.log, "deleted derived IpBlock";
            "ip_block_id" => %block.id,
        );

        // Already absent on the Site is as good as removed.
        let command =
            SiteCommand::DeleteIpBlock(DeleteIpBlock { ip_block_id: block.id });
        self.site_dispatch(opctx, block.site_id, command).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::app::test_helpers::block_of;
    use crate::app::test_helpers::TestHarness;
    use assert_matches::assert_matches;
    use ironplane_db_model::AllocationConstraint;
    use ironplane_db_model::RoutingType;
    use ironplane_db_queries::db::Query;
    use site_agent_client::fake::FakeGate;
    use site_agent_client::fake::FakeResponse;
    use site_agent_client::ErrorCode;

    fn parent_params(
        harness: &TestHarness,
        cidr: &str,
    ) -> params::IpBlockCreate {
        params::IpBlockCreate {
            name: String::from("parent"),
            infrastructure_provider_id: harness.provider_id,
            site_id: harness.site_id,
            routing_type: RoutingType::DatacenterOnly,
            cidr: cidr.to_string(),
        }
    }

    fn derived_params(
        source: &IpBlock,
        prefix_length: u8,
    ) -> params::DerivedIpBlockCreate {
        params::DerivedIpBlockCreate {
            name: format!("vpc-{}", prefix_length),
            tenant_id: source.tenant_id.unwrap(),
            source_ip_block_id: source.id,
            prefix_length,
        }
    }

    /// Carves a tenant block of `prefix_length` bits out of a new parent.
    async fn tenant_block(
        harness: &TestHarness,
        cidr: &str,
        prefix_length: u32,
    ) -> (IpBlock, IpBlock) {
        let parent = harness.parent_block(cidr).await;
        let (_, constraint) =
            harness.allocation(block_of(&parent, prefix_length)).await;
        let block = harness
            .nexus
            .datastore()
            .fetch(&harness.opctx(), constraint.derived_resource_id.unwrap())
            .await
            .unwrap();
        (parent, block)
    }

    async fn children(harness: &TestHarness, parent: &IpBlock) -> Vec<IpBlock> {
        harness
            .nexus
            .datastore()
            .list(&harness.opctx(), Query::IpBlocksWithParent {
                parent_id: parent.id,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_parent_block_lifecycle() {
        let harness = TestHarness::new("test_parent_block_lifecycle").await;
        let nexus = &harness.nexus;
        let opctx = harness.opctx();

        let parent = nexus
            .ip_block_create(
                &opctx,
                &parent_params(&harness, "192.168.0.0/20"),
            )
            .await
            .unwrap();
        assert_eq!(parent.cidr(), "192.168.0.0/20");
        assert!(!parent.is_derived());

        assert_matches!(
            nexus
                .ip_block_create(
                    &opctx,
                    &parent_params(&harness, "192.168.0.0/20")
                )
                .await,
            Err(Error::ObjectAlreadyExists { .. })
        );
        assert_matches!(
            nexus
                .ip_block_create(
                    &opctx,
                    &parent_params(&harness, "192.168.8.0/24")
                )
                .await,
            Err(Error::Conflict { .. })
        );
        for bad in ["nonsense", "192.168.0.0", "192.168.64.1/20"] {
            assert_matches!(
                nexus
                    .ip_block_create(&opctx, &parent_params(&harness, bad))
                    .await,
                Err(Error::InvalidValue { .. }),
                "{}",
                bad
            );
        }
        // The same range under another routing type is separate space.
        let mut public = parent_params(&harness, "192.168.0.0/20");
        public.routing_type = RoutingType::Public;
        nexus.ip_block_create(&opctx, &public).await.unwrap();

        let usage = nexus.ip_block_usage(&opctx, parent.id).await.unwrap();
        assert_eq!(usage.acquired_prefixes, 0);
        assert_eq!(usage.available_ips, 4096);
        assert_eq!(usage.available_prefixes, vec!["192.168.0.0/20"]);

        let (allocation, constraint) =
            harness.allocation(block_of(&parent, 24)).await;
        assert_matches!(
            nexus.ip_block_delete(&opctx, parent.id).await,
            Err(Error::InvalidRequest { .. })
        );
        let tenant_block_id = constraint.derived_resource_id.unwrap();
        assert_matches!(
            nexus.ip_block_delete(&opctx, tenant_block_id).await,
            Err(Error::InvalidRequest { .. })
        );

        nexus.allocation_delete(&opctx, allocation.id).await.unwrap();
        nexus.ip_block_delete(&opctx, parent.id).await.unwrap();
        assert_matches!(
            nexus.ip_block_usage(&opctx, parent.id).await,
            Err(Error::ObjectNotFound { .. })
        );
        // The space is free again.
        nexus
            .ip_block_create(
                &opctx,
                &parent_params(&harness, "192.168.8.0/24"),
            )
            .await
            .unwrap();

        harness.cleanup_successful();
    }

    /// Releases tolerate allocator entries that are already gone, leaving
    /// the ledger and the allocator in agreement.
    #[tokio::test]
    async fn test_release_when_allocator_entry_absent() {
        let harness =
            TestHarness::new("test_release_when_allocator_entry_absent").await;
        let nexus = &harness.nexus;
        let opctx = harness.opctx();
        let parent = harness.parent_block("10.12.0.0/16").await;
        let (allocation, constraint) =
            harness.allocation(block_of(&parent, 20)).await;
        let block_id = constraint.derived_resource_id.unwrap();
        let namespace = block_namespace(&parent);

        // The allocator loses the tenant block's reservation.
        let block: IpBlock =
            nexus.datastore().fetch(&opctx, block_id).await.unwrap();
        let child_prefix = block_prefix(&block).unwrap();
        nexus.ipam().release(&namespace, child_prefix).unwrap();
        let usage = nexus.ip_block_usage(&opctx, parent.id).await.unwrap();
        assert_eq!(usage.acquired_prefixes, 0);

        // Recarving releases the missing /20 and carves a /22.
        let updated = nexus
            .allocation_constraint_update(&opctx, constraint.id, 22)
            .await
            .unwrap();
        assert_eq!(*updated.constraint_value, 22);
        let block: IpBlock =
            nexus.datastore().fetch(&opctx, block_id).await.unwrap();
        assert_eq!(block.prefix_length(), 22);
        let usage = nexus.ip_block_usage(&opctx, parent.id).await.unwrap();
        assert_eq!(usage.acquired_prefixes, 1);
        assert_eq!(usage.acquired_ips, 1024);
        assert_eq!(
            nexus
                .ipam()
                .usage(&namespace, block_prefix(&parent).unwrap())
                .unwrap()
                .acquired_ips,
            1024
        );

        // Now the parent's root reservation goes missing.
        nexus.allocation_delete(&opctx, allocation.id).await.unwrap();
        let usage = nexus.ip_block_usage(&opctx, parent.id).await.unwrap();
        assert_eq!(usage.acquired_prefixes, 0);
        nexus
            .ipam()
            .release(&namespace, block_prefix(&parent).unwrap())
            .unwrap();
        nexus.ip_block_delete(&opctx, parent.id).await.unwrap();
        assert_matches!(
            nexus.datastore().fetch::<IpBlock>(&opctx, parent.id).await,
            Err(Error::ObjectNotFound { .. })
        );
        assert!(nexus
            .ipam()
            .usage(&namespace, block_prefix(&parent).unwrap())
            .unwrap_err()
            .is_not_found());

        // Both agree the range is free.
        nexus
            .ip_block_create(&opctx, &parent_params(&harness, "10.12.0.0/16"))
            .await
            .unwrap();

        harness.cleanup_successful();
    }

    #[tokio::test]
    async fn test_derived_block_lifecycle() {
        let harness = TestHarness::new("test_derived_block_lifecycle").await;
        let nexus = &harness.nexus;
        let opctx = harness.opctx();
        let site = harness.sites.site(harness.site_id);
        let (_, tenant_block) = tenant_block(&harness, "10.8.0.0/16", 20).await;

        let vpc = nexus
            .derived_ip_block_create(
                &opctx,
                &derived_params(&tenant_block, 24),
            )
            .await
            .unwrap();
        assert_eq!(vpc.cidr(), "10.8.0.0/24");
        assert_eq!(vpc.status, IpBlockStatus::Ready);
        assert_eq!(vpc.parent_id, Some(tenant_block.id));
        assert_matches!(
            site.executed().last(),
            Some(SiteCommand::CreateIpBlock(cmd))
                if cmd.ip_block_id == vpc.id && cmd.cidr == "10.8.0.0/24"
        );
        let usage =
            nexus.ip_block_usage(&opctx, tenant_block.id).await.unwrap();
        assert_eq!(usage.acquired_prefixes, 1);
        assert_eq!(usage.acquired_ips, 256);

        // Another tenant may not carve from this one's block.
        let mut foreign = derived_params(&tenant_block, 24);
        foreign.tenant_id = Uuid::new_v4();
        assert_matches!(
            nexus.derived_ip_block_create(&opctx, &foreign).await,
            Err(Error::InvalidRequest { .. })
        );

        // Tenant blocks that back a constraint go with their Allocation.
        assert_matches!(
            nexus.derived_ip_block_delete(&opctx, tenant_block.id).await,
            Err(Error::InvalidRequest { .. })
        );

        harness.subnet(&vpc).await;
        assert_matches!(
            nexus.derived_ip_block_delete(&opctx, vpc.id).await,
            Err(Error::InvalidRequest { .. })
        );

        // A retried create the Site already has is still a success.
        site.respond_next(FakeResponse::Reject {
            code: ErrorCode::AlreadyExists,
            message: String::from("ip block exists"),
        });
        let other = nexus
            .derived_ip_block_create(
                &opctx,
                &derived_params(&tenant_block, 24),
            )
            .await
            .unwrap();
        assert_eq!(other.cidr(), "10.8.1.0/24");
        assert_eq!(other.status, IpBlockStatus::Ready);
        // The Site has already dropped it.
        site.respond_next(FakeResponse::NotFound);
        nexus.derived_ip_block_delete(&opctx, other.id).await.unwrap();
        assert_matches!(
            nexus.datastore().fetch::<IpBlock>(&opctx, other.id).await,
            Err(Error::ObjectNotFound { .. })
        );
        assert_matches!(
            site.executed().last(),
            Some(SiteCommand::DeleteIpBlock(cmd))
                if cmd.ip_block_id == other.id
        );
        let usage =
            nexus.ip_block_usage(&opctx, tenant_block.id).await.unwrap();
        assert_eq!(usage.acquired_prefixes, 1);

        harness.cleanup_successful();
    }

    /// A Site that refuses a block leaves it recorded as `Error`.  Nothing
    /// more can be carved from it, but it can still be deleted.
    #[tokio::test]
    async fn test_derived_block_refused_by_site() {
        let harness =
            TestHarness::new("test_derived_block_refused_by_site").await;
        let nexus = &harness.nexus;
        let opctx = harness.opctx();
        let site = harness.sites.site(harness.site_id);
        let (_, tenant_block) =
            tenant_block(&harness, "10.13.0.0/16", 20).await;

        site.respond_next(FakeResponse::Reject {
            code: ErrorCode::FailedPrecondition,
            message: String::from("no vlan left"),
        });
        assert_matches!(
            nexus
                .derived_ip_block_create(
                    &opctx,
                    &derived_params(&tenant_block, 24)
                )
                .await,
            Err(Error::InvalidRequest { .. })
        );
        let blocks = children(&harness, &tenant_block).await;
        assert_eq!(blocks.len(), 1);
        let refused = &blocks[0];
        assert_eq!(refused.status, IpBlockStatus::Error);

        assert_matches!(
            nexus
                .derived_ip_block_create(&opctx, &derived_params(refused, 28))
                .await,
            Err(Error::InvalidRequest { .. })
        );

        nexus.derived_ip_block_delete(&opctx, refused.id).await.unwrap();
        assert!(children(&harness, &tenant_block).await.is_empty());
        let usage =
            nexus.ip_block_usage(&opctx, tenant_block.id).await.unwrap();
        assert_eq!(usage.acquired_prefixes, 0);

        harness.cleanup_successful();
    }

    /// A Site that times out leaves the block recorded but not `Ready`, and
    /// the remote execution is terminated exactly once.
    #[tokio::test]
    async fn test_derived_block_remote_timeout() {
        let harness =
            TestHarness::new("test_derived_block_remote_timeout").await;
        let nexus = &harness.nexus;
        let opctx = harness.opctx();
        let site = harness.sites.site(harness.site_id);
        let (_, tenant_block) = tenant_block(&harness, "10.9.0.0/16", 20).await;

        site.respond_next(FakeResponse::TimeOut);
        let err = nexus
            .derived_ip_block_create(
                &opctx,
                &derived_params(&tenant_block, 26),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::ServiceUnavailable { .. });

        let blocks = children(&harness, &tenant_block).await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].status, IpBlockStatus::Provisioning);
        let terminated = site.terminated();
        assert_eq!(terminated.len(), 1);
        assert_eq!(
            terminated[0].0,
            format!("ip-block-create-{}", blocks[0].id)
        );

        harness.cleanup_successful();
    }

    /// A block deleted while the Site is still provisioning it stays
    /// deleted, and the create still reports success.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_derived_block_deleted_during_dispatch() {
        let harness =
            TestHarness::new("test_derived_block_deleted_during_dispatch")
                .await;
        let nexus = &harness.nexus;
        let opctx = harness.opctx();
        let site = harness.sites.site(harness.site_id);
        let (_, tenant_block) =
            tenant_block(&harness, "10.11.0.0/16", 20).await;

        let gate = FakeGate::new();
        site.respond_next(FakeResponse::Gated(gate.clone()));
        let create = tokio::spawn({
            let nexus = nexus.clone();
            let opctx = harness.opctx();
            let params = derived_params(&tenant_block, 24);
            async move { nexus.derived_ip_block_create(&opctx, &params).await }
        });
        gate.entered().await;

        let blocks = children(&harness, &tenant_block).await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].status, IpBlockStatus::Provisioning);
        nexus.derived_ip_block_delete(&opctx, blocks[0].id).await.unwrap();

        gate.open();
        let created = create.await.unwrap().unwrap();
        assert_eq!(created.id, blocks[0].id);
        assert!(children(&harness, &tenant_block).await.is_empty());
        let usage =
            nexus.ip_block_usage(&opctx, tenant_block.id).await.unwrap();
        assert_eq!(usage.acquired_prefixes, 0);

        harness.cleanup_successful();
    }

    #[tokio::test]
    async fn test_derived_block_commit_failure() {
        let harness =
            TestHarness::new("test_derived_block_commit_failure").await;
        let nexus = &harness.nexus;
        let opctx = harness.opctx();
        let site = harness.sites.site(harness.site_id);
        let (_, tenant_block) =
            tenant_block(&harness, "10.10.0.0/16", 20).await;
        let dispatched = site.executed().len();

        harness.ledger.inject_commit_failure();
        assert_matches!(
            nexus
                .derived_ip_block_create(
                    &opctx,
                    &derived_params(&tenant_block, 24)
                )
                .await,
            Err(Error::ServiceUnavailable { .. })
        );
        let usage =
            nexus.ip_block_usage(&opctx, tenant_block.id).await.unwrap();
        assert_eq!(usage.acquired_prefixes, 0);
        assert!(children(&harness, &tenant_block).await.is_empty());
        assert_eq!(site.executed().len(), dispatched);
        let constraints: Vec<AllocationConstraint> = nexus
            .datastore()
            .list(&opctx, Query::ConstraintsForDerivedBlock {
                ip_block_id: tenant_block.id,
            })
            .await
            .unwrap();
        assert_eq!(constraints.len(), 1);

        // A failed parent registration leaves no allocator root behind.
        harness.ledger.inject_commit_failure();
        let params = parent_params(&harness, "172.16.0.0/16");
        assert_matches!(
            nexus.ip_block_create(&opctx, &params).await,
            Err(Error::ServiceUnavailable { .. })
        );
        nexus.ip_block_create(&opctx, &params).await.unwrap();

        harness.cleanup_successful();
    }
}
