// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nexus, the service that operates much of the control plane

use crate::config::Config;
use crate::config::Tunables;
use ironplane_common::api::external::Error;
use ironplane_db_model::IpBlock;
use ironplane_db_queries::context::OpContext;
use ironplane_db_queries::db;
use ironplane_db_queries::db::ledger::PostgresLedger;
use ironplane_db_queries::db::ledger::Table;
use ironplane_db_queries::db::DataStore;
use ironplane_db_queries::db::Query;
use ironplane_ipam::Ipam;
use site_agent_client::SiteClientPool;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

// The implementation of Nexus is large, and split into a number of submodules
// by resource.
mod allocation;
mod compensation;
mod constraint_validation;
mod ip_block;
mod machine_instance_type;
pub mod params;
mod site_dispatch;
#[cfg(test)]
mod test_helpers;

pub use site_dispatch::DispatchError;
pub use site_dispatch::DispatchOutcome;

/// Manages an Ironplane control plane deployment
pub struct Nexus {
    log: Logger,
    datastore: Arc<DataStore>,
    ipam: Arc<Ipam>,
    site_clients: Arc<dyn SiteClientPool>,
    tunables: Tunables,
}

impl Nexus {
    /// Create a new Nexus instance over the database named in `config`.
    pub async fn start(
        log: &Logger,
        config: &Config,
        site_clients: Arc<dyn SiteClientPool>,
    ) -> Result<Nexus, Error> {
        let pool = Arc::new(db::Pool::new(log, &config.database));
        let ledger = Arc::new(PostgresLedger::new(log, pool));
        let datastore = Arc::new(DataStore::new(
            log,
            ledger,
            config.tunables.lock_timeout,
        ));
        Nexus::new(log, config, datastore, site_clients).await
    }

    /// Create a new Nexus instance over an existing datastore.
    ///
    /// The prefix allocator is rebuilt from the IpBlocks already in the
    /// ledger before this returns.
    pub async fn new(
        log: &Logger,
        config: &Config,
        datastore: Arc<DataStore>,
        site_clients: Arc<dyn SiteClientPool>,
    ) -> Result<Nexus, Error> {
        let log = log.new(o!("component" => "nexus"));
        let ipam = Arc::new(Ipam::new(&log, config.ipam));
        let opctx = OpContext::for_request(&log, None);
        let loaded = ipam_load(&opctx, &datastore, &ipam).await?;
        info!(log, "created nexus";
            "lock_timeout" => ?config.tunables.lock_timeout,
            "site_workflow_timeout" => ?config.tunables.site_workflow_timeout,
            "ip_blocks_loaded" => loaded,
        );
        Ok(Nexus {
            log,
            datastore,
            ipam,
            site_clients,
            tunables: config.tunables.clone(),
        })
    }

    /// Returns the ledger this Nexus mutates.
    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    pub fn ipam(&self) -> &Arc<Ipam> {
        &self.ipam
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }
}

/// Reserves every recorded IpBlock in `ipam`, parents before the blocks
/// carved from them.  Returns how many blocks were loaded.
async fn ipam_load(
    opctx: &OpContext,
    datastore: &DataStore,
    ipam: &Ipam,
) -> Result<usize, Error> {
    let blocks: Vec<IpBlock> =
        datastore.list(opctx, Query::All(Table::IpBlock)).await?;
    let by_id: BTreeMap<Uuid, &IpBlock> =
        blocks.iter().map(|b| (b.id, b)).collect();

    // A block's depth is the number of blocks above it.
    let mut ordered: Vec<(usize, &IpBlock)> = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let mut depth = 0;
        let mut next = block.parent_id;
        while let Some(parent_id) = next {
            let parent = by_id.get(&parent_id).ok_or_else(|| {
                Error::internal_error(&format!(
                    "IpBlock {} names missing parent {}",
                    block.id, parent_id
                ))
            })?;
            depth += 1;
            if depth > blocks.len() {
                return Err(Error::internal_error(&format!(
                    "IpBlock {} is its own ancestor",
                    block.id
                )));
            }
            next = parent.parent_id;
        }
        ordered.push((depth, block));
    }
    ordered.sort_by_key(|(depth, block)| (*depth, block.id));

    for (_, block) in &ordered {
        let namespace = ip_block::block_namespace(block);
        let prefix = ip_block::block_prefix(block)?;
        match block.parent_id.and_then(|id| by_id.get(&id)) {
            None => {
                ipam.reserve_root(&namespace, prefix)?;
            }
            // A full grant has no allocator entry of its own.
            Some(parent) if parent.full_grant => {}
            Some(parent) => {
                let parent_prefix = ip_block::block_prefix(parent)?;
                ipam.reserve_specific_child(&namespace, parent_prefix, prefix)?;
            }
        }
        debug!(opctx.log, "loaded IpBlock into allocator";
            "ip_block_id" => %block.id,
            "cidr" => block.cidr(),
        );
    }
    Ok(ordered.len())
}
