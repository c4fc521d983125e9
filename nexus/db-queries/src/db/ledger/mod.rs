// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage backends for the ledger
//!
//! A [`Ledger`] hands out [`LedgerTransaction`]s.  The [`DataStore`] sits in
//! front of whichever backend it was built with and adds typed access,
//! advisory lock bookkeeping and logging; backends only move [`Row`]s.
//!
//! [`PostgresLedger`] is the production backend.  Advisory locks are
//! PostgreSQL transaction-level advisory locks, so they serialize every
//! Nexus sharing the database and are released by the database itself when
//! the transaction ends.
//!
//! [`DataStore`]: super::DataStore

use super::advisory_lock::AdvisoryLockKey;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use ironplane_common::api::external::Error;
use ironplane_common::api::external::ResourceType;
use ironplane_db_model::Allocation;
use ironplane_db_model::AllocationConstraint;
use ironplane_db_model::AllocationResourceType;
use ironplane_db_model::Instance;
use ironplane_db_model::InstanceType;
use ironplane_db_model::IpBlock;
use ironplane_db_model::Machine;
use ironplane_db_model::MachineInstanceType;
use ironplane_db_model::Resource;
use ironplane_db_model::RoutingType;
use ironplane_db_model::Subnet;
use slog::Logger;
use std::time::Duration;
use uuid::Uuid;

#[cfg(any(test, feature = "testing"))]
mod memory;
mod postgres;

#[cfg(any(test, feature = "testing"))]
pub use memory::HeldCommit;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

macro_rules! ledger_tables {
    ($($variant:ident: $model:ty),* $(,)?) => {
        /// A table in the ledger
        #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub enum Table {
            $($variant,)*
        }

        impl Table {
            pub fn resource_type(&self) -> ResourceType {
                match self {
                    $(Table::$variant => <$model as Resource>::RESOURCE_TYPE,)*
                }
            }
        }

        /// One row of any table
        #[derive(Clone, Debug, PartialEq)]
        pub enum Row {
            $($variant($model),)*
        }

        impl Row {
            pub fn table(&self) -> Table {
                match self {
                    $(Row::$variant(_) => Table::$variant,)*
                }
            }

            pub fn id(&self) -> Uuid {
                match self {
                    $(Row::$variant(row) => row.id(),)*
                }
            }
        }

        $(
            impl Stored for $model {
                const TABLE: Table = Table::$variant;

                fn into_row(self) -> Row {
                    Row::$variant(self)
                }

                fn from_row(row: Row) -> Option<Self> {
                    match row {
                        Row::$variant(row) => Some(row),
                        _ => None,
                    }
                }
            }
        )*
    };
}

/// A row type with a table in the ledger
pub trait Stored: Resource {
    const TABLE: Table;

    fn into_row(self) -> Row;
    fn from_row(row: Row) -> Option<Self>;
}

ledger_tables! {
    Allocation: Allocation,
    AllocationConstraint: AllocationConstraint,
    Instance: Instance,
    InstanceType: InstanceType,
    IpBlock: IpBlock,
    Machine: Machine,
    MachineInstanceType: MachineInstanceType,
    Subnet: Subnet,
}

/// The row selections the consistency checks need
///
/// Every backend answers each of these with the matching rows ordered by
/// id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Query {
    All(Table),
    AllocationsForTenant {
        tenant_id: Uuid,
    },
    /// `infrastructure_provider_id` of `None` matches any provider.
    AllocationsForTenantAtSite {
        infrastructure_provider_id: Option<Uuid>,
        tenant_id: Uuid,
        site_id: Uuid,
    },
    ConstraintsForAllocation {
        allocation_id: Uuid,
    },
    ConstraintsReferencing {
        resource_type: AllocationResourceType,
        resource_type_id: Uuid,
    },
    ConstraintsForDerivedBlock {
        ip_block_id: Uuid,
    },
    InstancesForConstraint {
        allocation_constraint_id: Uuid,
    },
    InstancesOnMachine {
        machine_id: Uuid,
    },
    AssociationsForMachine {
        machine_id: Uuid,
    },
    AssociationsForInstanceType {
        instance_type_id: Uuid,
    },
    /// Machines of an InstanceType in a state that counts as supply
    SupplyMachines {
        instance_type_id: Uuid,
    },
    IpBlocksWithParent {
        parent_id: Uuid,
    },
    /// Provider-owned blocks with exactly this network
    ParentIpBlocksByNetwork {
        infrastructure_provider_id: Uuid,
        site_id: Uuid,
        routing_type: RoutingType,
        network: IpNetwork,
    },
    SubnetsForBlock {
        ip_block_id: Uuid,
    },
}

impl Query {
    pub fn table(&self) -> Table {
        match self {
            Query::All(table) => *table,
            Query::AllocationsForTenant { .. }
            | Query::AllocationsForTenantAtSite { .. } => Table::Allocation,
            Query::ConstraintsForAllocation { .. }
            | Query::ConstraintsReferencing { .. }
            | Query::ConstraintsForDerivedBlock { .. } => {
                Table::AllocationConstraint
            }
            Query::InstancesForConstraint { .. }
            | Query::InstancesOnMachine { .. } => Table::Instance,
            Query::AssociationsForMachine { .. }
            | Query::AssociationsForInstanceType { .. } => {
                Table::MachineInstanceType
            }
            Query::SupplyMachines { .. } => Table::Machine,
            Query::IpBlocksWithParent { .. }
            | Query::ParentIpBlocksByNetwork { .. } => Table::IpBlock,
            Query::SubnetsForBlock { .. } => Table::Subnet,
        }
    }

    /// Returns true if `row` is selected by this query.
    pub fn matches(&self, row: &Row) -> bool {
        match (self, row) {
            (Query::All(table), row) => row.table() == *table,
            (Query::AllocationsForTenant { tenant_id }, Row::Allocation(a)) => {
                a.tenant_id == *tenant_id
            }
            (
                Query::AllocationsForTenantAtSite {
                    infrastructure_provider_id,
                    tenant_id,
                    site_id,
                },
                Row::Allocation(a),
            ) => {
                infrastructure_provider_id
                    .map_or(true, |p| a.infrastructure_provider_id == p)
                    && a.tenant_id == *tenant_id
                    && a.site_id == *site_id
            }
            (
                Query::ConstraintsForAllocation { allocation_id },
                Row::AllocationConstraint(c),
            ) => c.allocation_id == *allocation_id,
            (
                Query::ConstraintsReferencing {
                    resource_type,
                    resource_type_id,
                },
                Row::AllocationConstraint(c),
            ) => {
                c.resource_type == *resource_type
                    && c.resource_type_id == *resource_type_id
            }
            (
                Query::ConstraintsForDerivedBlock { ip_block_id },
                Row::AllocationConstraint(c),
            ) => c.derived_resource_id == Some(*ip_block_id),
            (
                Query::InstancesForConstraint { allocation_constraint_id },
                Row::Instance(i),
            ) => i.allocation_constraint_id == *allocation_constraint_id,
            (Query::InstancesOnMachine { machine_id }, Row::Instance(i)) => {
                i.machine_id == *machine_id
            }
            (
                Query::AssociationsForMachine { machine_id },
                Row::MachineInstanceType(m),
            ) => m.machine_id == *machine_id,
            (
                Query::AssociationsForInstanceType { instance_type_id },
                Row::MachineInstanceType(m),
            ) => m.instance_type_id == *instance_type_id,
            (Query::SupplyMachines { instance_type_id }, Row::Machine(m)) => {
                m.instance_type_id == Some(*instance_type_id)
                    && m.status.counts_as_supply()
            }
            (Query::IpBlocksWithParent { parent_id }, Row::IpBlock(b)) => {
                b.parent_id == Some(*parent_id)
            }
            (
                Query::ParentIpBlocksByNetwork {
                    infrastructure_provider_id,
                    site_id,
                    routing_type,
                    network,
                },
                Row::IpBlock(b),
            ) => {
                !b.is_derived()
                    && b.infrastructure_provider_id
                        == *infrastructure_provider_id
                    && b.site_id == *site_id
                    && b.routing_type == *routing_type
                    && b.network == *network
            }
            (Query::SubnetsForBlock { ip_block_id }, Row::Subnet(s)) => {
                s.ip_block_id == *ip_block_id
            }
            _ => false,
        }
    }
}

/// One open transaction against a [`Ledger`]
///
/// Writes are visible to this transaction immediately and to others once
/// [`LedgerTransaction::commit`] succeeds.  Dropping the transaction
/// without committing rolls it back and releases its advisory locks.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Waits up to `wait` for the advisory lock `key`, holding it until the
    /// transaction ends.  Returns `Ok(false)` if the wait ran out.
    async fn advisory_lock(
        &mut self,
        key: AdvisoryLockKey,
        wait: Duration,
    ) -> Result<bool, Error>;

    async fn get(&mut self, table: Table, id: Uuid)
        -> Result<Option<Row>, Error>;

    /// Rows matching `query`, ordered by id
    async fn select(&mut self, query: &Query) -> Result<Vec<Row>, Error>;

    /// Fails with `ObjectAlreadyExists` if the id is taken.
    async fn insert(&mut self, row: Row) -> Result<(), Error>;

    /// Fails with `ObjectNotFound` if there is no row to replace.
    async fn update(&mut self, row: Row) -> Result<(), Error>;

    /// Fails with `ObjectNotFound` if there is no row to remove.
    async fn delete(&mut self, table: Table, id: Uuid) -> Result<(), Error>;

    /// On failure nothing is applied.  Locks stay held until the
    /// transaction is dropped.
    async fn commit(&mut self) -> Result<(), Error>;
}

/// A store of ledger rows that can serialize writers with advisory locks
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn begin(
        &self,
        log: &Logger,
    ) -> Result<Box<dyn LedgerTransaction>, Error>;
}

pub(crate) fn not_found(table: Table, id: Uuid) -> Error {
    Error::not_found_by_id(table.resource_type(), &id)
}

pub(crate) fn already_exists(table: Table, id: Uuid) -> Error {
    Error::ObjectAlreadyExists {
        type_name: table.resource_type(),
        object_name: id.to_string(),
    }
}
