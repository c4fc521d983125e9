// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures shared by the Nexus tests

use super::params;
use super::Nexus;
use crate::config::Config;
use crate::config::Tunables;
use dropshot::test_util::LogContext;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use ironplane_db_model::Allocation;
use ironplane_db_model::AllocationConstraint;
use ironplane_db_model::AllocationResourceType;
use ironplane_db_model::ConstraintType;
use ironplane_db_model::Instance;
use ironplane_db_model::InstanceType;
use ironplane_db_model::IpBlock;
use ironplane_db_model::Machine;
use ironplane_db_model::MachineInstanceType;
use ironplane_db_model::MachineStatus;
use ironplane_db_model::RoutingType;
use ironplane_db_model::Subnet;
use ironplane_db_queries::context::OpContext;
use ironplane_db_queries::db;
use ironplane_db_queries::db::ledger::MemoryLedger;
use ironplane_db_queries::db::pub_test_utils::datastore_test_on;
use ironplane_ipam::PrefixLimits;
use ironplane_test_utils::dev::test_setup_log;
use site_agent_client::fake::FakeSiteClientPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A Nexus backed by an in-memory ledger and fake Site agents, with one
/// provider and one Site
pub(crate) struct TestHarness {
    pub logctx: LogContext,
    pub ledger: MemoryLedger,
    pub nexus: Arc<Nexus>,
    pub sites: Arc<FakeSiteClientPool>,
    pub provider_id: Uuid,
    pub site_id: Uuid,
}

impl TestHarness {
    pub async fn new(test_name: &str) -> TestHarness {
        TestHarness::new_with_tunables(test_name, Tunables::default()).await
    }

    pub async fn new_with_tunables(
        test_name: &str,
        tunables: Tunables,
    ) -> TestHarness {
        let logctx = test_setup_log(test_name);
        let config = Config {
            log: ConfigLogging::StderrTerminal {
                level: ConfigLoggingLevel::Info,
            },
            database: db::Config {
                url: String::from("postgresql://localhost/ironplane"),
                connection_timeout: Duration::from_secs(1),
            },
            tunables,
            ipam: PrefixLimits::default(),
        };
        let ledger = MemoryLedger::new();
        let (_, datastore) = datastore_test_on(
            &logctx,
            &ledger,
            config.tunables.lock_timeout,
        );
        let sites = Arc::new(FakeSiteClientPool::new(&logctx.log));
        let nexus = Nexus::new(&logctx.log, &config, datastore, sites.clone())
            .await
            .unwrap();
        let site_id = Uuid::new_v4();
        sites.site(site_id);
        TestHarness {
            logctx,
            ledger,
            nexus: Arc::new(nexus),
            sites,
            provider_id: Uuid::new_v4(),
            site_id,
        }
    }

    pub fn opctx(&self) -> OpContext {
        OpContext::for_tests(self.logctx.log.new(o!()))
    }

    pub fn opctx_with_timeout(&self, timeout: Duration) -> OpContext {
        OpContext::for_request(&self.logctx.log, Some(timeout))
    }

    pub fn cleanup_successful(self) {
        self.logctx.cleanup_successful();
    }

    pub async fn instance_type(&self, name: &str) -> InstanceType {
        let instance_type =
            InstanceType::new(name, self.provider_id, self.site_id);
        self.nexus
            .datastore()
            .insert(&self.opctx(), instance_type)
            .await
            .unwrap()
    }

    /// Adds a Machine with no InstanceType.
    pub async fn machine(&self, status: MachineStatus) -> Machine {
        let machine = Machine::new(self.provider_id, self.site_id, status);
        self.nexus.datastore().insert(&self.opctx(), machine).await.unwrap()
    }

    /// Adds `count` Machines already associated with `instance_type`.
    pub async fn machines_of_type(
        &self,
        instance_type: &InstanceType,
        count: usize,
        status: MachineStatus,
    ) -> Vec<(Machine, MachineInstanceType)> {
        let opctx = self.opctx();
        let datastore = self.nexus.datastore();
        let mut out = Vec::new();
        for _ in 0..count {
            let mut machine =
                Machine::new(self.provider_id, self.site_id, status);
            machine.instance_type_id = Some(instance_type.id);
            let association =
                MachineInstanceType::new(machine.id, instance_type.id);
            let machine = datastore.insert(&opctx, machine).await.unwrap();
            let association =
                datastore.insert(&opctx, association).await.unwrap();
            out.push((machine, association));
        }
        out
    }

    pub async fn parent_block(&self, cidr: &str) -> IpBlock {
        self.nexus
            .ip_block_create(
                &self.opctx(),
                &params::IpBlockCreate {
                    name: format!("parent-{}", cidr),
                    infrastructure_provider_id: self.provider_id,
                    site_id: self.site_id,
                    routing_type: RoutingType::DatacenterOnly,
                    cidr: cidr.to_string(),
                },
            )
            .await
            .unwrap()
    }

    pub fn allocation_params(
        &self,
        tenant_id: Uuid,
        constraints: Vec<params::AllocationConstraintCreate>,
    ) -> params::AllocationCreate {
        params::AllocationCreate {
            name: format!("allocation-{}", tenant_id),
            description: None,
            infrastructure_provider_id: self.provider_id,
            tenant_id,
            site_id: self.site_id,
            constraints,
        }
    }

    /// Creates an allocation for a new tenant with one constraint.
    pub async fn allocation(
        &self,
        constraint: params::AllocationConstraintCreate,
    ) -> (Allocation, AllocationConstraint) {
        let (allocation, mut constraints) = self
            .nexus
            .allocation_create(
                &self.opctx(),
                &self.allocation_params(Uuid::new_v4(), vec![constraint]),
            )
            .await
            .unwrap();
        (allocation, constraints.remove(0))
    }

    pub async fn instance(
        &self,
        constraint: &AllocationConstraint,
        allocation: &Allocation,
        machine: &Machine,
    ) -> Instance {
        let instance = Instance::new(
            allocation.tenant_id,
            allocation.site_id,
            allocation.id,
            constraint.id,
            constraint.resource_type_id,
            machine.id,
        );
        self.nexus.datastore().insert(&self.opctx(), instance).await.unwrap()
    }

    pub async fn subnet(&self, block: &IpBlock) -> Subnet {
        let subnet = Subnet::new(block.tenant_id.unwrap(), block.id);
        self.nexus.datastore().insert(&self.opctx(), subnet).await.unwrap()
    }
}

pub(crate) fn reserved(
    instance_type: &InstanceType,
    count: u32,
) -> params::AllocationConstraintCreate {
    params::AllocationConstraintCreate {
        resource_type: AllocationResourceType::InstanceType,
        resource_type_id: instance_type.id,
        constraint_type: ConstraintType::Reserved,
        constraint_value: count,
    }
}

pub(crate) fn block_of(
    parent: &IpBlock,
    prefix_length: u32,
) -> params::AllocationConstraintCreate {
    params::AllocationConstraintCreate {
        resource_type: AllocationResourceType::IpBlock,
        resource_type_id: parent.id,
        constraint_type: ConstraintType::OnDemand,
        constraint_value: prefix_length,
    }
}
