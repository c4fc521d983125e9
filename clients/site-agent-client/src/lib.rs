// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface for talking to the per-Site agents that carry out physical
//! changes
//!
//! Every remote operation is a [`SiteCommand`] variant with its own payload
//! type.  A command names resources by id only, so the same command can be
//! dispatched again after a failure and address the same remote execution
//! (see [`SiteCommand::execution_id`]).

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use slog_error_chain::SlogInlineError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

/// Ensures a Tenant exists on the Site.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CreateTenant {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
}

/// Associates Machines with an InstanceType on the Site.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AssociateMachinesWithInstanceType {
    pub instance_type_id: Uuid,
    /// `(association id, machine id)` for each new association, ordered by
    /// association id
    pub associations: Vec<(Uuid, Uuid)>,
}

/// Removes one Machine's InstanceType association on the Site.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoveMachineInstanceTypeAssociation {
    pub association_id: Uuid,
    pub machine_id: Uuid,
    pub instance_type_id: Uuid,
}

/// Provisions a tenant IP block on the Site.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CreateIpBlock {
    pub ip_block_id: Uuid,
    pub tenant_id: Uuid,
    /// `"<prefix>/<length>"`
    pub cidr: String,
}

/// Removes a tenant IP block from the Site.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DeleteIpBlock {
    pub ip_block_id: Uuid,
}

#[derive(
    Clone, Debug, Deserialize, Eq, PartialEq, Serialize, strum::IntoStaticStr,
)]
pub enum SiteCommand {
    CreateTenant(CreateTenant),
    AssociateMachinesWithInstanceType(AssociateMachinesWithInstanceType),
    RemoveMachineInstanceTypeAssociation(RemoveMachineInstanceTypeAssociation),
    CreateIpBlock(CreateIpBlock),
    DeleteIpBlock(DeleteIpBlock),
}

impl SiteCommand {
    /// The remote workflow this command runs
    pub fn workflow_name(&self) -> &'static str {
        self.into()
    }

    fn kind(&self) -> &'static str {
        match self {
            SiteCommand::CreateTenant(_) => "site-tenant-create",
            SiteCommand::AssociateMachinesWithInstanceType(_) => {
                "machine-instance-type-create"
            }
            SiteCommand::RemoveMachineInstanceTypeAssociation(_) => {
                "machine-instance-type-delete"
            }
            SiteCommand::CreateIpBlock(_) => "ip-block-create",
            SiteCommand::DeleteIpBlock(_) => "ip-block-delete",
        }
    }

    /// The resource this command acts on
    pub fn resource_id(&self) -> Uuid {
        match self {
            SiteCommand::CreateTenant(c) => c.tenant_id,
            // A batch is named by its first association.  Ids are fresh for
            // every batch, so two batches never share an execution.
            SiteCommand::AssociateMachinesWithInstanceType(c) => c
                .associations
                .first()
                .map(|(association_id, _)| *association_id)
                .unwrap_or(c.instance_type_id),
            SiteCommand::RemoveMachineInstanceTypeAssociation(c) => {
                c.association_id
            }
            SiteCommand::CreateIpBlock(c) => c.ip_block_id,
            SiteCommand::DeleteIpBlock(c) => c.ip_block_id,
        }
    }

    /// Returns `"<command-kind>-<resourceID>"`, the id of the remote
    /// execution this command starts.  Dispatching the same command again
    /// yields the same id.
    pub fn execution_id(&self) -> String {
        format!("{}-{}", self.kind(), self.resource_id())
    }

    /// Returns true for commands that remove something from the Site.  For
    /// these, a remote "object not found" means the Site already agrees.
    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            SiteCommand::RemoveMachineInstanceTypeAssociation(_)
                | SiteCommand::DeleteIpBlock(_)
        )
    }
}

/// Errors reported by a Site agent or by the transport to it
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error, SlogInlineError)]
pub enum ClientError {
    #[error("execution {execution_id} timed out")]
    Timeout { execution_id: String },

    #[error("object not found on site: {message}")]
    ObjectNotFound { message: String },

    #[error("site rejected command ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("site {site_id} unavailable: {message}")]
    Unavailable { site_id: Uuid, message: String },
}

/// Application error codes a Site agent reports
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display,
)]
pub enum ErrorCode {
    InvalidArgument,
    AlreadyExists,
    FailedPrecondition,
    Internal,
}

/// A client for one Site's agent
#[async_trait]
pub trait SiteClient: Send + Sync {
    /// Runs `command` on the Site and waits for it to finish.  The Site
    /// gives up after `timeout`, reporting [`ClientError::Timeout`].
    async fn execute(
        &self,
        command: &SiteCommand,
        timeout: Duration,
    ) -> Result<(), ClientError>;

    /// Stops a running execution.
    async fn terminate(
        &self,
        execution_id: &str,
        reason: &str,
    ) -> Result<(), ClientError>;
}

impl std::fmt::Debug for dyn SiteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SiteClient")
    }
}

/// Finds the agent client for a Site
pub trait SiteClientPool: Send + Sync {
    fn client_for_site(
        &self,
        site_id: Uuid,
    ) -> Result<Arc<dyn SiteClient>, ClientError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_execution_id_is_deterministic() {
        let ip_block_id = Uuid::new_v4();
        let create = SiteCommand::CreateIpBlock(CreateIpBlock {
            ip_block_id,
            tenant_id: Uuid::new_v4(),
            cidr: String::from("10.0.0.0/24"),
        });
        assert_eq!(
            create.execution_id(),
            format!("ip-block-create-{ip_block_id}")
        );
        assert_eq!(create.execution_id(), create.clone().execution_id());
        assert_eq!(create.workflow_name(), "CreateIpBlock");
        assert!(!create.is_delete());

        let delete = SiteCommand::DeleteIpBlock(DeleteIpBlock { ip_block_id });
        assert_ne!(create.execution_id(), delete.execution_id());
        assert!(delete.is_delete());

        let tenant_id = Uuid::new_v4();
        let tenant = SiteCommand::CreateTenant(CreateTenant {
            tenant_id,
            site_id: Uuid::new_v4(),
        });
        assert_eq!(
            tenant.execution_id(),
            format!("site-tenant-create-{tenant_id}")
        );
    }
}
