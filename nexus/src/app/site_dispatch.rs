// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Telling Sites about ledger changes
//!
//! Dispatch happens strictly after the ledger commit.  The ledger records
//! intent; the Site is brought into agreement afterwards, and a failed
//! dispatch never undoes the commit.  Whatever the Site is left doing after
//! a timeout is reconciled out of band.

use ironplane_common::api::external::Error;
use ironplane_db_queries::context::OpContext;
use site_agent_client::ClientError;
use site_agent_client::ErrorCode;
use site_agent_client::SiteCommand;
use slog_error_chain::InlineErrorChain;
use slog_error_chain::SlogInlineError;
use uuid::Uuid;

/// How a Site took a command
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// The Site applied the command.
    Applied,
    /// A removal found nothing to remove.  The Site already agrees with the
    /// ledger.
    AlreadyAbsent,
    /// A creation found the object already there, as after a retried
    /// dispatch.
    AlreadyPresent,
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum DispatchError {
    #[error("no agent available for site {site_id}")]
    SiteUnavailable {
        site_id: Uuid,
        #[source]
        err: ClientError,
    },

    #[error("{workflow} ({execution_id}) on site {site_id} timed out")]
    Timeout { workflow: &'static str, execution_id: String, site_id: Uuid },

    #[error("{workflow} on site {site_id} failed")]
    Remote {
        workflow: &'static str,
        site_id: Uuid,
        #[source]
        err: ClientError,
    },
}

impl From<DispatchError> for Error {
    fn from(error: DispatchError) -> Self {
        let message = InlineErrorChain::new(&error).to_string();
        match error {
            DispatchError::SiteUnavailable { .. }
            | DispatchError::Timeout { .. } => Error::unavail(&message),
            DispatchError::Remote {
                err:
                    ClientError::Rejected {
                        code:
                            ErrorCode::InvalidArgument
                            | ErrorCode::FailedPrecondition,
                        ..
                    },
                ..
            } => Error::invalid_request(message),
            DispatchError::Remote {
                err: ClientError::Unavailable { .. }, ..
            } => Error::unavail(&message),
            DispatchError::Remote { .. } => Error::internal_error(&message),
        }
    }
}

impl super::Nexus {
    /// Runs `command` on a Site and waits for the result.
    ///
    /// The wait is bounded by the configured workflow timeout and by the
    /// request's deadline.  On timeout the remote execution is terminated,
    /// once, and the timeout is reported.
    pub(crate) async fn site_dispatch(
        &self,
        opctx: &OpContext,
        site_id: Uuid,
        command: SiteCommand,
    ) -> Result<DispatchOutcome, DispatchError> {
        let workflow = command.workflow_name();
        let execution_id = command.execution_id();
        let log = opctx.log.new(o!(
            "site_id" => site_id.to_string(),
            "workflow" => workflow,
            "execution_id" => execution_id.clone(),
        ));

        let client = self
            .site_clients
            .client_for_site(site_id)
            .map_err(|err| DispatchError::SiteUnavailable { site_id, err })?;

        let timeout = match opctx.remaining() {
            Some(remaining) => {
                remaining.min(self.tunables.site_workflow_timeout)
            }
            None => self.tunables.site_workflow_timeout,
        };
        debug!(log, "dispatching"; "timeout" => ?timeout);
        let execute = client.execute(&command, timeout);
        let result = match tokio::time::timeout(timeout, execute).await {
            Ok(result) => result,
            Err(_) => {
                Err(ClientError::Timeout { execution_id: execution_id.clone() })
            }
        };

        match result {
            Ok(()) => {
                info!(log, "site applied command";
                    "request_elapsed" => ?opctx.elapsed(),
                );
                Ok(DispatchOutcome::Applied)
            }
            Err(ClientError::ObjectNotFound { message })
                if command.is_delete() =>
            {
                info!(log, "object already absent on site";
                    "message" => message,
                );
                Ok(DispatchOutcome::AlreadyAbsent)
            }
            Err(ClientError::Rejected {
                code: ErrorCode::AlreadyExists,
                message,
            }) if !command.is_delete() => {
                info!(log, "object already present on site";
                    "message" => message,
                );
                Ok(DispatchOutcome::AlreadyPresent)
            }
            Err(ClientError::Timeout { .. }) => {
                warn!(log, "timed out waiting for site"; "timeout" => ?timeout);
                let reason =
                    format!("timeout occurred executing {} workflow", workflow);
                match tokio::time::timeout(
                    self.tunables.site_terminate_timeout,
                    client.terminate(&execution_id, &reason),
                )
                .await
                {
                    Ok(Ok(())) => {
                        info!(log, "terminated remote execution");
                    }
                    Ok(Err(err)) => {
                        error!(log, "failed to terminate remote execution";
                            InlineErrorChain::new(&err),
                        );
                    }
                    Err(_) => {
                        error!(log, "timed out terminating remote execution";
                            "timeout" => ?self.tunables.site_terminate_timeout,
                        );
                    }
                }
                Err(DispatchError::Timeout { workflow, execution_id, site_id })
            }
            Err(err) => {
                error!(log, "site failed to apply command";
                    InlineErrorChain::new(&err),
                );
                Err(DispatchError::Remote { workflow, site_id, err })
            }
        }
    }
}
