// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-process stand-in for the Site agents, for tests
//!
//! Each [`FakeSiteClient`] records the commands it is asked to run and the
//! executions it is asked to terminate.  Responses are scripted per client
//! with [`FakeSiteClient::respond_next`]; once the script runs out, every
//! command succeeds.

use crate::ClientError;
use crate::ErrorCode;
use crate::SiteClient;
use crate::SiteClientPool;
use crate::SiteCommand;
use async_trait::async_trait;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// How the fake answers one command
#[derive(Clone, Debug)]
pub enum FakeResponse {
    Succeed,
    /// Report that the Site gave up on the execution.
    TimeOut,
    /// Never answer.  The caller's own deadline has to fire.
    Hang,
    NotFound,
    Reject { code: ErrorCode, message: String },
    /// Wait at the gate until the test opens it, then succeed.
    Gated(FakeGate),
}

/// Holds a command mid-execution until the test lets it through
#[derive(Clone, Debug, Default)]
pub struct FakeGate {
    entered: Arc<Notify>,
    open: Arc<Notify>,
}

impl FakeGate {
    pub fn new() -> FakeGate {
        FakeGate::default()
    }

    /// Waits until a command has reached the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets the command waiting at the gate finish.
    pub fn open(&self) {
        self.open.notify_one();
    }
}

pub struct FakeSiteClient {
    log: Logger,
    script: Mutex<VecDeque<FakeResponse>>,
    executed: Mutex<Vec<SiteCommand>>,
    terminated: Mutex<Vec<(String, String)>>,
    terminate_error: Mutex<Option<ClientError>>,
}

impl FakeSiteClient {
    fn new(log: Logger) -> FakeSiteClient {
        FakeSiteClient {
            log,
            script: Mutex::new(VecDeque::new()),
            executed: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            terminate_error: Mutex::new(None),
        }
    }

    /// Queues the response to the next unanswered command.
    pub fn respond_next(&self, response: FakeResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    /// Makes every subsequent terminate call fail with `error`.
    pub fn fail_terminate(&self, error: ClientError) {
        *self.terminate_error.lock().unwrap() = Some(error);
    }

    /// Commands received so far, in order
    pub fn executed(&self) -> Vec<SiteCommand> {
        self.executed.lock().unwrap().clone()
    }

    /// `(execution id, reason)` for each terminate call so far
    pub fn terminated(&self) -> Vec<(String, String)> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl SiteClient for FakeSiteClient {
    async fn execute(
        &self,
        command: &SiteCommand,
        _timeout: Duration,
    ) -> Result<(), ClientError> {
        self.executed.lock().unwrap().push(command.clone());
        let response = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FakeResponse::Succeed);
        debug!(self.log, "executing";
            "execution_id" => command.execution_id(),
            "response" => ?response,
        );
        match response {
            FakeResponse::Succeed => Ok(()),
            FakeResponse::TimeOut => Err(ClientError::Timeout {
                execution_id: command.execution_id(),
            }),
            FakeResponse::Hang => std::future::pending().await,
            FakeResponse::NotFound => Err(ClientError::ObjectNotFound {
                message: format!("{} not found", command.resource_id()),
            }),
            FakeResponse::Reject { code, message } => {
                Err(ClientError::Rejected { code, message })
            }
            FakeResponse::Gated(gate) => {
                gate.entered.notify_one();
                gate.open.notified().await;
                Ok(())
            }
        }
    }

    async fn terminate(
        &self,
        execution_id: &str,
        reason: &str,
    ) -> Result<(), ClientError> {
        self.terminated
            .lock()
            .unwrap()
            .push((execution_id.to_string(), reason.to_string()));
        match self.terminate_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A set of fake Site agents
pub struct FakeSiteClientPool {
    log: Logger,
    sites: Mutex<BTreeMap<Uuid, Arc<FakeSiteClient>>>,
}

impl FakeSiteClientPool {
    pub fn new(log: &Logger) -> FakeSiteClientPool {
        FakeSiteClientPool {
            log: log.new(o!("component" => "FakeSiteClientPool")),
            sites: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the agent for `site_id`, bringing it online if needed.
    pub fn site(&self, site_id: Uuid) -> Arc<FakeSiteClient> {
        let mut sites = self.sites.lock().unwrap();
        sites
            .entry(site_id)
            .or_insert_with(|| {
                Arc::new(FakeSiteClient::new(
                    self.log.new(o!("site_id" => site_id.to_string())),
                ))
            })
            .clone()
    }

    /// Takes a Site's agent offline.
    pub fn remove_site(&self, site_id: Uuid) {
        self.sites.lock().unwrap().remove(&site_id);
    }
}

impl SiteClientPool for FakeSiteClientPool {
    fn client_for_site(
        &self,
        site_id: Uuid,
    ) -> Result<Arc<dyn SiteClient>, ClientError> {
        let sites = self.sites.lock().unwrap();
        match sites.get(&site_id) {
            Some(client) => Ok(client.clone() as Arc<dyn SiteClient>),
            None => Err(ClientError::Unavailable {
                site_id,
                message: String::from("no agent connected"),
            }),
        }
    }
}
