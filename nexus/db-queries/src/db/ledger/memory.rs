// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-process ledger, for tests
//!
//! Rows live in ordered maps behind a mutex and advisory locks are tokio
//! mutexes.  Clones of a [`MemoryLedger`] share everything, so several
//! `DataStore`s (and several Nexus instances) can contend on one ledger the
//! way they would on one database.

use super::already_exists;
use super::not_found;
use super::Ledger;
use super::LedgerTransaction;
use super::Query;
use super::Row;
use super::Table;
use crate::db::advisory_lock::AdvisoryLockKey;
use async_trait::async_trait;
use ironplane_common::api::external::Error;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

type Tables = BTreeMap<Table, BTreeMap<Uuid, Row>>;

/// The set of advisory locks for one ledger
#[derive(Default)]
struct AdvisoryLocks {
    locks: Mutex<HashMap<AdvisoryLockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl AdvisoryLocks {
    /// Waits up to `wait` for the lock named by `key`.
    async fn acquire(
        &self,
        key: AdvisoryLockKey,
        wait: Duration,
    ) -> Option<OwnedMutexGuard<()>> {
        let mutex = {
            let mut locks =
                self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // An entry nobody holds or waits on is only referenced by the
            // map itself.
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(key).or_default().clone()
        };
        tokio::time::timeout(wait, mutex.lock_owned()).await.ok()
    }

    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct Inner {
    tables: Mutex<Tables>,
    locks: AdvisoryLocks,
    fail_next_commit: AtomicBool,
    commit_hold: Mutex<Option<CommitHold>>,
}

/// The ledger's half of a [`HeldCommit`]
struct CommitHold {
    reached: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// Keeps one commit waiting, with its transaction's locks held, until the
/// test releases it
pub struct HeldCommit {
    reached: oneshot::Receiver<()>,
    release: oneshot::Sender<()>,
}

impl HeldCommit {
    /// Waits until some transaction has started committing.
    pub async fn reached(&mut self) {
        // A closed channel means the ledger is gone; nothing will commit.
        let _ = (&mut self.reached).await;
    }

    /// Lets the held commit finish.
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

#[derive(Clone)]
pub struct MemoryLedger {
    inner: Arc<Inner>,
}

impl MemoryLedger {
    pub fn new() -> MemoryLedger {
        MemoryLedger {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::new()),
                locks: AdvisoryLocks::default(),
                fail_next_commit: AtomicBool::new(false),
                commit_hold: Mutex::new(None),
            }),
        }
    }

    /// Makes the next commit on this ledger fail without applying anything.
    pub fn inject_commit_failure(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Makes the next commit on this ledger wait for
    /// [`HeldCommit::release`] before it applies anything.
    pub fn hold_next_commit(&self) -> HeldCommit {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self
            .inner
            .commit_hold
            .lock()
            .unwrap_or_else(PoisonError::into_inner) =
            Some(CommitHold { reached: reached_tx, release: release_rx });
        HeldCommit { reached: reached_rx, release: release_tx }
    }

    /// Number of advisory lock entries that are held or waited on, plus at
    /// most one released entry not yet pruned
    pub fn advisory_lock_entries(&self) -> usize {
        self.inner.locks.len()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        MemoryLedger::new()
    }
}

impl Inner {
    fn committed(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(
        &self,
        _log: &Logger,
    ) -> Result<Box<dyn LedgerTransaction>, Error> {
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            staged: BTreeMap::new(),
            held_locks: Vec::new(),
        }))
    }
}

/// Writes are staged here and applied to the shared tables on commit.
/// `None` marks a deleted row.
struct MemoryTransaction {
    inner: Arc<Inner>,
    staged: BTreeMap<(Table, Uuid), Option<Row>>,
    held_locks: Vec<OwnedMutexGuard<()>>,
}

impl MemoryTransaction {
    fn lookup(&self, table: Table, id: Uuid) -> Option<Row> {
        if let Some(staged) = self.staged.get(&(table, id)) {
            return staged.clone();
        }
        self.inner.committed().get(&table).and_then(|t| t.get(&id)).cloned()
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn advisory_lock(
        &mut self,
        key: AdvisoryLockKey,
        wait: Duration,
    ) -> Result<bool, Error> {
        match self.inner.locks.acquire(key, wait).await {
            Some(guard) => {
                self.held_locks.push(guard);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(
        &mut self,
        table: Table,
        id: Uuid,
    ) -> Result<Option<Row>, Error> {
        Ok(self.lookup(table, id))
    }

    async fn select(&mut self, query: &Query) -> Result<Vec<Row>, Error> {
        let table = query.table();
        let mut rows: BTreeMap<Uuid, Row> = self
            .inner
            .committed()
            .get(&table)
            .into_iter()
            .flat_map(|t| t.iter())
            .filter(|(id, row)| {
                !self.staged.contains_key(&(table, **id)) && query.matches(row)
            })
            .map(|(id, row)| (*id, row.clone()))
            .collect();
        rows.extend(
            self.staged
                .iter()
                .filter(|((t, _), _)| *t == table)
                .filter_map(|((_, id), row)| row.as_ref().map(|r| (*id, r)))
                .filter(|(_, row)| query.matches(row))
                .map(|(id, row)| (id, row.clone())),
        );
        Ok(rows.into_values().collect())
    }

    async fn insert(&mut self, row: Row) -> Result<(), Error> {
        let (table, id) = (row.table(), row.id());
        if self.lookup(table, id).is_some() {
            return Err(already_exists(table, id));
        }
        self.staged.insert((table, id), Some(row));
        Ok(())
    }

    async fn update(&mut self, row: Row) -> Result<(), Error> {
        let (table, id) = (row.table(), row.id());
        if self.lookup(table, id).is_none() {
            return Err(not_found(table, id));
        }
        self.staged.insert((table, id), Some(row));
        Ok(())
    }

    async fn delete(&mut self, table: Table, id: Uuid) -> Result<(), Error> {
        if self.lookup(table, id).is_none() {
            return Err(not_found(table, id));
        }
        self.staged.insert((table, id), None);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), Error> {
        let hold = self
            .inner
            .commit_hold
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hold) = hold {
            let _ = hold.reached.send(());
            let _ = hold.release.await;
        }
        if self.inner.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(Error::unavail("ledger commit failed (injected)"));
        }
        {
            let mut tables = self.inner.committed();
            for ((table, id), row) in std::mem::take(&mut self.staged) {
                let table = tables.entry(table).or_default();
                match row {
                    Some(row) => {
                        table.insert(id, row);
                    }
                    None => {
                        table.remove(&id);
                    }
                }
            }
        }
        // Locks are released only once the writes are visible, so the next
        // holder reads them.
        self.held_locks.clear();
        Ok(())
    }
}
