// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary control plane interface for ledger read and write operations
//!
//! The ledger holds committed rows for every entity the consistency engine
//! reasons about.  All writes go through a [`Transaction`]: they become
//! visible to everyone else only when [`Transaction::commit`] succeeds.
//! Dropping a transaction without committing rolls it back.
//!
//! Reads inside a transaction see the transaction's own writes over the
//! latest committed state (read-committed).  Conflicting writers are
//! expected to serialize with advisory locks, taken *before* they read the
//! rows they are about to validate.

// This whole module is organized by entity, in the same way that the
// `DataStore` functions are grouped into `impl` blocks in each file.

use super::advisory_lock::AdvisoryLockKey;
use super::advisory_lock::LockError;
use super::ledger::Ledger;
use super::ledger::LedgerTransaction;
use super::ledger::Query;
use super::ledger::Row;
use super::ledger::Stored;
use crate::context::OpContext;
use ironplane_common::api::external::CreateResult;
use ironplane_common::api::external::DeleteResult;
use ironplane_common::api::external::Error;
use ironplane_common::api::external::ListResultVec;
use ironplane_common::api::external::LookupResult;
use ironplane_common::api::external::UpdateResult;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

mod allocation;
mod allocation_constraint;
mod instance;
mod instance_type;
mod ip_block;
mod machine;
mod subnet;

/// Default bound on how long a transaction waits for an advisory lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

pub struct DataStore {
    log: Logger,
    ledger: Arc<dyn Ledger>,
    lock_timeout: Duration,
}

impl DataStore {
    /// Constructs a datastore over `ledger` whose transactions wait at most
    /// `lock_timeout` for any one advisory lock.
    pub fn new(
        log: &Logger,
        ledger: Arc<dyn Ledger>,
        lock_timeout: Duration,
    ) -> DataStore {
        DataStore {
            log: log.new(o!("component" => "DataStore")),
            ledger,
            lock_timeout,
        }
    }

    /// Begins a transaction.  `name` identifies it in log messages.
    pub async fn transaction(
        &self,
        opctx: &OpContext,
        name: &'static str,
    ) -> Result<Transaction, Error> {
        let log = opctx.log.new(o!("transaction" => name));
        let inner = self.ledger.begin(&log).await.map_err(|err| {
            warn!(self.log, "failed to begin transaction";
                "transaction" => name,
                InlineErrorChain::new(&err),
            );
            err
        })?;
        Ok(Transaction {
            log,
            inner,
            lock_timeout: self.lock_timeout,
            held_locks: BTreeSet::new(),
            writes: 0,
            finished: false,
        })
    }

    /// Fetches a committed row.
    pub async fn fetch<T: Stored>(
        &self,
        opctx: &OpContext,
        id: Uuid,
    ) -> LookupResult<T> {
        let mut tx = self.transaction(opctx, "fetch").await?;
        tx.fetch(id).await
    }

    /// Lists the committed rows selected by `query`, ordered by id.
    pub async fn list<T: Stored>(
        &self,
        opctx: &OpContext,
        query: Query,
    ) -> ListResultVec<T> {
        let mut tx = self.transaction(opctx, "list").await?;
        tx.list(query).await
    }

    /// Inserts a single row in its own transaction.
    pub async fn insert<T: Stored>(
        &self,
        opctx: &OpContext,
        row: T,
    ) -> CreateResult<T> {
        let mut tx = self.transaction(opctx, "insert").await?;
        let row = tx.insert(row).await?;
        tx.commit().await?;
        Ok(row)
    }
}

fn decode<T: Stored>(row: Row) -> Result<T, Error> {
    let table = row.table();
    T::from_row(row).ok_or_else(|| {
        Error::internal_error(&format!(
            "ledger returned a {:?} row where a {} was expected",
            table,
            T::RESOURCE_TYPE,
        ))
    })
}

/// An open ledger transaction
///
/// Holds the advisory locks taken so far.  They are released, and any
/// writes discarded, if the transaction is dropped before
/// [`Transaction::commit`].
pub struct Transaction {
    log: Logger,
    inner: Box<dyn LedgerTransaction>,
    lock_timeout: Duration,
    held_locks: BTreeSet<AdvisoryLockKey>,
    writes: usize,
    finished: bool,
}

impl Transaction {
    /// Takes the advisory lock for `identity`, waiting if another
    /// transaction holds it.
    ///
    /// The wait is bounded by the datastore's lock timeout and by the time
    /// left before `opctx`'s deadline, whichever is shorter.  The lock is
    /// held until this transaction commits or rolls back.  Locking an
    /// identity this transaction already holds is a no-op.
    pub async fn advisory_lock(
        &mut self,
        opctx: &OpContext,
        identity: &str,
    ) -> Result<(), Error> {
        let key = AdvisoryLockKey::for_identity(identity);
        if self.held_locks.contains(&key) {
            debug!(self.log, "advisory lock already held";
                "identity" => identity,
                "key" => %key,
            );
            return Ok(());
        }

        let (wait, bounded_by_request) = match opctx.remaining() {
            Some(remaining) if remaining < self.lock_timeout => {
                (remaining, true)
            }
            _ => (self.lock_timeout, false),
        };
        debug!(self.log, "waiting for advisory lock";
            "identity" => identity,
            "key" => %key,
            "wait" => ?wait,
        );
        if !self.inner.advisory_lock(key, wait).await? {
            let err = if bounded_by_request {
                LockError::DeadlineExceeded { identity: identity.to_string() }
            } else {
                LockError::Timeout {
                    identity: identity.to_string(),
                    timeout: self.lock_timeout,
                }
            };
            warn!(self.log, "failed to acquire advisory lock";
                "identity" => identity,
                InlineErrorChain::new(&err),
            );
            return Err(Error::from(err));
        }
        debug!(self.log, "acquired advisory lock";
            "identity" => identity,
            "key" => %key,
        );
        self.held_locks.insert(key);
        Ok(())
    }

    /// Returns a row as this transaction sees it.
    pub async fn get<T: Stored>(
        &mut self,
        id: Uuid,
    ) -> Result<Option<T>, Error> {
        match self.inner.get(T::TABLE, id).await? {
            Some(row) => decode(row).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`Transaction::get`], but a missing row is an `ObjectNotFound`
    /// error.
    pub async fn fetch<T: Stored>(&mut self, id: Uuid) -> LookupResult<T> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::not_found_by_id(T::RESOURCE_TYPE, &id))
    }

    /// Lists the rows selected by `query` as this transaction sees them,
    /// ordered by id.
    pub async fn list<T: Stored>(&mut self, query: Query) -> ListResultVec<T> {
        if query.table() != T::TABLE {
            return Err(Error::internal_error(&format!(
                "query {:?} does not select {} rows",
                query,
                T::RESOURCE_TYPE,
            )));
        }
        self.inner.select(&query).await?.into_iter().map(decode).collect()
    }

    pub async fn count<T: Stored>(
        &mut self,
        query: Query,
    ) -> Result<usize, Error> {
        Ok(self.list::<T>(query).await?.len())
    }

    pub async fn insert<T: Stored>(&mut self, row: T) -> CreateResult<T> {
        self.inner.insert(row.clone().into_row()).await?;
        self.writes += 1;
        Ok(row)
    }

    /// Replaces an existing row.
    pub async fn update<T: Stored>(&mut self, row: T) -> UpdateResult<T> {
        self.inner.update(row.clone().into_row()).await?;
        self.writes += 1;
        Ok(row)
    }

    pub async fn delete<T: Stored>(&mut self, id: Uuid) -> DeleteResult {
        self.inner.delete(T::TABLE, id).await?;
        self.writes += 1;
        Ok(())
    }

    /// Makes this transaction's writes visible, then releases its locks.
    ///
    /// On failure nothing is applied.  Locks may stay held until the
    /// transaction is dropped, so that callers can undo side effects first.
    pub async fn commit(&mut self) -> Result<(), Error> {
        if let Err(err) = self.inner.commit().await {
            warn!(self.log, "commit failed";
                "writes" => self.writes,
                InlineErrorChain::new(&err),
            );
            return Err(err);
        }
        self.finished = true;
        debug!(self.log, "committed";
            "writes" => self.writes,
            "locks_released" => self.held_locks.len(),
        );
        self.held_locks.clear();
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(self.log, "rolled back";
                "discarded_writes" => self.writes,
                "locks_released" => self.held_locks.len(),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::ledger::MemoryLedger;
    use crate::db::ledger::Table;
    use crate::db::pub_test_utils::datastore_test;
    use crate::db::pub_test_utils::datastore_test_on;
    use assert_matches::assert_matches;
    use ironplane_common::api::external::ResourceType;
    use ironplane_db_model::Machine;
    use ironplane_db_model::MachineStatus;
    use ironplane_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn test_commit_and_rollback() {
        let logctx = test_setup_log("test_commit_and_rollback");
        let (opctx, datastore) = datastore_test(&logctx);
        let provider = Uuid::new_v4();
        let site = Uuid::new_v4();

        let machine = Machine::new(provider, site, MachineStatus::Ready);
        let id = machine.id;
        {
            let mut tx =
                datastore.transaction(&opctx, "rollback").await.unwrap();
            tx.insert(machine.clone()).await.unwrap();
            // Visible to the writer...
            assert!(tx.get::<Machine>(id).await.unwrap().is_some());
            // ...but not to anyone else.
            assert_matches!(
                datastore.fetch::<Machine>(&opctx, id).await,
                Err(Error::ObjectNotFound {
                    type_name: ResourceType::Machine,
                    ..
                })
            );
        }
        assert!(datastore.fetch::<Machine>(&opctx, id).await.is_err());

        let mut tx = datastore.transaction(&opctx, "commit").await.unwrap();
        tx.insert(machine.clone()).await.unwrap();
        assert_matches!(
            tx.insert(machine.clone()).await,
            Err(Error::ObjectAlreadyExists { .. })
        );
        tx.commit().await.unwrap();
        assert_eq!(
            datastore.fetch::<Machine>(&opctx, id).await.unwrap(),
            machine
        );

        let all_machines = Query::All(Table::Machine);
        let mut tx = datastore.transaction(&opctx, "delete").await.unwrap();
        tx.delete::<Machine>(id).await.unwrap();
        assert!(tx.get::<Machine>(id).await.unwrap().is_none());
        assert!(tx
            .list::<Machine>(all_machines.clone())
            .await
            .unwrap()
            .is_empty());
        assert_matches!(
            tx.delete::<Machine>(id).await,
            Err(Error::ObjectNotFound { .. })
        );
        tx.commit().await.unwrap();
        assert!(datastore
            .list::<Machine>(&opctx, all_machines)
            .await
            .unwrap()
            .is_empty());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_query_must_match_row_type() {
        let logctx = test_setup_log("test_query_must_match_row_type");
        let (opctx, datastore) = datastore_test(&logctx);
        let mut tx = datastore.transaction(&opctx, "test").await.unwrap();
        assert_matches!(
            tx.list::<Machine>(Query::All(Table::Subnet)).await,
            Err(Error::InternalError { .. })
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_injected_commit_failure() {
        let logctx = test_setup_log("test_injected_commit_failure");
        let ledger = MemoryLedger::new();
        let (opctx, datastore) =
            datastore_test_on(&logctx, &ledger, DEFAULT_LOCK_TIMEOUT);
        let machine =
            Machine::new(Uuid::new_v4(), Uuid::new_v4(), MachineStatus::Ready);

        ledger.inject_commit_failure();
        let mut tx = datastore.transaction(&opctx, "doomed").await.unwrap();
        tx.advisory_lock(&opctx, "machines").await.unwrap();
        tx.insert(machine.clone()).await.unwrap();
        assert_matches!(
            tx.commit().await,
            Err(Error::ServiceUnavailable { .. })
        );
        assert!(datastore.fetch::<Machine>(&opctx, machine.id).await.is_err());
        // A failed commit keeps the locks until the transaction goes away.
        assert_eq!(ledger.advisory_lock_entries(), 1);
        drop(tx);

        // Only one commit fails.
        let mut tx = datastore.transaction(&opctx, "retry").await.unwrap();
        tx.advisory_lock(&opctx, "machines").await.unwrap();
        tx.insert(machine.clone()).await.unwrap();
        tx.commit().await.unwrap();
        assert!(datastore.fetch::<Machine>(&opctx, machine.id).await.is_ok());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_advisory_lock_reentrant() {
        let logctx = test_setup_log("test_advisory_lock_reentrant");
        let (opctx, datastore) = datastore_test(&logctx);
        let mut tx =
            datastore.transaction(&opctx, "reentrant").await.unwrap();
        tx.advisory_lock(&opctx, "instance-type").await.unwrap();
        tx.advisory_lock(&opctx, "instance-type").await.unwrap();
        tx.commit().await.unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_advisory_lock_timeout() {
        let logctx = test_setup_log("test_advisory_lock_timeout");
        let ledger = MemoryLedger::new();
        let (opctx, datastore) =
            datastore_test_on(&logctx, &ledger, Duration::from_secs(2));

        let mut holder =
            datastore.transaction(&opctx, "holder").await.unwrap();
        holder.advisory_lock(&opctx, "instance-type").await.unwrap();

        let mut waiter =
            datastore.transaction(&opctx, "waiter").await.unwrap();
        let before = tokio::time::Instant::now();
        assert_matches!(
            waiter.advisory_lock(&opctx, "instance-type").await,
            Err(Error::InternalError { .. })
        );
        assert!(before.elapsed() >= Duration::from_secs(2));
        drop(waiter);

        // Unrelated identities are unaffected.
        let mut other = datastore.transaction(&opctx, "other").await.unwrap();
        other.advisory_lock(&opctx, "other").await.unwrap();
        drop(other);

        holder.commit().await.unwrap();
        let mut again = datastore.transaction(&opctx, "again").await.unwrap();
        again.advisory_lock(&opctx, "instance-type").await.unwrap();
        logctx.cleanup_successful();
    }

    /// A request deadline shorter than the lock timeout bounds the wait and
    /// is reported as retryable.
    #[tokio::test(start_paused = true)]
    async fn test_advisory_lock_request_deadline() {
        let logctx = test_setup_log("test_advisory_lock_request_deadline");
        let (opctx, datastore) = datastore_test(&logctx);
        let mut holder =
            datastore.transaction(&opctx, "holder").await.unwrap();
        holder.advisory_lock(&opctx, "instance-type").await.unwrap();

        let hurried =
            OpContext::for_request(&logctx.log, Some(Duration::from_secs(1)));
        let mut waiter =
            datastore.transaction(&hurried, "waiter").await.unwrap();
        let before = tokio::time::Instant::now();
        let err = waiter
            .advisory_lock(&hurried, "instance-type")
            .await
            .unwrap_err();
        assert_matches!(err, Error::ServiceUnavailable { .. });
        assert!(err.retryable());
        assert!(before.elapsed() < DEFAULT_LOCK_TIMEOUT);
        logctx.cleanup_successful();
    }

    /// A second writer on the same identity waits for the first to commit
    /// and then reads what it wrote, even when the two run on separate
    /// datastores sharing one ledger.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_advisory_lock_serializes() {
        let logctx = test_setup_log("test_advisory_lock_serializes");
        let ledger = MemoryLedger::new();
        let (opctx, datastore) =
            datastore_test_on(&logctx, &ledger, DEFAULT_LOCK_TIMEOUT);
        let (_, other_datastore) =
            datastore_test_on(&logctx, &ledger, DEFAULT_LOCK_TIMEOUT);
        let machine =
            Machine::new(Uuid::new_v4(), Uuid::new_v4(), MachineStatus::Ready);
        let id = machine.id;
        datastore.insert(&opctx, machine).await.unwrap();

        let mut first = datastore.transaction(&opctx, "first").await.unwrap();
        first.advisory_lock(&opctx, "m").await.unwrap();

        let (locked_tx, mut locked_rx) = tokio::sync::oneshot::channel();
        let second = {
            let log = logctx.log.clone();
            tokio::spawn(async move {
                let opctx = OpContext::for_tests(log);
                let mut tx = other_datastore
                    .transaction(&opctx, "second")
                    .await
                    .unwrap();
                tx.advisory_lock(&opctx, "m").await.unwrap();
                let _ = locked_tx.send(());
                let mut machine = tx.fetch::<Machine>(id).await.unwrap();
                let seen = machine.status;
                machine.status = MachineStatus::InUse;
                tx.update(machine).await.unwrap();
                tx.commit().await.unwrap();
                seen
            })
        };

        // The second writer cannot get past the lock while the first holds
        // it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(locked_rx.try_recv().is_err());

        let mut machine = first.fetch::<Machine>(id).await.unwrap();
        machine.status = MachineStatus::Maintenance;
        first.update(machine).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(second.await.unwrap(), MachineStatus::Maintenance);
        assert_eq!(
            datastore.fetch::<Machine>(&opctx, id).await.unwrap().status,
            MachineStatus::InUse
        );
        logctx.cleanup_successful();
    }

    /// Runs the ledger against a real database.  The database named by
    /// `IRONPLANE_TEST_DATABASE_URL` must be empty; this applies
    /// `schema/dbinit.sql` to it.
    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires an empty PostgreSQL database named by \
                IRONPLANE_TEST_DATABASE_URL"]
    async fn test_postgres_ledger() {
        use crate::db::ledger::PostgresLedger;
        use crate::db::Config as DbConfig;
        use crate::db::Pool;
        use async_bb8_diesel::AsyncSimpleConnection;

        let logctx = test_setup_log("test_postgres_ledger");
        let url = std::env::var("IRONPLANE_TEST_DATABASE_URL").unwrap();
        let pool = Arc::new(Pool::new(
            &logctx.log,
            &DbConfig { url, connection_timeout: Duration::from_secs(10) },
        ));
        pool.claim()
            .await
            .unwrap()
            .batch_execute_async(include_str!(
                "../../../../../schema/dbinit.sql"
            ))
            .await
            .unwrap();

        let ledger: Arc<dyn Ledger> =
            Arc::new(PostgresLedger::new(&logctx.log, pool.clone()));
        let datastore =
            DataStore::new(&logctx.log, ledger.clone(), Duration::from_secs(1));
        let other_datastore =
            DataStore::new(&logctx.log, ledger, Duration::from_secs(1));
        let opctx = OpContext::for_tests(logctx.log.clone());

        // Rows round-trip and queries select them.
        let mut machine =
            Machine::new(Uuid::new_v4(), Uuid::new_v4(), MachineStatus::Ready);
        let instance_type_id = Uuid::new_v4();
        machine.instance_type_id = Some(instance_type_id);
        datastore.insert(&opctx, machine.clone()).await.unwrap();
        assert_matches!(
            datastore.insert(&opctx, machine.clone()).await,
            Err(Error::ObjectAlreadyExists { .. })
        );
        let supply: Vec<Machine> = datastore
            .list(&opctx, Query::SupplyMachines { instance_type_id })
            .await
            .unwrap();
        assert_eq!(supply.len(), 1);
        assert_eq!(supply[0].id, machine.id);

        // A rolled back write is not visible.
        {
            let mut tx =
                datastore.transaction(&opctx, "rollback").await.unwrap();
            tx.delete::<Machine>(machine.id).await.unwrap();
        }
        assert!(datastore.fetch::<Machine>(&opctx, machine.id).await.is_ok());

        // Advisory locks contend across datastores and are released on
        // commit.
        let mut holder =
            datastore.transaction(&opctx, "holder").await.unwrap();
        holder.advisory_lock(&opctx, "instance-type").await.unwrap();
        let mut waiter =
            other_datastore.transaction(&opctx, "waiter").await.unwrap();
        assert_matches!(
            waiter.advisory_lock(&opctx, "instance-type").await,
            Err(Error::InternalError { .. })
        );
        drop(waiter);
        holder.delete::<Machine>(machine.id).await.unwrap();
        holder.commit().await.unwrap();

        let mut again =
            other_datastore.transaction(&opctx, "again").await.unwrap();
        again.advisory_lock(&opctx, "instance-type").await.unwrap();
        assert!(again.get::<Machine>(machine.id).await.unwrap().is_none());
        again.commit().await.unwrap();

        logctx.cleanup_successful();
    }
}
