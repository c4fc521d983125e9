// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test support code that can be enabled by dependencies via this crate's
//! `testing` feature.
//!
//! This feature should only be enabled under `dev-dependencies` to avoid this
//! test support code leaking into release binaries.

use crate::context::OpContext;
use crate::db::datastore::DEFAULT_LOCK_TIMEOUT;
use crate::db::ledger::MemoryLedger;
use crate::db::DataStore;
use dropshot::test_util::LogContext;
use std::sync::Arc;
use std::time::Duration;

/// Constructs a datastore over an empty in-memory ledger and a context to
/// operate on it with
pub fn datastore_test(logctx: &LogContext) -> (OpContext, Arc<DataStore>) {
    datastore_test_on(logctx, &MemoryLedger::new(), DEFAULT_LOCK_TIMEOUT)
}

/// Like [`datastore_test`], over a ledger the caller keeps a handle to
///
/// Datastores built on clones of one `ledger` share its rows and advisory
/// locks, like several Nexus instances sharing one database.
pub fn datastore_test_on(
    logctx: &LogContext,
    ledger: &MemoryLedger,
    lock_timeout: Duration,
) -> (OpContext, Arc<DataStore>) {
    let datastore = Arc::new(DataStore::new(
        &logctx.log,
        Arc::new(ledger.clone()),
        lock_timeout,
    ));
    let opctx = OpContext::for_tests(logctx.log.new(o!()));
    (opctx, datastore)
}
