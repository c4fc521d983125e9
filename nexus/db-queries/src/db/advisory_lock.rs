// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transaction-scoped advisory locks keyed by resource identity
//!
//! Callers name the thing they need exclusive access to with a string, for
//! example an InstanceType id, or `"<tenantID>-<ipBlockID>"` for one tenant's
//! slice of one IP block.  That string is hashed into an [`AdvisoryLockKey`].
//! Two operations serialize against each other exactly when their identity
//! strings hash to the same key.
//!
//! Locks are only ever taken through
//! [`Transaction::advisory_lock`](super::Transaction::advisory_lock) and are
//! held until that transaction commits or rolls back.  There is no explicit
//! unlock.  In PostgreSQL the key is passed to `pg_advisory_xact_lock`.

use ironplane_common::api::external::Error;
use slog_error_chain::SlogInlineError;
use std::fmt;
use std::time::Duration;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// A lock key derived from an identity string
///
/// The key is the 64-bit FNV-1a hash of the identity's UTF-8 bytes with the
/// sign bit cleared, so that it is a non-negative `i64` like a database
/// advisory lock id.  Any two components that hash the same identity this
/// way agree on which operations conflict.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AdvisoryLockKey(i64);

impl AdvisoryLockKey {
    pub fn for_identity(identity: &str) -> AdvisoryLockKey {
        let hash = identity.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        });
        // Clearing the top bit makes the value fit in an i64.
        AdvisoryLockKey((hash & 0x7fff_ffff_ffff_ffff) as i64)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for AdvisoryLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum LockError {
    #[error(
        "timed out after {timeout:?} waiting for advisory lock on {identity:?}"
    )]
    Timeout { identity: String, timeout: Duration },

    #[error(
        "request deadline passed waiting for advisory lock on {identity:?}"
    )]
    DeadlineExceeded { identity: String },
}

impl From<LockError> for Error {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Timeout { .. } => {
                Error::internal_error(&error.to_string())
            }
            LockError::DeadlineExceeded { .. } => {
                Error::unavail(&error.to_string())
            }
        }
    }
}
