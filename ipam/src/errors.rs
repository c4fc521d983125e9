// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Prefix;
use ironplane_common::api::external::Error;
use slog_error_chain::SlogInlineError;

/// Errors returned by the prefix allocator
#[derive(Clone, Debug, PartialEq, thiserror::Error, SlogInlineError)]
pub enum IpamError {
    #[error("invalid CIDR {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error(
        "prefix length /{requested} is outside the addressable range \
         /{min}../{max}"
    )]
    InvalidLength { requested: u8, min: u8, max: u8 },

    #[error(
        "requested length /{requested} does not fit inside parent {parent}"
    )]
    LengthMismatch { parent: Prefix, requested: u8 },

    #[error("{requested} overlaps existing prefix {existing}")]
    Overlap { requested: Prefix, existing: Prefix },

    #[error("prefix {prefix} not found in namespace {namespace:?}")]
    NotFound { namespace: String, prefix: Prefix },

    #[error("no free /{requested} left in {parent}")]
    InsufficientSpace { parent: Prefix, requested: u8 },

    #[error("prefix {prefix} still has {children} child prefix(es)")]
    InUse { prefix: Prefix, children: usize },
}

impl IpamError {
    /// Returns true for the error a release reports when the prefix is
    /// already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IpamError::NotFound { .. })
    }
}

impl From<IpamError> for Error {
    fn from(error: IpamError) -> Self {
        match error {
            IpamError::InvalidCidr { .. } => {
                Error::invalid_value("prefix", error.to_string())
            }
            IpamError::InvalidLength { .. } => {
                Error::invalid_value("prefix_length", error.to_string())
            }
            IpamError::LengthMismatch { .. } => {
                Error::invalid_request(error.to_string())
            }
            IpamError::Overlap { .. } | IpamError::InUse { .. } => {
                Error::conflict(error.to_string())
            }
            IpamError::InsufficientSpace { .. } => Error::insufficient_capacity(
                "not enough free address space in the parent IP block",
                error.to_string(),
            ),
            // Callers only name prefixes the ledger says exist, so a missing
            // one means the two have drifted apart.
            IpamError::NotFound { .. } => {
                Error::internal_error(&error.to_string())
            }
        }
    }
}
