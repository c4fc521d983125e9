// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and related facilities for representing resources in the
//! control plane's outward-facing API
//!
//! The HTTP layer that consumes these lives elsewhere; nothing here knows
//! about status codes except the final conversion into a Dropshot error.

mod error;
pub use error::*;

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FormatResult;

/// Result of a create operation for the specified type
pub type CreateResult<T> = Result<T, Error>;
/// Result of a delete operation for the specified type
pub type DeleteResult = Result<(), Error>;
/// Result of a list operation that returns a vector
pub type ListResultVec<T> = Result<Vec<T>, Error>;
/// Result of a lookup operation for the specified type
pub type LookupResult<T> = Result<T, Error>;
/// Result of an update operation for the specified type
pub type UpdateResult<T> = Result<T, Error>;

/// Identifies a type of API resource
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum ResourceType {
    Allocation,
    AllocationConstraint,
    Instance,
    InstanceType,
    IpBlock,
    Machine,
    MachineInstanceType,
    Site,
    Subnet,
    Tenant,
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(
            f,
            "{}",
            match self {
                ResourceType::Allocation => "allocation",
                ResourceType::AllocationConstraint => "allocation constraint",
                ResourceType::Instance => "instance",
                ResourceType::InstanceType => "instance type",
                ResourceType::IpBlock => "ip block",
                ResourceType::Machine => "machine",
                ResourceType::MachineInstanceType => {
                    "machine instance type association"
                }
                ResourceType::Site => "site",
                ResourceType::Subnet => "subnet",
                ResourceType::Tenant => "tenant",
            }
        )
    }
}
