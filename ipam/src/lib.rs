// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hierarchical prefix allocator
//!
//! Address space is partitioned into namespaces (see [`namespace_for`]).
//! Within a namespace, providers register top-level prefixes with
//! [`Ipam::reserve_root`], and child prefixes are carved out of any
//! registered prefix with [`Ipam::reserve_child`].  Children may themselves
//! be carved further, which is how tenant blocks are subdivided.
//!
//! The allocator is not covered by any ledger transaction.  Callers that
//! mutate it as part of a larger operation are responsible for undoing the
//! mutation if that operation fails.

mod allocator;
mod errors;
mod namespace;
mod prefix;

pub use allocator::Ipam;
pub use allocator::PrefixLimits;
pub use allocator::Usage;
pub use errors::IpamError;
pub use namespace::cidr_for;
pub use namespace::namespace_for;
pub use namespace::parse_cidr;
pub use prefix::IpVersion;
pub use prefix::Prefix;
