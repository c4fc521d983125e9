// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::prefix::host_mask;
use crate::IpVersion;
use crate::IpamError;
use crate::Prefix;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::PoisonError;
use std::sync::RwLock;

/// Addressable prefix lengths, per address family
///
/// Roots must fall within `min..=max`; children must be longer than their
/// parent and no longer than `max`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PrefixLimits {
    pub min_ipv4_prefix_len: u8,
    pub max_ipv4_prefix_len: u8,
    pub min_ipv6_prefix_len: u8,
    pub max_ipv6_prefix_len: u8,
}

impl Default for PrefixLimits {
    fn default() -> Self {
        PrefixLimits {
            min_ipv4_prefix_len: 8,
            max_ipv4_prefix_len: 31,
            min_ipv6_prefix_len: 16,
            max_ipv6_prefix_len: 127,
        }
    }
}

impl PrefixLimits {
    fn bounds(&self, version: IpVersion) -> (u8, u8) {
        match version {
            IpVersion::V4 => {
                (self.min_ipv4_prefix_len, self.max_ipv4_prefix_len)
            }
            IpVersion::V6 => {
                (self.min_ipv6_prefix_len, self.max_ipv6_prefix_len)
            }
        }
    }

    /// Checks that a prefix of `len` bits is addressable for `version`.
    pub fn check(&self, version: IpVersion, len: u8) -> Result<(), IpamError> {
        let (min, max) = self.bounds(version);
        if len < min || len > max {
            return Err(IpamError::InvalidLength { requested: len, min, max });
        }
        Ok(())
    }
}

/// Utilization of one reserved prefix
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Usage {
    /// Addresses covered by child reservations
    pub acquired_ips: u128,
    /// Addresses not covered by any child reservation
    pub available_ips: u128,
    /// Number of direct child reservations
    pub acquired_prefixes: u64,
    /// The largest aligned prefixes that could still be reserved, lowest
    /// address first
    pub available_prefixes: Vec<String>,
    /// How many prefixes with two host bits could still be reserved
    pub available_smallest_prefixes: u128,
}

#[derive(Debug)]
struct Entry {
    parent: Option<Prefix>,
    children: BTreeSet<Prefix>,
}

#[derive(Debug, Default)]
struct Namespace {
    entries: BTreeMap<Prefix, Entry>,
}

impl Namespace {
    fn entry(&self, name: &str, prefix: &Prefix) -> Result<&Entry, IpamError> {
        self.entries.get(prefix).ok_or_else(|| IpamError::NotFound {
            namespace: name.to_string(),
            prefix: *prefix,
        })
    }
}

/// Splits the inclusive range `lo..=hi` inside `parent` into the largest
/// aligned prefixes that tile it, in address order.
fn decompose(parent: &Prefix, mut lo: u128, hi: u128, out: &mut Vec<Prefix>) {
    let width = parent.version().width();
    loop {
        let alignment = if lo == 0 { 128 } else { lo.trailing_zeros() as u8 };
        let mut host_bits = alignment.min(parent.host_bits());
        while host_mask(host_bits) > hi - lo {
            host_bits -= 1;
        }
        out.push(Prefix::from_parts(parent.version(), lo, width - host_bits));
        let last = lo + host_mask(host_bits);
        if last >= hi {
            break;
        }
        lo = last + 1;
    }
}

/// Returns the free space of `parent` as aligned blocks, in address order.
fn free_blocks(parent: &Prefix, children: &BTreeSet<Prefix>) -> Vec<Prefix> {
    let mut blocks = Vec::new();
    let mut cursor = Some(parent.base());
    for child in children {
        if let Some(start) = cursor {
            if child.base() > start {
                decompose(parent, start, child.base() - 1, &mut blocks);
            }
        }
        cursor = child.last().checked_add(1);
    }
    if let Some(start) = cursor {
        if start <= parent.last() {
            decompose(parent, start, parent.last(), &mut blocks);
        }
    }
    blocks
}

/// Picks where a `/len` child of `parent` goes.
///
/// Best fit: the smallest free aligned block that can hold the request, ties
/// going to the lowest address, and the child takes the lowest-addressed
/// slice of that block.
fn best_fit(
    parent: &Prefix,
    children: &BTreeSet<Prefix>,
    len: u8,
) -> Option<Prefix> {
    free_blocks(parent, children)
        .into_iter()
        .filter(|block| block.len() <= len)
        .max_by(|a, b| a.len().cmp(&b.len()).then(b.base().cmp(&a.base())))
        .map(|block| Prefix::from_parts(block.version(), block.base(), len))
}

/// Hierarchical prefix allocator
///
/// All mutations take the write lock for the whole operation.  Usage queries
/// take the read lock, so they see a consistent snapshot and never observe a
/// half-applied reservation.
pub struct Ipam {
    log: Logger,
    limits: PrefixLimits,
    namespaces: RwLock<BTreeMap<String, Namespace>>,
}

impl Ipam {
    pub fn new(log: &Logger, limits: PrefixLimits) -> Ipam {
        Ipam {
            log: log.new(o!("component" => "Ipam")),
            limits,
            namespaces: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn limits(&self) -> &PrefixLimits {
        &self.limits
    }

    /// Registers a top-level prefix in `namespace`.
    pub fn reserve_root(
        &self,
        namespace: &str,
        prefix: Prefix,
    ) -> Result<Prefix, IpamError> {
        self.limits.check(prefix.version(), prefix.len())?;

        let mut namespaces =
            self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        let ns = namespaces.entry(namespace.to_string()).or_default();
        // Every entry lies inside some root, so checking roots is enough.
        if let Some(existing) = ns
            .entries
            .iter()
            .filter(|(_, entry)| entry.parent.is_none())
            .map(|(p, _)| *p)
            .find(|p| p.overlaps(&prefix))
        {
            return Err(IpamError::Overlap { requested: prefix, existing });
        }
        ns.entries
            .insert(prefix, Entry { parent: None, children: BTreeSet::new() });
        info!(self.log, "reserved root prefix";
            "namespace" => namespace,
            "prefix" => %prefix,
        );
        Ok(prefix)
    }

    /// Carves a `/desired_len` prefix out of `parent`, which may be a root
    /// or an earlier child.
    pub fn reserve_child(
        &self,
        namespace: &str,
        parent: Prefix,
        desired_len: u8,
    ) -> Result<Prefix, IpamError> {
        if desired_len <= parent.len() {
            return Err(IpamError::LengthMismatch {
                parent,
                requested: desired_len,
            });
        }
        let (min, max) = self.limits.bounds(parent.version());
        if desired_len > max {
            return Err(IpamError::InvalidLength {
                requested: desired_len,
                min,
                max,
            });
        }

        let mut namespaces =
            self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        let ns = namespaces.get_mut(namespace).ok_or_else(|| {
            IpamError::NotFound {
                namespace: namespace.to_string(),
                prefix: parent,
            }
        })?;
        let entry = ns.entry(namespace, &parent)?;
        let child = best_fit(&parent, &entry.children, desired_len).ok_or(
            IpamError::InsufficientSpace { parent, requested: desired_len },
        )?;

        ns.entries.insert(
            child,
            Entry { parent: Some(parent), children: BTreeSet::new() },
        );
        if let Some(entry) = ns.entries.get_mut(&parent) {
            entry.children.insert(child);
        }
        info!(self.log, "reserved child prefix";
            "namespace" => namespace,
            "parent" => %parent,
            "prefix" => %child,
        );
        Ok(child)
    }

    /// Reserves exactly `child` inside `parent`, failing if any part of it
    /// is already taken.  Used to put back a reservation that was released
    /// by an operation that did not complete.
    pub fn reserve_specific_child(
        &self,
        namespace: &str,
        parent: Prefix,
        child: Prefix,
    ) -> Result<Prefix, IpamError> {
        if child.len() <= parent.len() || !parent.contains(&child) {
            return Err(IpamError::LengthMismatch {
                parent,
                requested: child.len(),
            });
        }

        let mut namespaces =
            self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        let ns = namespaces.get_mut(namespace).ok_or_else(|| {
            IpamError::NotFound {
                namespace: namespace.to_string(),
                prefix: parent,
            }
        })?;
        let entry = ns.entry(namespace, &parent)?;
        if let Some(existing) =
            entry.children.iter().find(|c| c.overlaps(&child))
        {
            return Err(IpamError::Overlap {
                requested: child,
                existing: *existing,
            });
        }

        ns.entries.insert(
            child,
            Entry { parent: Some(parent), children: BTreeSet::new() },
        );
        if let Some(entry) = ns.entries.get_mut(&parent) {
            entry.children.insert(child);
        }
        info!(self.log, "reserved specific child prefix";
            "namespace" => namespace,
            "parent" => %parent,
            "prefix" => %child,
        );
        Ok(child)
    }

    /// Frees a reservation, returning its space to its parent.
    ///
    /// A prefix with children of its own cannot be released.
    pub fn release(
        &self,
        namespace: &str,
        prefix: Prefix,
    ) -> Result<(), IpamError> {
        let mut namespaces =
            self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        let ns = namespaces.get_mut(namespace).ok_or_else(|| {
            IpamError::NotFound { namespace: namespace.to_string(), prefix }
        })?;
        let entry = ns.entry(namespace, &prefix)?;
        if !entry.children.is_empty() {
            return Err(IpamError::InUse {
                prefix,
                children: entry.children.len(),
            });
        }
        let parent = entry.parent;
        ns.entries.remove(&prefix);
        if let Some(parent) = parent {
            if let Some(entry) = ns.entries.get_mut(&parent) {
                entry.children.remove(&prefix);
            }
        }
        if ns.entries.is_empty() {
            namespaces.remove(namespace);
        }
        info!(self.log, "released prefix";
            "namespace" => namespace,
            "prefix" => %prefix,
        );
        Ok(())
    }

    /// Returns utilization of a reserved prefix.
    pub fn usage(
        &self,
        namespace: &str,
        prefix: Prefix,
    ) -> Result<Usage, IpamError> {
        let namespaces =
            self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let ns = namespaces.get(namespace).ok_or_else(|| {
            IpamError::NotFound { namespace: namespace.to_string(), prefix }
        })?;
        let entry = ns.entry(namespace, &prefix)?;

        let acquired_ips: u128 =
            entry.children.iter().map(|c| c.size()).sum();
        let free = free_blocks(&prefix, &entry.children);
        let usage = Usage {
            acquired_ips,
            available_ips: prefix.size() - acquired_ips,
            acquired_prefixes: entry.children.len() as u64,
            available_smallest_prefixes: free
                .iter()
                .map(|block| block.size() >> 2)
                .sum(),
            available_prefixes: free.iter().map(|b| b.to_string()).collect(),
        };
        debug!(self.log, "computed usage";
            "namespace" => namespace,
            "prefix" => %prefix,
            "acquired_prefixes" => usage.acquired_prefixes,
        );
        Ok(usage)
    }
}
