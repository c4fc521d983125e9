// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Undoing allocator mutations when the ledger transaction they belong to
//! does not commit

use ironplane_ipam::Ipam;
use ironplane_ipam::Prefix;
use slog::Logger;
use slog_error_chain::InlineErrorChain;

#[derive(Debug)]
enum Mutation {
    ReservedRoot { namespace: String, prefix: Prefix },
    ReservedChild { namespace: String, prefix: Prefix },
    ReleasedRoot { namespace: String, prefix: Prefix },
    ReleasedChild { namespace: String, parent: Prefix, prefix: Prefix },
}

/// Records the allocator mutations made on behalf of one ledger transaction
///
/// Unless [`AllocatorUndo::disarm`] is called once the transaction has
/// committed, dropping the guard reverses every recorded mutation, newest
/// first.  This covers every way the operation can fail after touching the
/// allocator: a validation or ledger error, a failed commit, or the request
/// being cancelled.
pub(crate) struct AllocatorUndo<'a> {
    log: Logger,
    ipam: &'a Ipam,
    mutations: Vec<Mutation>,
}

impl<'a> AllocatorUndo<'a> {
    pub(crate) fn new(log: &Logger, ipam: &'a Ipam) -> AllocatorUndo<'a> {
        AllocatorUndo { log: log.clone(), ipam, mutations: Vec::new() }
    }

    pub(crate) fn reserved_root(&mut self, namespace: &str, prefix: Prefix) {
        self.mutations.push(Mutation::ReservedRoot {
            namespace: namespace.to_string(),
            prefix,
        });
    }

    pub(crate) fn reserved_child(&mut self, namespace: &str, prefix: Prefix) {
        self.mutations.push(Mutation::ReservedChild {
            namespace: namespace.to_string(),
            prefix,
        });
    }

    pub(crate) fn released_root(&mut self, namespace: &str, prefix: Prefix) {
        self.mutations.push(Mutation::ReleasedRoot {
            namespace: namespace.to_string(),
            prefix,
        });
    }

    pub(crate) fn released_child(
        &mut self,
        namespace: &str,
        parent: Prefix,
        prefix: Prefix,
    ) {
        self.mutations.push(Mutation::ReleasedChild {
            namespace: namespace.to_string(),
            parent,
            prefix,
        });
    }

    /// Keeps the recorded mutations.  Call only after the ledger commit
    /// succeeded.
    pub(crate) fn disarm(mut self) {
        self.mutations.clear();
    }
}

impl Drop for AllocatorUndo<'_> {
    fn drop(&mut self) {
        while let Some(mutation) = self.mutations.pop() {
            let result = match &mutation {
                Mutation::ReservedRoot { namespace, prefix }
                | Mutation::ReservedChild { namespace, prefix } => {
                    self.ipam.release(namespace, *prefix)
                }
                Mutation::ReleasedRoot { namespace, prefix } => {
                    self.ipam.reserve_root(namespace, *prefix).map(|_| ())
                }
                Mutation::ReleasedChild { namespace, parent, prefix } => self
                    .ipam
                    .reserve_specific_child(namespace, *parent, *prefix)
                    .map(|_| ()),
            };
            match result {
                Ok(()) => {
                    warn!(self.log, "undid allocator mutation";
                        "mutation" => ?mutation,
                    );
                }
                Err(err) => {
                    error!(self.log, "failed to undo allocator mutation";
                        "mutation" => ?mutation,
                        InlineErrorChain::new(&err),
                    );
                }
            }
        }
    }
}
