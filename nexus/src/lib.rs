// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to Nexus, the consistency engine at the heart of the
//! control plane
//!
//! Nexus keeps three things in agreement: the ledger of what has been
//! promised to whom, the prefix allocator, and the Site agents that carry
//! out physical changes.  Each mutation locks what it contends on, validates
//! against the ledger, mutates the ledger and the allocator together, commits,
//! and only then tells the Site.

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod app;
pub mod config; // Public for testing

pub use app::Nexus;
pub use config::Config;

#[macro_use]
extern crate slog;
