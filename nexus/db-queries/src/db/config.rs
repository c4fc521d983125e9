// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nexus database configuration

use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::time::Duration;

/// Nexus database configuration
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// database url
    pub url: String,
    /// Longest a request waits for a pooled connection
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: Duration,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}
