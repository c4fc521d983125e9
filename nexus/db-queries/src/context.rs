// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state used by API request handlers

use slog::Logger;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Provides general facilities scoped to whatever operation is being
/// performed
///
/// Every mutation request builds its own `OpContext` and threads it through
/// each layer it calls into.  It carries the request's logger (tagged with a
/// fresh request id) and the request's deadline, if the caller set one.
pub struct OpContext {
    pub log: Logger,
    created_instant: Instant,
    deadline: Option<Instant>,
}

impl OpContext {
    /// Returns a context for a new request, whose work must finish within
    /// `timeout` if one is given.
    pub fn for_request(log: &Logger, timeout: Option<Duration>) -> OpContext {
        let request_id = Uuid::new_v4();
        let created_instant = Instant::now();
        OpContext {
            log: log.new(o!("request_id" => request_id.to_string())),
            created_instant,
            deadline: timeout.map(|t| created_instant + t),
        }
    }

    /// Returns a context suitable for use in tests, with no deadline.
    pub fn for_tests(log: Logger) -> OpContext {
        OpContext::for_request(&log, None)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, or `None` if there is no deadline.
    /// Zero once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Time since this request began
    pub fn elapsed(&self) -> Duration {
        self.created_instant.elapsed()
    }
}

#[cfg(test)]
mod test {
    use super::OpContext;
    use ironplane_test_utils::dev::test_setup_log;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let logctx = test_setup_log("test_deadline");
        let opctx = OpContext::for_request(
            &logctx.log,
            Some(Duration::from_secs(5)),
        );
        assert_eq!(opctx.remaining(), Some(Duration::from_secs(5)));
        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(opctx.remaining(), Some(Duration::ZERO));
        assert!(opctx.elapsed() >= Duration::from_secs(7));

        let opctx = OpContext::for_tests(logctx.log.clone());
        assert_eq!(opctx.remaining(), None);
        assert_eq!(opctx.deadline(), None);
        logctx.cleanup_successful();
    }
}
