// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Database connection pooling

// Notes about bb8's behavior:
// * When the database is completely offline, and somebody wants a connection,
//   it still waits for the connection timeout before giving up.
// * `build_unchecked()` allows the pool to start up with no connections
//   established, so Nexus can start before the database is reachable.

use super::Config as DbConfig;
use async_bb8_diesel::ConnectionError;
use async_bb8_diesel::ConnectionManager;
use diesel::PgConnection;
use ironplane_common::api::external::Error;

pub type DbConnection = PgConnection;

/// A connection checked out of the [`Pool`], owned by whoever holds it
pub type PooledConnection =
    bb8::PooledConnection<'static, ConnectionManager<DbConnection>>;

/// Wrapper around a database connection pool.
///
/// Expected to be used as the primary interface to the database.
pub struct Pool {
    pool: bb8::Pool<ConnectionManager<DbConnection>>,
}

impl Pool {
    pub fn new(log: &slog::Logger, db_config: &DbConfig) -> Self {
        let log = log.new(o!(
            "database_url" => db_config.url.clone(),
            "component" => "db::Pool"
        ));
        info!(&log, "database connection pool";
            "connection_timeout" => ?db_config.connection_timeout,
        );
        let error_sink = LoggingErrorSink::new(log);
        let manager = ConnectionManager::<DbConnection>::new(&db_config.url);
        let pool = bb8::Builder::new()
            .connection_timeout(db_config.connection_timeout)
            .error_sink(Box::new(error_sink))
            .build_unchecked(manager);
        Pool { pool }
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &bb8::Pool<ConnectionManager<DbConnection>> {
        &self.pool
    }

    /// Checks out a connection that is not tied to the pool's lifetime.
    pub async fn claim(&self) -> Result<PooledConnection, Error> {
        self.pool.get_owned().await.map_err(|e| {
            Error::unavail(&format!(
                "failed to acquire database connection: {}",
                e
            ))
        })
    }
}

#[derive(Clone, Debug)]
struct LoggingErrorSink {
    log: slog::Logger,
}

impl LoggingErrorSink {
    fn new(log: slog::Logger) -> LoggingErrorSink {
        LoggingErrorSink { log }
    }
}

impl bb8::ErrorSink<ConnectionError> for LoggingErrorSink {
    fn sink(&self, error: ConnectionError) {
        error!(
            &self.log,
            "database connection error";
            "error_message" => #%error
        );
    }

    fn boxed_clone(&self) -> Box<dyn bb8::ErrorSink<ConnectionError>> {
        Box::new(self.clone())
    }
}
