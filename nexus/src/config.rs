// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a nexus
//! configuration

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use ironplane_common::FileKv;
use ironplane_db_queries::db;
use ironplane_ipam::PrefixLimits;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use slog::Logger;
use slog_error_chain::SlogInlineError;
use std::time::Duration;
use thiserror::Error;

/// Configuration for a nexus instance
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    /// Database holding the ledger.
    pub database: db::Config,
    /// Timeouts bounding each phase of a mutation.
    #[serde(default)]
    pub tunables: Tunables,
    /// Prefix lengths the allocator accepts.
    #[serde(default)]
    pub ipam: PrefixLimits,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }

    /// Builds the root logger described by `log`.
    pub fn to_logger(&self, name: &str) -> Result<Logger, std::io::Error> {
        let log = self.log.to_logger(name)?;
        Ok(log.new(o!(FileKv)))
    }
}

/// Tunable timeouts
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Tunables {
    /// Longest a transaction waits for any one advisory lock
    #[serde_as(as = "DurationSeconds<u64>")]
    pub lock_timeout: Duration,
    /// Longest a mutation waits for the Site to apply it
    #[serde_as(as = "DurationSeconds<u64>")]
    pub site_workflow_timeout: Duration,
    /// Longest we wait for the Site to acknowledge a terminate request
    #[serde_as(as = "DurationSeconds<u64>")]
    pub site_terminate_timeout: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            lock_timeout: Duration::from_secs(300),
            site_workflow_timeout: Duration::from_secs(30),
            site_terminate_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error, SlogInlineError)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;
    use dropshot::ConfigLoggingIfExists;
    use dropshot::ConfigLoggingLevel;

    fn write_config(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_config_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [database]
            url = "postgresql://root@[::1]:32221/ironplane?sslmode=disable"
            "#,
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(
            config.database.url,
            "postgresql://root@[::1]:32221/ironplane?sslmode=disable"
        );
        assert_eq!(config.database.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.tunables, Tunables::default());
        assert_eq!(config.ipam, PrefixLimits::default());
    }

    #[test]
    fn test_config_full() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "file"
            level = "debug"
            path = "/var/log/nexus.log"
            if_exists = "append"

            [database]
            url = "postgresql://nexus@db.example:5432/ironplane"
            connection_timeout = 5

            [tunables]
            lock_timeout = 60
            site_workflow_timeout = 5

            [ipam]
            max_ipv4_prefix_len = 30
            "#,
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(
            config.log,
            ConfigLogging::File {
                level: ConfigLoggingLevel::Debug,
                path: "/var/log/nexus.log".into(),
                if_exists: ConfigLoggingIfExists::Append,
            }
        );
        assert_eq!(config.database.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.tunables.lock_timeout, Duration::from_secs(60));
        assert_eq!(
            config.tunables.site_workflow_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(
            config.tunables.site_terminate_timeout,
            Tunables::default().site_terminate_timeout
        );
        assert_eq!(config.ipam.max_ipv4_prefix_len, 30);
        assert_eq!(config.ipam.min_ipv4_prefix_len, 8);
    }

    #[test]
    fn test_config_errors() {
        let dir = Utf8TempDir::new().unwrap();
        assert_matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(LoadError::Io { .. })
        );
        let path = write_config(&dir, "[tunables]\nlock_timeout = \"soon\"\n");
        assert_matches!(Config::from_file(&path), Err(LoadError::Parse { .. }));

        // The ledger's database has no default.
        let path = write_config(
            &dir,
            "[log]\nmode = \"stderr-terminal\"\nlevel = \"info\"\n",
        );
        assert_matches!(Config::from_file(&path), Err(LoadError::Parse { .. }));
    }

    #[test]
    fn test_config_logger() {
        let dir = Utf8TempDir::new().unwrap();
        let log_path = dir.path().join("nexus.log");
        let config = Config {
            log: ConfigLogging::File {
                level: ConfigLoggingLevel::Info,
                path: log_path.clone(),
                if_exists: ConfigLoggingIfExists::Fail,
            },
            database: db::Config {
                url: "postgresql://localhost/ironplane".to_string(),
                connection_timeout: Duration::from_secs(1),
            },
            tunables: Tunables::default(),
            ipam: PrefixLimits::default(),
        };
        let log = config.to_logger("nexus").unwrap();
        info!(log, "logger works");
        drop(log);
        assert!(log_path.exists());
    }
}
