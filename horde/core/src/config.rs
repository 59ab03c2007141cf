// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files for a Horde core instance

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use horde_common::key::KeyOrigin;
use horde_common::key::KeyOriginError;
use horde_db_queries::db::keygen::DEFAULT_BLOCK_SIZE;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Configuration for a Horde core instance
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    /// Database configuration.
    pub database: horde_db_queries::db::Config,
    /// Key generation for this instance.
    pub keys: KeyConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    pub data_center: u32,
    pub worker: u32,
    /// Number of sequence values reserved per round trip to the database
    #[serde(default = "KeyConfig::default_block_size")]
    pub block_size: u64,
}

impl KeyConfig {
    fn default_block_size() -> u64 {
        DEFAULT_BLOCK_SIZE
    }

    pub fn origin(&self) -> Result<KeyOrigin, KeyOriginError> {
        KeyOrigin::new(self.data_center, self.worker)
    }
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// The key origin is checked here so that a bad one is reported against
    /// the file it came from.
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        config_parsed
            .keys
            .origin()
            .map_err(|err| LoadError::InvalidKeys { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Debug, Error)]
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
    #[error("invalid key configuration in \"{path}\": {err}")]
    InvalidKeys {
        path: Utf8PathBuf,
        #[source]
        err: KeyOriginError,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;
    use dropshot::ConfigLoggingLevel;
    use horde_db_queries::db::DbUrl;

    fn write_config(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_example_config_parses() {
        let path = Utf8Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("configs")
            .join("config.toml");
        let config = Config::from_file(&path).unwrap();
        assert_matches!(
            config.log,
            ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
        );
        assert_matches!(config.database.url, DbUrl::Postgres(_));
        assert_eq!(config.database.pool_size, 20);
        assert_eq!(config.keys.block_size, 10);
        let origin = config.keys.origin().unwrap();
        assert_eq!((origin.data_center(), origin.worker()), (1, 1));
    }

    #[test]
    fn test_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "debug"

            [database]
            url = ":memory:"

            [keys]
            data_center = 2
            worker = 7
            "#,
        );
        let config = Config::from_file(&path).unwrap();
        assert!(config.database.url.is_memory());
        assert_eq!(config.database.pool_size, 10);
        assert_eq!(config.database.connection_timeout_secs, 30);
        assert_eq!(config.keys.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_load_errors() {
        let dir = Utf8TempDir::new().unwrap();

        let missing = dir.path().join("missing.toml");
        assert_matches!(
            Config::from_file(&missing),
            Err(LoadError::Io { path, .. }) if path == missing
        );

        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [database]
            url = "mysql://localhost/horde"

            [keys]
            data_center = 1
            worker = 1
            "#,
        );
        assert_matches!(Config::from_file(&path), Err(LoadError::Parse { .. }));

        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [database]
            url = ":memory:"

            [keys]
            data_center = 1
            worker = 100000
            "#,
        );
        assert_matches!(
            Config::from_file(&path),
            Err(LoadError::InvalidKeys {
                err: KeyOriginError::Worker(100000),
                ..
            })
        );
    }
}
