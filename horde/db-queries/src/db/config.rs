// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Database configuration

use horde_db_model::schema::Dialect;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Database configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where to find the database
    pub url: DbUrl,
    /// Maximum number of pooled connections.  Ignored for in-memory
    /// databases, which always use exactly one connection.
    #[serde(default = "Config::default_pool_size")]
    pub pool_size: u32,
    /// How long to wait for a pooled connection before giving up
    #[serde(default = "Config::default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// Upper bound on a single statement
    #[serde(default = "Config::default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

impl Config {
    fn default_pool_size() -> u32 {
        10
    }

    fn default_connection_timeout_secs() -> u64 {
        30
    }

    fn default_statement_timeout_secs() -> u64 {
        30
    }

    /// Configuration for an in-memory database with default limits.
    pub fn in_memory() -> Config {
        Config {
            url: DbUrl::Sqlite(DbUrl::MEMORY.to_owned()),
            pool_size: 1,
            connection_timeout_secs: Self::default_connection_timeout_secs(),
            statement_timeout_secs: Self::default_statement_timeout_secs(),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

/// Location of a database, parsed from a URL
///
/// `postgres://...` and `postgresql://...` select PostgreSQL.  `sqlite://`
/// followed by a path selects an SQLite file; `:memory:` (with or without
/// the `sqlite://` prefix) selects a private in-memory SQLite database.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum DbUrl {
    /// A PostgreSQL connection URL, passed to the driver as is
    Postgres(String),
    /// An SQLite path, or `:memory:`
    Sqlite(String),
}

impl DbUrl {
    pub const MEMORY: &'static str = ":memory:";

    pub fn dialect(&self) -> Dialect {
        match self {
            DbUrl::Postgres(_) => Dialect::Postgres,
            DbUrl::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, DbUrl::Sqlite(path) if path == Self::MEMORY)
    }

    /// The string handed to the driver when connecting.
    pub fn connection_string(&self) -> &str {
        match self {
            DbUrl::Postgres(url) => url,
            DbUrl::Sqlite(path) => path,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unsupported database URL {0:?}")]
pub struct DbUrlParseError(String);

impl FromStr for DbUrl {
    type Err = DbUrlParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("postgres://") || s.starts_with("postgresql://") {
            return Ok(DbUrl::Postgres(s.to_owned()));
        }
        if s == Self::MEMORY {
            return Ok(DbUrl::Sqlite(s.to_owned()));
        }
        match s.strip_prefix("sqlite://") {
            Some(path) if !path.is_empty() => Ok(DbUrl::Sqlite(path.to_owned())),
            _ => Err(DbUrlParseError(s.to_owned())),
        }
    }
}

impl TryFrom<String> for DbUrl {
    type Error = DbUrlParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DbUrl> for String {
    fn from(url: DbUrl) -> Self {
        url.to_string()
    }
}

impl fmt::Display for DbUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbUrl::Postgres(url) => f.write_str(url),
            DbUrl::Sqlite(path) if path == Self::MEMORY => f.write_str(path),
            DbUrl::Sqlite(path) => write!(f, "sqlite://{}", path),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_urls() {
        let url: DbUrl = "postgresql://horde@localhost/horde".parse().unwrap();
        assert_eq!(url.dialect(), Dialect::Postgres);
        assert_eq!(url.connection_string(), "postgresql://horde@localhost/horde");

        let url: DbUrl = "sqlite:///var/lib/horde.db".parse().unwrap();
        assert_eq!(url, DbUrl::Sqlite("/var/lib/horde.db".to_owned()));
        assert_eq!(url.to_string(), "sqlite:///var/lib/horde.db");
        assert!(!url.is_memory());

        let url: DbUrl = "sqlite://:memory:".parse().unwrap();
        assert!(url.is_memory());
        assert_eq!(":memory:".parse::<DbUrl>().unwrap(), url);

        assert_matches!("mysql://localhost".parse::<DbUrl>(), Err(_));
        assert_matches!("sqlite://".parse::<DbUrl>(), Err(_));
    }
}
