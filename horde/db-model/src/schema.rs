// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Schema text and SQL dialect handling
//!
//! The schema and every query are written once, in the production dialect.
//! Text for the embedded dialect is derived by substitution.

use std::borrow::Cow;
use std::fmt;

/// The schema, in the production dialect.
pub const SCHEMA: &str = include_str!("../../../schema/horde/dbinit.sql");

/// SQL dialects understood by the stores
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dialect {
    /// PostgreSQL
    Postgres,
    /// SQLite, either on disk or in memory
    Sqlite,
}

/// Substitutions applied, in order, to derive embedded-dialect text.  JSON
/// parameters are written as `CAST($n AS JSONB)`; SQLite has no JSON type to
/// cast to, so those casts become plain text first.
const SQLITE_SUBSTITUTIONS: &[(&str, &str)] = &[
    ("AS JSONB)", "AS TEXT)"),
    ("JSONB", "JSON"),
    ("BYTEA", "BLOB"),
    ("TIMESTAMP", "DATETIME"),
];

impl Dialect {
    /// Rewrites production-dialect SQL for this dialect.
    pub fn apply<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        match self {
            Dialect::Postgres => Cow::Borrowed(sql),
            Dialect::Sqlite => {
                let mut out = sql.to_owned();
                for (from, to) in SQLITE_SUBSTITUTIONS {
                    out = out.replace(from, to);
                }
                Cow::Owned(out)
            }
        }
    }

    /// The schema for this dialect.
    pub fn schema(&self) -> Cow<'static, str> {
        self.apply(SCHEMA)
    }

    /// Whether connections of this dialect must not be used concurrently.
    pub fn serialized(&self) -> bool {
        matches!(self, Dialect::Sqlite)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sqlite_schema() {
        let schema = Dialect::Sqlite.schema();
        assert!(!schema.contains("JSONB"));
        assert!(!schema.contains("BYTEA"));
        assert!(!schema.contains("TIMESTAMP"));
        assert!(schema.contains("tags JSON NOT NULL"));
        assert!(schema.contains("payload BLOB NOT NULL"));
        assert!(schema.contains("created DATETIME NOT NULL"));
        assert!(Dialect::Sqlite.serialized());
    }

    #[test]
    fn test_postgres_unchanged() {
        assert_eq!(Dialect::Postgres.schema(), SCHEMA);
        let q = "UPDATE team SET tags = CAST($1 AS JSONB) WHERE team_id = $2";
        assert_eq!(Dialect::Postgres.apply(q), q);
        assert!(!Dialect::Postgres.serialized());
    }

    #[test]
    fn test_json_parameter_cast() {
        let q = "UPDATE team SET tags = CAST($1 AS JSONB) WHERE team_id = $2";
        assert_eq!(
            Dialect::Sqlite.apply(q),
            "UPDATE team SET tags = CAST($1 AS TEXT) WHERE team_id = $2"
        );
    }
}
