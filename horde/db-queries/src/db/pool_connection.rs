// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Customization that happens on each connection as it is established.

use super::DbUrl;
use diesel::connection::SimpleConnection;
use diesel::query_builder::SqlQuery;
use diesel::Connection;
use diesel::PgConnection;
use diesel::SqliteConnection;
use horde_db_model::schema::Dialect;
use std::time::Duration;

/// A connection to either supported database
#[derive(diesel::MultiConnection)]
pub enum DbConnection {
    Postgresql(PgConnection),
    Sqlite(SqliteConnection),
}

impl DbConnection {
    pub fn dialect(&self) -> Dialect {
        match self {
            DbConnection::Postgresql(_) => Dialect::Postgres,
            DbConnection::Sqlite(_) => Dialect::Sqlite,
        }
    }
}

/// Builds a raw query from production-dialect text, rewritten for the
/// dialect of `conn`.
///
/// Placeholders are written `$1`, `$2`, ... and must first appear in
/// ascending order: SQLite numbers `$NAME` parameters by first appearance.
pub fn sql(conn: &DbConnection, text: &str) -> SqlQuery {
    diesel::sql_query(conn.dialect().apply(text).into_owned())
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to connect")]
    Connect(#[from] diesel::ConnectionError),
    #[error("failed to initialize connection")]
    Initialize(#[from] diesel::result::Error),
}

/// Establishes pooled connections and applies per-connection settings
///
/// PostgreSQL connections get a statement timeout.  SQLite connections get
/// foreign key enforcement, which SQLite leaves off by default, and a busy
/// timeout for writers contending on the database file.
pub struct ConnectionManager {
    url: DbUrl,
    statement_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(url: DbUrl, statement_timeout: Duration) -> Self {
        ConnectionManager { url, statement_timeout }
    }

    fn on_acquire_sql(&self) -> String {
        let millis = self.statement_timeout.as_millis();
        match self.url {
            DbUrl::Postgres(_) => format!("SET statement_timeout = {};", millis),
            DbUrl::Sqlite(_) => format!(
                "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
                millis
            ),
        }
    }
}

impl r2d2::ManageConnection for ConnectionManager {
    type Connection = DbConnection;
    type Error = ConnectError;

    fn connect(&self) -> Result<DbConnection, ConnectError> {
        let mut conn = match &self.url {
            DbUrl::Postgres(url) => {
                DbConnection::Postgresql(PgConnection::establish(url)?)
            }
            DbUrl::Sqlite(path) => {
                DbConnection::Sqlite(SqliteConnection::establish(path)?)
            }
        };
        conn.batch_execute(&self.on_acquire_sql())?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut DbConnection) -> Result<(), ConnectError> {
        conn.batch_execute("SELECT 1")?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut DbConnection) -> bool {
        false
    }
}
