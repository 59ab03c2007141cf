// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Database connection pooling
//!
//! diesel connections are blocking, so every use of a pooled connection runs
//! on tokio's blocking thread pool (see [`Pool::run`]).

use super::pool_connection::ConnectionManager;
use super::pool_connection::DbConnection;
use super::Config as DbConfig;
use diesel::connection::SimpleConnection;
use horde_common::api::external::Error;
use horde_db_model::schema::Dialect;
use slog::Logger;

/// Wrapper around a database connection pool.
///
/// Expected to be used as the primary interface to the database.
pub struct Pool {
    log: Logger,
    dialect: Dialect,
    pool: r2d2::Pool<ConnectionManager>,
}

impl Pool {
    /// Creates a pool for the configured database.
    ///
    /// Connections to a server are established lazily.  An in-memory
    /// database lives exactly as long as its connection, so it gets a pool of
    /// one connection that is opened immediately and never recycled.
    pub fn new(log: &Logger, db_config: &DbConfig) -> Result<Self, Error> {
        let log = log.new(o!(
            "database_url" => db_config.url.to_string(),
            "component" => "db::Pool"
        ));
        info!(&log, "database connection pool");
        let manager = ConnectionManager::new(
            db_config.url.clone(),
            db_config.statement_timeout(),
        );
        let builder = r2d2::Pool::builder()
            .connection_timeout(db_config.connection_timeout())
            .error_handler(Box::new(LoggingErrorHandler { log: log.clone() }));
        let pool = if db_config.url.is_memory() {
            builder
                .max_size(1)
                .min_idle(Some(1))
                .max_lifetime(None)
                .idle_timeout(None)
                .test_on_check_out(false)
                .build(manager)
                .map_err(|e| {
                    Error::internal_error(&format!(
                        "failed to open in-memory database: {}",
                        e
                    ))
                })?
        } else {
            builder.max_size(db_config.pool_size).build_unchecked(manager)
        };
        Ok(Pool { log, dialect: db_config.url.dialect(), pool })
    }

    /// Creates a pool for a fresh, private, in-memory database.
    pub fn new_in_memory(log: &Logger) -> Result<Self, Error> {
        Self::new(log, &DbConfig::in_memory())
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Runs `f` with a pooled connection on the blocking thread pool.
    ///
    /// Failing to check out a connection in time is reported as
    /// [`Error::ServiceUnavailable`].
    pub async fn run<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut DbConnection) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| {
                Error::unavail(&format!(
                    "Failed to access connection pool: {}",
                    e
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            Error::internal_error(&format!("database task failed: {}", e))
        })?
    }

    /// Applies the schema for this pool's dialect.  The schema is
    /// idempotent.
    pub async fn apply_schema(&self) -> Result<(), Error> {
        let schema = self.dialect.schema().into_owned();
        debug!(&self.log, "applying schema"; "dialect" => %self.dialect);
        self.run(move |conn| {
            conn.batch_execute(&schema).map_err(|e| {
                Error::internal_error(&format!("failed to apply schema: {}", e))
            })
        })
        .await
    }
}

#[derive(Debug)]
struct LoggingErrorHandler {
    log: Logger,
}

impl r2d2::HandleError<super::pool_connection::ConnectError>
    for LoggingErrorHandler
{
    fn handle_error(&self, error: super::pool_connection::ConnectError) {
        error!(
            &self.log,
            "database connection error";
            "error_message" => #%error
        );
    }
}
