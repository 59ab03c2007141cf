// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for working with the Horde database

mod config;
// This is marked public for use by other crates' tests and by the
// application builder.
pub mod datastore;
pub mod downstream;
pub mod error;
pub mod keygen;
mod pool;
mod pool_connection;
pub mod write_through;

#[cfg(any(test, feature = "testing"))]
pub mod pub_test_utils;

pub use horde_db_model as model;

pub use config::Config;
pub use config::DbUrl;
pub use datastore::DataStore;
pub use datastore::SqlStore;
pub use pool::Pool;
pub use pool_connection::DbConnection;
