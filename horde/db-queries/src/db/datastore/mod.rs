// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary control plane interface for database read and write operations

// TODO-scalability review every place where a queryable set of items is
// returned and decide whether paging belongs in the store or the caller.

use super::error::TransactionError;
use super::pool::Pool;
use super::pool_connection::DbConnection;
use diesel::Connection;
use horde_common::api::external::Error;
use horde_common::api::external::LookupType;
use horde_common::api::external::ResourceType;
use horde_db_model::schema::Dialect;
use slog::Logger;
use std::sync::Arc;

mod apn;
mod authz;
mod collection;
mod device;
mod firmware;
mod invite;
mod output;
mod sequence;
mod tags;
mod team;
mod token;
mod user;

pub use apn::ApnStore;
pub use collection::CollectionStore;
pub use device::DeviceStore;
pub use firmware::FirmwareStore;
pub use invite::InviteStore;
pub use output::OutputStore;
pub use sequence::SequenceStore;
pub use tags::TagStore;
pub use tags::TagTarget;
pub use team::TeamStore;
pub use token::TokenStore;
pub use user::UserStore;

pub(crate) use collection::insert_collection_row;
pub(crate) use collection::SELECT_ALL_COLLECTIONS;
pub(crate) use device::insert_device_lookup_row;
pub(crate) use device::insert_device_row;
pub(crate) use device::SELECT_ALL_DEVICES;
pub(crate) use device::SELECT_ALL_DEVICE_LOOKUPS;
pub(crate) use firmware::insert_firmware_row;
pub(crate) use firmware::SELECT_ALL_FIRMWARE;
pub(crate) use invite::insert_invite_row;
pub(crate) use invite::SELECT_ALL_INVITES;
pub(crate) use output::insert_output_row;
pub(crate) use output::SELECT_ALL_OUTPUTS;
pub(crate) use team::insert_member_row;
pub(crate) use team::insert_team_row;
pub(crate) use team::SELECT_ALL_MEMBERS;
pub(crate) use team::SELECT_ALL_TEAMS;
pub(crate) use token::insert_token_row;
pub(crate) use token::SELECT_ALL_TOKENS;
pub(crate) use user::insert_user_row;
pub(crate) use user::SELECT_ALL_USERS;

/// The entity API shared by the persistent store, the in-memory mirror, and
/// the write-through facade composing them.
///
/// Mutating operations on team-owned entities take the acting user's key and
/// enforce the authorization rules: reads require membership of the owning
/// team, writes require the admin role.  Objects the acting user cannot see
/// are reported as not found.
pub trait DataStore:
    UserStore
    + TokenStore
    + TeamStore
    + InviteStore
    + CollectionStore
    + DeviceStore
    + OutputStore
    + FirmwareStore
    + TagStore
{
}

impl<T> DataStore for T where
    T: UserStore
        + TokenStore
        + TeamStore
        + InviteStore
        + CollectionStore
        + DeviceStore
        + OutputStore
        + FirmwareStore
        + TagStore
{
}

/// SQL implementation of the stores, for either dialect
///
/// The persistent store and the in-memory mirror are both `SqlStore`s; they
/// differ only in the database their pool connects to.
pub struct SqlStore {
    log: Logger,
    pool: Arc<Pool>,
}

impl SqlStore {
    /// Creates a store over `pool`, applying the schema first.
    pub async fn new(log: &Logger, pool: Arc<Pool>) -> Result<Self, Error> {
        let log = log.new(o!(
            "component" => "datastore",
            "dialect" => pool.dialect().to_string(),
        ));
        pool.apply_schema().await?;
        Ok(SqlStore { log, pool })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.pool.dialect()
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Runs `f` inside one SQL transaction on a pooled connection.
    ///
    /// Any error rolls the transaction back.  Database errors are translated
    /// with `resource_type` and `lookup_type` describing the object the
    /// operation is about; internal errors are logged here.
    pub(crate) async fn transaction<T, F>(
        &self,
        resource_type: ResourceType,
        lookup_type: LookupType,
        f: F,
    ) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut DbConnection) -> Result<T, TransactionError>
            + Send
            + 'static,
    {
        let result = self
            .pool
            .run(move |conn| {
                conn.transaction(f)
                    .map_err(|e| e.into_public(resource_type, lookup_type))
            })
            .await;
        if let Err(Error::InternalError { internal_message }) = &result {
            error!(
                &self.log,
                "database operation failed";
                "resource_type" => %resource_type,
                "error" => internal_message,
            );
        }
        result
    }
}

/// Helpers for row counts reported by `execute`.
pub(crate) trait ExpectRows {
    /// Fails with `err` when no row was affected.
    fn or_not_found(self, err: Error) -> Result<(), TransactionError>;
}

impl ExpectRows for usize {
    fn or_not_found(self, err: Error) -> Result<(), TransactionError> {
        if self == 0 {
            Err(TransactionError::Custom(err))
        } else {
            Ok(())
        }
    }
}
