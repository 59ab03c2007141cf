// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Write-through store
//!
//! [`WriteThroughStore`] composes a persistent store with an in-memory
//! mirror holding a copy of the entity tables.  Writes go to the persistent
//! store first and, only once they succeed there, are repeated against the
//! mirror with the same arguments.  Reads are answered by the mirror.
//!
//! Both stores run the same authorization and integrity checks on the same
//! data, so a write accepted by the persistent store must be accepted by the
//! mirror too.  If it is not, the tiers have diverged and nothing read from
//! the mirror can be trusted any more: the facade logs the failure and
//! panics.

use super::datastore::insert_collection_row;
use super::datastore::insert_device_lookup_row;
use super::datastore::insert_device_row;
use super::datastore::insert_firmware_row;
use super::datastore::insert_invite_row;
use super::datastore::insert_member_row;
use super::datastore::insert_output_row;
use super::datastore::insert_team_row;
use super::datastore::insert_token_row;
use super::datastore::insert_user_row;
use super::datastore::CollectionStore;
use super::datastore::DataStore;
use super::datastore::DeviceStore;
use super::datastore::FirmwareStore;
use super::datastore::InviteStore;
use super::datastore::OutputStore;
use super::datastore::SequenceStore;
use super::datastore::TagStore;
use super::datastore::TagTarget;
use super::datastore::TeamStore;
use super::datastore::TokenStore;
use super::datastore::UserStore;
use super::datastore::SELECT_ALL_COLLECTIONS;
use super::datastore::SELECT_ALL_DEVICES;
use super::datastore::SELECT_ALL_DEVICE_LOOKUPS;
use super::datastore::SELECT_ALL_FIRMWARE;
use super::datastore::SELECT_ALL_INVITES;
use super::datastore::SELECT_ALL_MEMBERS;
use super::datastore::SELECT_ALL_OUTPUTS;
use super::datastore::SELECT_ALL_TEAMS;
use super::datastore::SELECT_ALL_TOKENS;
use super::datastore::SELECT_ALL_USERS;
use super::keygen::KeyGenerators;
use super::pool_connection::sql;
use super::pool_connection::DbConnection;
use super::Pool;
use super::SqlStore;
use async_trait::async_trait;
use diesel::query_builder::SqlQuery;
use diesel::query_dsl::LoadQuery;
use diesel::result::Error as DieselError;
use diesel::Connection;
use diesel::QueryResult;
use diesel::RunQueryDsl;
use horde_common::api::external::CreateResult;
use horde_common::api::external::DeleteResult;
use horde_common::api::external::Error;
use horde_common::api::external::ListResultVec;
use horde_common::api::external::LookupResult;
use horde_common::api::external::UpdateResult;
use horde_common::key::Key;
use horde_common::key::KeyKind;
use horde_common::key::KeyOrigin;
use horde_db_model::AuthType;
use horde_db_model::Collection;
use horde_db_model::Device;
use horde_db_model::Firmware;
use horde_db_model::FirmwareUse;
use horde_db_model::Invite;
use horde_db_model::Output;
use horde_db_model::RoleId;
use horde_db_model::Tags;
use horde_db_model::Team;
use horde_db_model::Token;
use horde_db_model::User;
use slog::Logger;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;

/// Copies every row of the cached tables from `persistent` into `memory`.
///
/// Tables are copied in foreign key order, each in one transaction on the
/// mirror.  Message queues, APN configuration, allocations and sequences are
/// not cached.  Nothing is written to `persistent`.
pub async fn prime(
    log: &Logger,
    persistent: &SqlStore,
    memory: &SqlStore,
) -> Result<(), Error> {
    let from = persistent.pool();
    let to = memory.pool();
    copy_table(log, from, to, "team", SELECT_ALL_TEAMS, insert_team_row)
        .await?;
    copy_table(log, from, to, "hordeuser", SELECT_ALL_USERS, insert_user_row)
        .await?;
    copy_table(log, from, to, "member", SELECT_ALL_MEMBERS, insert_member_row)
        .await?;
    copy_table(log, from, to, "token", SELECT_ALL_TOKENS, insert_token_row)
        .await?;
    copy_table(log, from, to, "invite", SELECT_ALL_INVITES, insert_invite_row)
        .await?;
    copy_table(
        log,
        from,
        to,
        "collection",
        SELECT_ALL_COLLECTIONS,
        insert_collection_row,
    )
    .await?;
    copy_table(
        log,
        from,
        to,
        "firmware",
        SELECT_ALL_FIRMWARE,
        insert_firmware_row,
    )
    .await?;
    copy_table(log, from, to, "device", SELECT_ALL_DEVICES, insert_device_row)
        .await?;
    copy_table(
        log,
        from,
        to,
        "device_lookup",
        SELECT_ALL_DEVICE_LOOKUPS,
        insert_device_lookup_row,
    )
    .await?;
    copy_table(log, from, to, "output", SELECT_ALL_OUTPUTS, insert_output_row)
        .await?;
    Ok(())
}

async fn copy_table<R>(
    log: &Logger,
    from: &Pool,
    to: &Pool,
    table: &'static str,
    select: &'static str,
    insert: fn(&mut DbConnection, &R) -> QueryResult<usize>,
) -> Result<(), Error>
where
    R: Send + 'static,
    for<'a> SqlQuery: LoadQuery<'a, DbConnection, R>,
{
    let rows = from
        .run(move |conn| {
            sql(conn, select)
                .load::<R>(conn)
                .map_err(|e| Error::internal_error(&e.to_string()))
        })
        .await
        .map_err(|e| e.internal_context(format!("reading {}", table)))?;
    let count = rows.len();
    to.run(move |conn| {
        conn.transaction(|conn| {
            for row in &rows {
                insert(conn, row)?;
            }
            Ok::<_, DieselError>(())
        })
        .map_err(|e| Error::internal_error(&e.to_string()))
    })
    .await
    .map_err(|e| e.internal_context(format!("priming {}", table)))?;
    debug!(log, "primed table"; "table" => table, "rows" => count);
    Ok(())
}

/// A [`DataStore`] writing through a persistent store `P` to a mirror `M`
/// that answers reads
pub struct WriteThroughStore<P, M> {
    log: Logger,
    persistent: Arc<P>,
    memory: Arc<M>,
    keys: KeyGenerators,
    /// Held for the duration of every call when the persistent store cannot
    /// take concurrent writers.
    serial: Option<Mutex<()>>,
}

impl WriteThroughStore<SqlStore, SqlStore> {
    /// Opens a facade over `persistent` with a fresh in-memory mirror primed
    /// from it.  Keys are minted for `origin` from `persistent`'s sequences.
    pub async fn open(
        log: &Logger,
        persistent: Arc<SqlStore>,
        origin: KeyOrigin,
        block_size: u64,
    ) -> Result<Self, Error> {
        let memory_pool = Arc::new(Pool::new_in_memory(log)?);
        let memory = Arc::new(SqlStore::new(log, memory_pool).await?);
        prime(log, &persistent, &memory).await?;
        let keys =
            KeyGenerators::new(log, origin, block_size, persistent.clone());
        let serialize = persistent.dialect().serialized();
        Ok(WriteThroughStore::new(log, persistent, memory, keys, serialize))
    }
}

impl<P, M> WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    /// Composes two stores holding the same data.  With `serialize`, calls
    /// run one at a time.
    pub fn new(
        log: &Logger,
        persistent: Arc<P>,
        memory: Arc<M>,
        keys: KeyGenerators,
        serialize: bool,
    ) -> Self {
        let log = log.new(o!("component" => "WriteThroughStore"));
        info!(&log, "write-through store ready"; "serialized" => serialize);
        WriteThroughStore {
            log,
            persistent,
            memory,
            keys,
            serial: serialize.then(|| Mutex::new(())),
        }
    }

    pub fn persistent(&self) -> &Arc<P> {
        &self.persistent
    }

    pub fn memory(&self) -> &Arc<M> {
        &self.memory
    }

    /// Returns a new key of the given kind.
    pub async fn new_id(&self, kind: KeyKind) -> Key {
        self.keys.new_id(kind).await
    }

    async fn serialize(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.serial {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    /// Checks the result of repeating a write against the mirror.
    ///
    /// # Panics
    ///
    /// Panics if the mirror rejected a write the persistent store accepted.
    fn mirrored<T>(&self, operation: &'static str, result: Result<T, Error>) {
        if let Err(error) = result {
            crit!(
                &self.log,
                "memory store diverged from persistent store";
                "operation" => operation,
                "error" => %error,
            );
            panic!(
                "memory store diverged from persistent store in {}: {}",
                operation, error
            );
        }
    }
}

#[async_trait]
impl<P, M> SequenceStore for WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    async fn current_sequence(&self, name: &str) -> LookupResult<i64> {
        let _guard = self.serialize().await;
        self.persistent.current_sequence(name).await
    }

    async fn allocate_sequence(
        &self,
        name: &str,
        expected: i64,
        new_value: i64,
    ) -> Result<bool, Error> {
        let _guard = self.serialize().await;
        self.persistent.allocate_sequence(name, expected, new_value).await
    }
}

#[async_trait]
impl<P, M> UserStore for WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    async fn create_user(
        &self,
        user: &User,
        private_team: &Team,
    ) -> CreateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.create_user(user, private_team).await?;
        self.mirrored(
            "create_user",
            self.memory.create_user(user, private_team).await,
        );
        Ok(())
    }

    async fn retrieve_user(&self, user_id: Key) -> LookupResult<User> {
        let _guard = self.serialize().await;
        self.memory.retrieve_user(user_id).await
    }

    async fn retrieve_user_by_external_id(
        &self,
        auth_type: AuthType,
        external_id: &str,
    ) -> LookupResult<User> {
        let _guard = self.serialize().await;
        self.memory.retrieve_user_by_external_id(auth_type, external_id).await
    }

    async fn update_user(&self, user: &User) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.update_user(user).await?;
        self.mirrored("update_user", self.memory.update_user(user).await);
        Ok(())
    }
}

#[async_trait]
impl<P, M> TokenStore for WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    async fn create_token(&self, token: &Token) -> CreateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.create_token(token).await?;
        self.mirrored("create_token", self.memory.create_token(token).await);
        Ok(())
    }

    async fn retrieve_token(&self, token: &str) -> LookupResult<Token> {
        let _guard = self.serialize().await;
        self.memory.retrieve_token(token).await
    }

    async fn list_tokens(&self, user_id: Key) -> ListResultVec<Token> {
        let _guard = self.serialize().await;
        self.memory.list_tokens(user_id).await
    }

    async fn update_token(
        &self,
        user_id: Key,
        token: &Token,
    ) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.update_token(user_id, token).await?;
        self.mirrored(
            "update_token",
            self.memory.update_token(user_id, token).await,
        );
        Ok(())
    }

    async fn delete_token(&self, user_id: Key, token: &str) -> DeleteResult {
        let _guard = self.serialize().await;
        self.persistent.delete_token(user_id, token).await?;
        self.mirrored(
            "delete_token",
            self.memory.delete_token(user_id, token).await,
        );
        Ok(())
    }
}

#[async_trait]
impl<P, M> TeamStore for WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    async fn create_team(&self, user_id: Key, team: &Team) -> CreateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.create_team(user_id, team).await?;
        self.mirrored(
            "create_team",
            self.memory.create_team(user_id, team).await,
        );
        Ok(())
    }

    async fn retrieve_team(
        &self,
        user_id: Key,
        team_id: Key,
    ) -> LookupResult<Team> {
        let _guard = self.serialize().await;
        self.memory.retrieve_team(user_id, team_id).await
    }

    async fn list_teams(&self, user_id: Key) -> ListResultVec<Team> {
        let _guard = self.serialize().await;
        self.memory.list_teams(user_id).await
    }

    async fn update_team(&self, user_id: Key, team: &Team) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.update_team(user_id, team).await?;
        self.mirrored(
            "update_team",
            self.memory.update_team(user_id, team).await,
        );
        Ok(())
    }

    async fn delete_team(&self, user_id: Key, team_id: Key) -> DeleteResult {
        let _guard = self.serialize().await;
        self.persistent.delete_team(user_id, team_id).await?;
        self.mirrored(
            "delete_team",
            self.memory.delete_team(user_id, team_id).await,
        );
        Ok(())
    }

    async fn update_member_role(
        &self,
        user_id: Key,
        team_id: Key,
        member_id: Key,
        role: RoleId,
    ) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent
            .update_member_role(user_id, team_id, member_id, role)
            .await?;
        self.mirrored(
            "update_member_role",
            self.memory
                .update_member_role(user_id, team_id, member_id, role)
                .await,
        );
        Ok(())
    }

    async fn remove_member(
        &self,
        user_id: Key,
        team_id: Key,
        member_id: Key,
    ) -> DeleteResult {
        let _guard = self.serialize().await;
        self.persistent.remove_member(user_id, team_id, member_id).await?;
        self.mirrored(
            "remove_member",
            self.memory.remove_member(user_id, team_id, member_id).await,
        );
        Ok(())
    }
}

#[async_trait]
impl<P, M> InviteStore for WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    async fn create_invite(&self, invite: &Invite) -> CreateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.create_invite(invite).await?;
        self.mirrored("create_invite", self.memory.create_invite(invite).await);
        Ok(())
    }

    async fn retrieve_invite(&self, code: &str) -> LookupResult<Invite> {
        let _guard = self.serialize().await;
        self.memory.retrieve_invite(code).await
    }

    async fn list_invites(
        &self,
        user_id: Key,
        team_id: Key,
    ) -> ListResultVec<Invite> {
        let _guard = self.serialize().await;
        self.memory.list_invites(user_id, team_id).await
    }

    async fn delete_invite(&self, user_id: Key, code: &str) -> DeleteResult {
        let _guard = self.serialize().await;
        self.persistent.delete_invite(user_id, code).await?;
        self.mirrored(
            "delete_invite",
            self.memory.delete_invite(user_id, code).await,
        );
        Ok(())
    }

    async fn accept_invite(&self, user_id: Key, code: &str) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.accept_invite(user_id, code).await?;
        self.mirrored(
            "accept_invite",
            self.memory.accept_invite(user_id, code).await,
        );
        Ok(())
    }
}

#[async_trait]
impl<P, M> CollectionStore for WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    async fn create_collection(
        &self,
        user_id: Key,
        collection: &Collection,
    ) -> CreateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.create_collection(user_id, collection).await?;
        self.mirrored(
            "create_collection",
            self.memory.create_collection(user_id, collection).await,
        );
        Ok(())
    }

    async fn retrieve_collection(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> LookupResult<Collection> {
        let _guard = self.serialize().await;
        self.memory.retrieve_collection(user_id, collection_id).await
    }

    async fn list_collections(
        &self,
        user_id: Key,
    ) -> ListResultVec<Collection> {
        let _guard = self.serialize().await;
        self.memory.list_collections(user_id).await
    }

    async fn update_collection(
        &self,
        user_id: Key,
        collection: &Collection,
    ) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.update_collection(user_id, collection).await?;
        self.mirrored(
            "update_collection",
            self.memory.update_collection(user_id, collection).await,
        );
        Ok(())
    }

    async fn delete_collection(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> DeleteResult {
        let _guard = self.serialize().await;
        self.persistent.delete_collection(user_id, collection_id).await?;
        self.mirrored(
            "delete_collection",
            self.memory.delete_collection(user_id, collection_id).await,
        );
        Ok(())
    }
}

#[async_trait]
impl<P, M> DeviceStore for WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    async fn create_device(
        &self,
        user_id: Key,
        device: &Device,
    ) -> CreateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.create_device(user_id, device).await?;
        self.mirrored(
            "create_device",
            self.memory.create_device(user_id, device).await,
        );
        Ok(())
    }

    async fn retrieve_device(
        &self,
        user_id: Key,
        collection_id: Key,
        device_id: Key,
    ) -> LookupResult<Device> {
        let _guard = self.serialize().await;
        self.memory.retrieve_device(user_id, collection_id, device_id).await
    }

    async fn retrieve_device_by_imsi(&self, imsi: i64) -> LookupResult<Device> {
        let _guard = self.serialize().await;
        self.memory.retrieve_device_by_imsi(imsi).await
    }

    async fn list_devices(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> ListResultVec<Device> {
        let _guard = self.serialize().await;
        self.memory.list_devices(user_id, collection_id).await
    }

    async fn update_device(
        &self,
        user_id: Key,
        collection_id: Key,
        device: &Device,
    ) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.update_device(user_id, collection_id, device).await?;
        self.mirrored(
            "update_device",
            self.memory.update_device(user_id, collection_id, device).await,
        );
        Ok(())
    }

    async fn delete_device(
        &self,
        user_id: Key,
        collection_id: Key,
        device_id: Key,
    ) -> DeleteResult {
        let _guard = self.serialize().await;
        self.persistent
            .delete_device(user_id, collection_id, device_id)
            .await?;
        self.mirrored(
            "delete_device",
            self.memory.delete_device(user_id, collection_id, device_id).await,
        );
        Ok(())
    }

    async fn update_device_metadata(
        &self,
        device: &Device,
    ) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.update_device_metadata(device).await?;
        self.mirrored(
            "update_device_metadata",
            self.memory.update_device_metadata(device).await,
        );
        Ok(())
    }
}

#[async_trait]
impl<P, M> OutputStore for WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    async fn create_output(
        &self,
        user_id: Key,
        output: &Output,
    ) -> CreateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.create_output(user_id, output).await?;
        self.mirrored(
            "create_output",
            self.memory.create_output(user_id, output).await,
        );
        Ok(())
    }

    async fn retrieve_output(
        &self,
        user_id: Key,
        collection_id: Key,
        output_id: Key,
    ) -> LookupResult<Output> {
        let _guard = self.serialize().await;
        self.memory.retrieve_output(user_id, collection_id, output_id).await
    }

    async fn list_outputs(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> ListResultVec<Output> {
        let _guard = self.serialize().await;
        self.memory.list_outputs(user_id, collection_id).await
    }

    async fn update_output(
        &self,
        user_id: Key,
        collection_id: Key,
        output: &Output,
    ) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.update_output(user_id, collection_id, output).await?;
        self.mirrored(
            "update_output",
            self.memory.update_output(user_id, collection_id, output).await,
        );
        Ok(())
    }

    async fn delete_output(
        &self,
        user_id: Key,
        collection_id: Key,
        output_id: Key,
    ) -> DeleteResult {
        let _guard = self.serialize().await;
        self.persistent
            .delete_output(user_id, collection_id, output_id)
            .await?;
        self.mirrored(
            "delete_output",
            self.memory.delete_output(user_id, collection_id, output_id).await,
        );
        Ok(())
    }

    async fn list_all_outputs(&self) -> ListResultVec<Output> {
        let _guard = self.serialize().await;
        self.memory.list_all_outputs().await
    }
}

#[async_trait]
impl<P, M> FirmwareStore for WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    async fn create_firmware(
        &self,
        user_id: Key,
        firmware: &Firmware,
    ) -> CreateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.create_firmware(user_id, firmware).await?;
        self.mirrored(
            "create_firmware",
            self.memory.create_firmware(user_id, firmware).await,
        );
        Ok(())
    }

    async fn retrieve_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware_id: Key,
    ) -> LookupResult<Firmware> {
        let _guard = self.serialize().await;
        self.memory
            .retrieve_firmware(user_id, collection_id, firmware_id)
            .await
    }

    async fn retrieve_firmware_by_version(
        &self,
        user_id: Key,
        collection_id: Key,
        version: &str,
    ) -> LookupResult<Firmware> {
        let _guard = self.serialize().await;
        self.memory
            .retrieve_firmware_by_version(user_id, collection_id, version)
            .await
    }

    async fn list_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> ListResultVec<Firmware> {
        let _guard = self.serialize().await;
        self.memory.list_firmware(user_id, collection_id).await
    }

    async fn update_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware: &Firmware,
    ) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent
            .update_firmware(user_id, collection_id, firmware)
            .await?;
        self.mirrored(
            "update_firmware",
            self.memory.update_firmware(user_id, collection_id, firmware).await,
        );
        Ok(())
    }

    async fn delete_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware_id: Key,
    ) -> DeleteResult {
        let _guard = self.serialize().await;
        self.persistent
            .delete_firmware(user_id, collection_id, firmware_id)
            .await?;
        self.mirrored(
            "delete_firmware",
            self.memory
                .delete_firmware(user_id, collection_id, firmware_id)
                .await,
        );
        Ok(())
    }

    async fn retrieve_firmware_in_use(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware_id: Key,
    ) -> LookupResult<FirmwareUse> {
        let _guard = self.serialize().await;
        self.memory
            .retrieve_firmware_in_use(user_id, collection_id, firmware_id)
            .await
    }
}

#[async_trait]
impl<P, M> TagStore for WriteThroughStore<P, M>
where
    P: DataStore + SequenceStore,
    M: DataStore,
{
    async fn update_tag(
        &self,
        user_id: Key,
        target: &TagTarget,
        key: &str,
        value: &str,
    ) -> UpdateResult<()> {
        let _guard = self.serialize().await;
        self.persistent.update_tag(user_id, target, key, value).await?;
        self.mirrored(
            "update_tag",
            self.memory.update_tag(user_id, target, key, value).await,
        );
        Ok(())
    }

    async fn retrieve_tag(
        &self,
        user_id: Key,
        target: &TagTarget,
        key: &str,
    ) -> LookupResult<String> {
        let _guard = self.serialize().await;
        self.memory.retrieve_tag(user_id, target, key).await
    }

    async fn retrieve_tags(
        &self,
        user_id: Key,
        target: &TagTarget,
    ) -> LookupResult<Tags> {
        let _guard = self.serialize().await;
        self.memory.retrieve_tags(user_id, target).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::pub_test_utils::fixtures;
    use crate::db::pub_test_utils::TestDatabase;
    use assert_matches::assert_matches;
    use horde_common::api::external::ResourceType;
    use horde_db_model::CollectionFirmware;
    use horde_db_model::FieldMask;
    use horde_test_utils::dev;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn open(
        log: &Logger,
        db: &TestDatabase,
    ) -> WriteThroughStore<SqlStore, SqlStore> {
        WriteThroughStore::open(
            log,
            db.store().clone(),
            KeyOrigin::new(1, 2).unwrap(),
            5,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_priming_copies_persistent_state() {
        let logctx = dev::test_setup_log("test_priming_copies_persistent_state");
        let db = TestDatabase::new(&logctx.log).await;
        let p = db.store();

        let (admin, private_team) = fixtures::user(&db, "admin").await;
        let (member, _) = fixtures::user(&db, "member").await;
        let team = fixtures::team(&db, admin.user_id).await;
        fixtures::join(&db, admin.user_id, team.team_id, member.user_id).await;
        fixtures::invite(&db, admin.user_id, team.team_id, "pending").await;
        fixtures::token(&db, admin.user_id, "secret").await;
        let collection =
            fixtures::collection(&db, admin.user_id, team.team_id).await;
        let cid = collection.collection_id;
        let firmware =
            fixtures::firmware(&db, admin.user_id, cid, "1.0.0", "aa").await;
        let mut device =
            fixtures::device_model(&db, cid, 242_016_000_000_001).await;
        device.firmware.current_id = firmware.firmware_id;
        p.create_device(admin.user_id, &device).await.unwrap();
        let output = Output {
            output_id: db.new_id(KeyKind::Output).await,
            collection_id: cid,
            output_type: String::from("webhook"),
            config: json!({ "url": "http://localhost" })
                .as_object()
                .unwrap()
                .clone(),
            enabled: true,
            tags: Tags::new(),
        };
        p.create_output(admin.user_id, &output).await.unwrap();

        let store = open(&logctx.log, &db).await;
        let m = store.memory();
        assert_eq!(
            m.list_teams(admin.user_id).await.unwrap(),
            p.list_teams(admin.user_id).await.unwrap()
        );
        assert_eq!(m.list_teams(admin.user_id).await.unwrap().len(), 2);
        assert_eq!(
            m.retrieve_team(admin.user_id, private_team.team_id)
                .await
                .unwrap(),
            private_team
        );
        assert_eq!(m.retrieve_user(member.user_id).await.unwrap(), member);
        assert_eq!(
            m.list_tokens(admin.user_id).await.unwrap(),
            p.list_tokens(admin.user_id).await.unwrap()
        );
        assert_eq!(
            m.list_invites(admin.user_id, team.team_id).await.unwrap(),
            p.list_invites(admin.user_id, team.team_id).await.unwrap()
        );
        assert_eq!(
            m.list_collections(member.user_id).await.unwrap(),
            [collection]
        );
        assert_eq!(
            m.list_firmware(member.user_id, cid).await.unwrap(),
            [firmware]
        );
        assert_eq!(
            m.list_devices(member.user_id, cid).await.unwrap(),
            [device.clone()]
        );
        assert_eq!(m.retrieve_device_by_imsi(device.imsi).await.unwrap(), device);
        assert_eq!(m.list_all_outputs().await.unwrap(), [output]);

        // The facade reads from the mirror.
        assert_eq!(store.retrieve_user(admin.user_id).await.unwrap(), admin);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_writes_reach_both_tiers() {
        let logctx = dev::test_setup_log("test_writes_reach_both_tiers");
        let db = TestDatabase::new(&logctx.log).await;
        let store = open(&logctx.log, &db).await;
        let p = store.persistent();
        let m = store.memory();

        let (admin, admin_team) = fixtures::user_models(&db, "admin").await;
        store.create_user(&admin, &admin_team).await.unwrap();
        let (other, other_team) = fixtures::user_models(&db, "other").await;
        store.create_user(&other, &other_team).await.unwrap();
        assert_eq!(p.retrieve_user(admin.user_id).await.unwrap(), admin);
        assert_eq!(m.retrieve_user(admin.user_id).await.unwrap(), admin);

        let collection = Collection {
            collection_id: store.new_id(KeyKind::Collection).await,
            team_id: admin_team.team_id,
            field_mask: FieldMask::all(),
            firmware: CollectionFirmware::default(),
            tags: Tags::new(),
        };
        let cid = collection.collection_id;
        store.create_collection(admin.user_id, &collection).await.unwrap();
        assert_eq!(
            p.retrieve_collection(admin.user_id, cid).await.unwrap(),
            collection
        );
        assert_eq!(
            m.retrieve_collection(admin.user_id, cid).await.unwrap(),
            collection
        );

        // A write the persistent store rejects never reaches the mirror.
        let mut stolen = collection.clone();
        stolen.team_id = other_team.team_id;
        assert_matches!(
            store.update_collection(other.user_id, &stolen).await,
            Err(Error::ObjectNotFound {
                type_name: ResourceType::Collection,
                ..
            })
        );
        let duplicate = Collection {
            collection_id: store.new_id(KeyKind::Collection).await,
            ..collection.clone()
        };
        assert_matches!(
            store.create_collection(other.user_id, &duplicate).await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Team, .. })
        );
        assert_eq!(m.list_collections(admin.user_id).await.unwrap(), [
            collection.clone()
        ]);
        assert!(m.list_collections(other.user_id).await.unwrap().is_empty());

        let target = TagTarget::Collection(cid);
        store
            .update_tag(admin.user_id, &target, "Name", " meters ")
            .await
            .unwrap();
        assert_eq!(
            p.retrieve_tag(admin.user_id, &target, "name").await.unwrap(),
            "meters"
        );
        assert_eq!(
            store.retrieve_tag(admin.user_id, &target, "name").await.unwrap(),
            "meters"
        );

        store.delete_collection(admin.user_id, cid).await.unwrap();
        for tier in [p, m] {
            assert_matches!(
                tier.retrieve_collection(admin.user_id, cid).await,
                Err(Error::ObjectNotFound { .. })
            );
        }
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_sequences_come_from_persistent_store() {
        let logctx =
            dev::test_setup_log("test_sequences_come_from_persistent_store");
        let db = TestDatabase::new(&logctx.log).await;
        let store = open(&logctx.log, &db).await;

        let key = store.new_id(KeyKind::Message).await;
        assert_eq!(key.origin(), KeyOrigin::new(1, 2).unwrap());
        assert_eq!(key.sequence(), 1);
        assert_eq!(store.current_sequence("message/1/2").await.unwrap(), 6);
        assert_eq!(
            db.store().current_sequence("message/1/2").await.unwrap(),
            6
        );
        assert_matches!(
            store.memory().current_sequence("message/1/2").await,
            Err(Error::ObjectNotFound { .. })
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    #[should_panic(expected = "memory store diverged")]
    async fn test_divergence_panics() {
        let logctx = dev::test_setup_log("test_divergence_panics");
        let db = TestDatabase::new(&logctx.log).await;
        let store = open(&logctx.log, &db).await;

        // Only the mirror knows this user, so the persistent store accepts
        // the create and the mirror rejects it.
        let (user, team) = fixtures::user_models(&db, "ghost").await;
        store.memory().create_user(&user, &team).await.unwrap();
        let _ = store.create_user(&user, &team).await;
    }
}
