// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authorization checks, run inside the transaction of the operation they
//! guard
//!
//! A user who is not a member of the owning team gets "not found" for the
//! object, whether or not it exists.  A plain member attempting an admin
//! operation gets "access denied".

use crate::db::error::TransactionError;
use crate::db::pool_connection::sql;
use crate::db::pool_connection::DbConnection;
use diesel::sql_types::BigInt;
use diesel::sql_types::Integer;
use diesel::OptionalExtension;
use diesel::QueryableByName;
use diesel::RunQueryDsl;
use horde_common::api::external::Error;
use horde_common::api::external::ResourceType;
use horde_common::key::Key;
use horde_db_model::RoleId;

#[derive(QueryableByName)]
struct RoleRow {
    #[diesel(sql_type = Integer)]
    role_id: i32,
}

#[derive(QueryableByName)]
struct CollectionRoleRow {
    #[diesel(sql_type = BigInt)]
    team_id: i64,
    #[diesel(sql_type = Integer)]
    role_id: i32,
}

/// Returns the role of `user_id` in `team_id`, if the user is a member.
pub(crate) fn team_role(
    conn: &mut DbConnection,
    user_id: Key,
    team_id: Key,
) -> Result<Option<RoleId>, TransactionError> {
    let row = sql(
        conn,
        "SELECT role_id FROM member WHERE user_id = $1 AND team_id = $2",
    )
    .bind::<BigInt, _>(user_id.as_i64())
    .bind::<BigInt, _>(team_id.as_i64())
    .get_result::<RoleRow>(conn)
    .optional()?;
    Ok(row.map(|r| RoleId::try_from(r.role_id)).transpose()?)
}

/// Requires `user_id` to be a member of `team_id`.
pub(crate) fn require_team_member(
    conn: &mut DbConnection,
    user_id: Key,
    team_id: Key,
) -> Result<RoleId, TransactionError> {
    team_role(conn, user_id, team_id)?.ok_or_else(|| {
        Error::not_found_by_id(ResourceType::Team, team_id).into()
    })
}

/// Requires `user_id` to be an admin of `team_id`.
pub(crate) fn require_team_admin(
    conn: &mut DbConnection,
    user_id: Key,
    team_id: Key,
) -> Result<(), TransactionError> {
    match require_team_member(conn, user_id, team_id)? {
        RoleId::Admin => Ok(()),
        RoleId::Member => {
            Err(Error::access_denied_by_id(ResourceType::Team, team_id).into())
        }
    }
}

/// Returns the owning team of `collection_id` and the role of `user_id` in
/// it, if the collection exists and the user is a member of its team.
fn collection_role(
    conn: &mut DbConnection,
    user_id: Key,
    collection_id: Key,
) -> Result<Option<(Key, RoleId)>, TransactionError> {
    let row = sql(
        conn,
        "SELECT c.team_id AS team_id, m.role_id AS role_id \
         FROM collection c JOIN member m ON m.team_id = c.team_id \
         WHERE c.collection_id = $1 AND m.user_id = $2",
    )
    .bind::<BigInt, _>(collection_id.as_i64())
    .bind::<BigInt, _>(user_id.as_i64())
    .get_result::<CollectionRoleRow>(conn)
    .optional()?;
    match row {
        None => Ok(None),
        Some(row) => Ok(Some((
            Key::from_i64(row.team_id),
            RoleId::try_from(row.role_id)?,
        ))),
    }
}

/// Requires `user_id` to be able to read `collection_id`, returning the
/// collection's team.
pub(crate) fn require_collection_member(
    conn: &mut DbConnection,
    user_id: Key,
    collection_id: Key,
) -> Result<Key, TransactionError> {
    collection_role(conn, user_id, collection_id)?
        .map(|(team_id, _)| team_id)
        .ok_or_else(|| {
            Error::not_found_by_id(ResourceType::Collection, collection_id)
                .into()
        })
}

/// Requires `user_id` to be able to modify `collection_id` and everything
/// in it, returning the collection's team.
pub(crate) fn require_collection_admin(
    conn: &mut DbConnection,
    user_id: Key,
    collection_id: Key,
) -> Result<Key, TransactionError> {
    match collection_role(conn, user_id, collection_id)? {
        None => Err(Error::not_found_by_id(
            ResourceType::Collection,
            collection_id,
        )
        .into()),
        Some((_, RoleId::Member)) => Err(Error::access_denied_by_id(
            ResourceType::Collection,
            collection_id,
        )
        .into()),
        Some((team_id, RoleId::Admin)) => Ok(team_id),
    }
}

/// Requires firmware `firmware_id`, when set, to belong to `collection_id`.
pub(crate) fn require_firmware_in_collection(
    conn: &mut DbConnection,
    collection_id: Key,
    firmware_id: Key,
) -> Result<(), TransactionError> {
    if firmware_id.is_unset() {
        return Ok(());
    }
    #[derive(QueryableByName)]
    struct Found {
        #[diesel(sql_type = BigInt)]
        #[allow(dead_code)]
        firmware_id: i64,
    }
    sql(
        conn,
        "SELECT firmware_id FROM firmware \
         WHERE collection_id = $1 AND firmware_id = $2",
    )
    .bind::<BigInt, _>(collection_id.as_i64())
    .bind::<BigInt, _>(firmware_id.as_i64())
    .get_result::<Found>(conn)
    .optional()?
    .map(|_| ())
    .ok_or_else(|| {
        Error::not_found_by_id(ResourceType::Firmware, firmware_id).into()
    })
}
