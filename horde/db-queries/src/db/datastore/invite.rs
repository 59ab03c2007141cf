// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`InviteStore`] methods on team invites

use super::authz;
use super::team::insert_member_row;
use super::team::load_team;
use super::ExpectRows;
use super::SqlStore;
use crate::db::pool_connection::sql;
use crate::db::pool_connection::DbConnection;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Text;
use diesel::sql_types::Timestamp;
use diesel::OptionalExtension;
use diesel::QueryResult;
use diesel::RunQueryDsl;
use horde_common::api::external::CreateResult;
use horde_common::api::external::DeleteResult;
use horde_common::api::external::Error;
use horde_common::api::external::ListResultVec;
use horde_common::api::external::LookupResult;
use horde_common::api::external::LookupType;
use horde_common::api::external::ResourceType;
use horde_common::api::external::UpdateResult;
use horde_common::key::Key;
use horde_db_model::to_column_time;
use horde_db_model::Invite;
use horde_db_model::InviteRow;
use horde_db_model::MemberRow;
use horde_db_model::RoleId;

pub(crate) const SELECT_ALL_INVITES: &str =
    "SELECT code, team_id, user_id, created FROM invite ORDER BY code";

pub(crate) fn insert_invite_row(
    conn: &mut DbConnection,
    row: &InviteRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "INSERT INTO invite (code, team_id, user_id, created) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind::<Text, _>(row.code.clone())
    .bind::<BigInt, _>(row.team_id)
    .bind::<BigInt, _>(row.user_id)
    .bind::<Timestamp, _>(row.created)
    .execute(conn)
}

fn select_invite(
    conn: &mut DbConnection,
    code: &str,
) -> QueryResult<Option<InviteRow>> {
    sql(
        conn,
        "SELECT code, team_id, user_id, created FROM invite WHERE code = $1",
    )
    .bind::<Text, _>(code.to_owned())
    .get_result::<InviteRow>(conn)
    .optional()
}

fn invite_not_found() -> Error {
    Error::ObjectNotFound {
        type_name: ResourceType::Invite,
        lookup_type: LookupType::BySecret,
    }
}

#[async_trait]
pub trait InviteStore: Send + Sync {
    /// Creates an invite to `invite.team_id` issued by `invite.user_id`, who
    /// must be an admin of the (non-private) team.
    async fn create_invite(&self, invite: &Invite) -> CreateResult<()>;

    /// Looks up an invite by its code.  Anyone holding the code may see it.
    async fn retrieve_invite(&self, code: &str) -> LookupResult<Invite>;

    /// Lists the pending invites of a team the acting user administers.
    async fn list_invites(
        &self,
        user_id: Key,
        team_id: Key,
    ) -> ListResultVec<Invite>;

    async fn delete_invite(&self, user_id: Key, code: &str) -> DeleteResult;

    /// Makes `user_id` a member of the invite's team and consumes the
    /// invite.
    async fn accept_invite(&self, user_id: Key, code: &str) -> UpdateResult<()>;
}

#[async_trait]
impl InviteStore for SqlStore {
    async fn create_invite(&self, invite: &Invite) -> CreateResult<()> {
        let row = InviteRow {
            code: invite.code.clone(),
            team_id: invite.team_id.as_i64(),
            user_id: invite.user_id.as_i64(),
            created: to_column_time(&invite.created),
        };
        let user_id = invite.user_id;
        let team_id = invite.team_id;
        self.transaction(
            ResourceType::Invite,
            LookupType::BySecret,
            move |conn| {
                authz::require_team_admin(conn, user_id, team_id)?;
                if load_team(conn, team_id)?.private {
                    return Err(Error::access_denied_by_id(
                        ResourceType::Team,
                        team_id,
                    )
                    .into());
                }
                insert_invite_row(conn, &row)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_invite(&self, code: &str) -> LookupResult<Invite> {
        let code = code.to_owned();
        let row = self
            .transaction(
                ResourceType::Invite,
                LookupType::BySecret,
                move |conn| {
                    Ok(select_invite(conn, &code)?
                        .ok_or_else(invite_not_found)?)
                },
            )
            .await?;
        Ok(Invite::from(row))
    }

    async fn list_invites(
        &self,
        user_id: Key,
        team_id: Key,
    ) -> ListResultVec<Invite> {
        let rows = self
            .transaction(
                ResourceType::Invite,
                LookupType::ById(team_id),
                move |conn| {
                    authz::require_team_admin(conn, user_id, team_id)?;
                    Ok(sql(
                        conn,
                        "SELECT code, team_id, user_id, created FROM invite \
                         WHERE team_id = $1 ORDER BY created, code",
                    )
                    .bind::<BigInt, _>(team_id.as_i64())
                    .load::<InviteRow>(conn)?)
                },
            )
            .await?;
        Ok(rows.into_iter().map(Invite::from).collect())
    }

    async fn delete_invite(&self, user_id: Key, code: &str) -> DeleteResult {
        let code = code.to_owned();
        self.transaction(
            ResourceType::Invite,
            LookupType::BySecret,
            move |conn| {
                let row =
                    select_invite(conn, &code)?.ok_or_else(invite_not_found)?;
                authz::require_team_admin(
                    conn,
                    user_id,
                    Key::from_i64(row.team_id),
                )?;
                sql(conn, "DELETE FROM invite WHERE code = $1")
                    .bind::<Text, _>(code)
                    .execute(conn)?
                    .or_not_found(invite_not_found())
            },
        )
        .await
    }

    async fn accept_invite(&self, user_id: Key, code: &str) -> UpdateResult<()> {
        let code = code.to_owned();
        self.transaction(
            ResourceType::Invite,
            LookupType::BySecret,
            move |conn| {
                let row =
                    select_invite(conn, &code)?.ok_or_else(invite_not_found)?;
                let team_id = Key::from_i64(row.team_id);
                if authz::team_role(conn, user_id, team_id)?.is_some() {
                    return Err(Error::ObjectAlreadyExists {
                        type_name: ResourceType::Member,
                        object_name: user_id.to_string(),
                    }
                    .into());
                }
                insert_member_row(
                    conn,
                    &MemberRow {
                        user_id: user_id.as_i64(),
                        team_id: row.team_id,
                        role_id: RoleId::Member.code(),
                    },
                )?;
                sql(conn, "DELETE FROM invite WHERE code = $1")
                    .bind::<Text, _>(code)
                    .execute(conn)?;
                Ok(())
            },
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::datastore::TeamStore;
    use crate::db::pub_test_utils::fixtures;
    use crate::db::pub_test_utils::TestDatabase;
    use assert_matches::assert_matches;
    use horde_db_model::now;
    use horde_test_utils::dev;

    #[tokio::test]
    async fn test_invite_flow() {
        let logctx = dev::test_setup_log("test_invite_flow");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        let (admin, admin_private) = fixtures::user(&db, "admin").await;
        let (guest, _) = fixtures::user(&db, "guest").await;
        let team = fixtures::team(&db, admin.user_id).await;

        // Private teams take no invites, and guests cannot issue them.
        let mut invite = Invite {
            code: String::from("welcome"),
            team_id: admin_private.team_id,
            user_id: admin.user_id,
            created: now(),
        };
        assert_matches!(
            store.create_invite(&invite).await,
            Err(Error::AccessDenied { .. })
        );
        invite.team_id = team.team_id;
        invite.user_id = guest.user_id;
        assert_matches!(
            store.create_invite(&invite).await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Team, .. })
        );
        invite.user_id = admin.user_id;
        store.create_invite(&invite).await.unwrap();

        assert_eq!(store.retrieve_invite("welcome").await.unwrap(), invite);
        assert_eq!(
            store.list_invites(admin.user_id, team.team_id).await.unwrap(),
            [invite.clone()]
        );

        assert_matches!(
            store.accept_invite(guest.user_id, "nope").await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Invite, .. })
        );
        // Existing members cannot accept.
        assert_matches!(
            store.accept_invite(admin.user_id, "welcome").await,
            Err(Error::ObjectAlreadyExists { type_name: ResourceType::Member, .. })
        );

        store.accept_invite(guest.user_id, "welcome").await.unwrap();
        let joined = store.retrieve_team(guest.user_id, team.team_id).await.unwrap();
        assert_eq!(joined.role_of(guest.user_id), Some(RoleId::Member));
        assert_matches!(
            store.retrieve_invite("welcome").await,
            Err(Error::ObjectNotFound { .. })
        );

        // Only admins delete invites.
        fixtures::invite(&db, admin.user_id, team.team_id, "second").await;
        assert_matches!(
            store.delete_invite(guest.user_id, "second").await,
            Err(Error::AccessDenied { .. })
        );
        store.delete_invite(admin.user_id, "second").await.unwrap();
        assert_matches!(
            store.delete_invite(admin.user_id, "second").await,
            Err(Error::ObjectNotFound { .. })
        );
        logctx.cleanup_successful();
    }
}
