// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`TeamStore`] methods on teams and their members

use super::authz;
use super::SqlStore;
use crate::db::error::TransactionError;
use crate::db::pool_connection::sql;
use crate::db::pool_connection::DbConnection;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Bool;
use diesel::sql_types::Integer;
use diesel::sql_types::Text;
use diesel::OptionalExtension;
use diesel::QueryResult;
use diesel::QueryableByName;
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
use horde_db_model::MemberRow;
use horde_db_model::RoleId;
use horde_db_model::Team;
use horde_db_model::TeamRow;

pub(crate) const SELECT_ALL_TEAMS: &str = "SELECT team_id, private, \
    CAST(tags AS TEXT) AS tags FROM team ORDER BY team_id";

pub(crate) const SELECT_ALL_MEMBERS: &str = "SELECT user_id, team_id, \
    role_id FROM member ORDER BY team_id, user_id";

pub(crate) fn insert_team_row(
    conn: &mut DbConnection,
    row: &TeamRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "INSERT INTO team (team_id, private, tags) \
         VALUES ($1, $2, CAST($3 AS JSONB))",
    )
    .bind::<BigInt, _>(row.team_id)
    .bind::<Bool, _>(row.private)
    .bind::<Text, _>(row.tags.clone())
    .execute(conn)
}

pub(crate) fn insert_member_row(
    conn: &mut DbConnection,
    row: &MemberRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "INSERT INTO member (user_id, team_id, role_id) VALUES ($1, $2, $3)",
    )
    .bind::<BigInt, _>(row.user_id)
    .bind::<BigInt, _>(row.team_id)
    .bind::<Integer, _>(row.role_id)
    .execute(conn)
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

/// Loads a team and its members.
pub(crate) fn load_team(
    conn: &mut DbConnection,
    team_id: Key,
) -> Result<Team, TransactionError> {
    let row = sql(
        conn,
        "SELECT team_id, private, CAST(tags AS TEXT) AS tags \
         FROM team WHERE team_id = $1",
    )
    .bind::<BigInt, _>(team_id.as_i64())
    .get_result::<TeamRow>(conn)
    .optional()?
    .ok_or_else(|| Error::not_found_by_id(ResourceType::Team, team_id))?;
    let members = sql(
        conn,
        "SELECT user_id, team_id, role_id FROM member WHERE team_id = $1",
    )
    .bind::<BigInt, _>(team_id.as_i64())
    .load::<MemberRow>(conn)?;
    Ok(Team::from_rows(row, &members)?)
}

fn admin_count(
    conn: &mut DbConnection,
    team_id: Key,
) -> Result<i64, TransactionError> {
    let row = sql(
        conn,
        "SELECT CAST(COUNT(*) AS BIGINT) AS n FROM member \
         WHERE team_id = $1 AND role_id = $2",
    )
    .bind::<BigInt, _>(team_id.as_i64())
    .bind::<Integer, _>(RoleId::Admin.code())
    .get_result::<CountRow>(conn)?;
    Ok(row.n)
}

/// Fails for private teams, which never change membership.
fn require_not_private(team: &Team) -> Result<(), TransactionError> {
    if team.private {
        return Err(
            Error::access_denied_by_id(ResourceType::Team, team.team_id).into()
        );
    }
    Ok(())
}

#[async_trait]
pub trait TeamStore: Send + Sync {
    /// Creates a (non-private) team with the acting user as its admin.
    async fn create_team(&self, user_id: Key, team: &Team) -> CreateResult<()>;

    async fn retrieve_team(
        &self,
        user_id: Key,
        team_id: Key,
    ) -> LookupResult<Team>;

    /// Lists the teams the acting user is a member of.
    async fn list_teams(&self, user_id: Key) -> ListResultVec<Team>;

    /// Updates the team's tags.  Membership changes go through
    /// [`TeamStore::update_member_role`] and [`TeamStore::remove_member`].
    async fn update_team(&self, user_id: Key, team: &Team) -> UpdateResult<()>;

    /// Deletes a team along with its memberships and pending invites.
    /// Private teams cannot be deleted; teams owning collections are
    /// referenced.
    async fn delete_team(&self, user_id: Key, team_id: Key) -> DeleteResult;

    /// Changes the role of an existing member.  Demoting the last admin is
    /// rejected.
    async fn update_member_role(
        &self,
        user_id: Key,
        team_id: Key,
        member_id: Key,
        role: RoleId,
    ) -> UpdateResult<()>;

    /// Removes a member.  Admins can remove anyone; members can remove
    /// themselves.  Removing the last admin is rejected.
    async fn remove_member(
        &self,
        user_id: Key,
        team_id: Key,
        member_id: Key,
    ) -> DeleteResult;
}

#[async_trait]
impl TeamStore for SqlStore {
    async fn create_team(&self, user_id: Key, team: &Team) -> CreateResult<()> {
        if team.private {
            return Err(Error::invalid_request(
                "private teams are created along with their user",
            ));
        }
        let team_row = TeamRow {
            team_id: team.team_id.as_i64(),
            private: false,
            tags: team.tags.to_json(),
        };
        let member_row = MemberRow {
            user_id: user_id.as_i64(),
            team_id: team.team_id.as_i64(),
            role_id: RoleId::Admin.code(),
        };
        self.transaction(
            ResourceType::Team,
            LookupType::ById(team.team_id),
            move |conn| {
                #[derive(QueryableByName)]
                struct Found {
                    #[diesel(sql_type = BigInt)]
                    #[allow(dead_code)]
                    user_id: i64,
                }
                sql(conn, "SELECT user_id FROM hordeuser WHERE user_id = $1")
                    .bind::<BigInt, _>(user_id.as_i64())
                    .get_result::<Found>(conn)
                    .optional()?
                    .ok_or_else(|| {
                        Error::not_found_by_id(ResourceType::User, user_id)
                    })?;
                insert_team_row(conn, &team_row)?;
                insert_member_row(conn, &member_row)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_team(
        &self,
        user_id: Key,
        team_id: Key,
    ) -> LookupResult<Team> {
        self.transaction(
            ResourceType::Team,
            LookupType::ById(team_id),
            move |conn| {
                authz::require_team_member(conn, user_id, team_id)?;
                load_team(conn, team_id)
            },
        )
        .await
    }

    async fn list_teams(&self, user_id: Key) -> ListResultVec<Team> {
        self.transaction(
            ResourceType::Team,
            LookupType::ById(user_id),
            move |conn| {
                let teams = sql(
                    conn,
                    "SELECT t.team_id AS team_id, t.private AS private, \
                     CAST(t.tags AS TEXT) AS tags \
                     FROM team t JOIN member m ON m.team_id = t.team_id \
                     WHERE m.user_id = $1 ORDER BY t.team_id",
                )
                .bind::<BigInt, _>(user_id.as_i64())
                .load::<TeamRow>(conn)?;
                let members = sql(
                    conn,
                    "SELECT user_id, team_id, role_id FROM member \
                     WHERE team_id IN \
                     (SELECT team_id FROM member WHERE user_id = $1)",
                )
                .bind::<BigInt, _>(user_id.as_i64())
                .load::<MemberRow>(conn)?;
                Ok(teams
                    .into_iter()
                    .map(|row| Team::from_rows(row, &members))
                    .collect::<Result<Vec<_>, _>>()?)
            },
        )
        .await
    }

    async fn update_team(&self, user_id: Key, team: &Team) -> UpdateResult<()> {
        let team_id = team.team_id;
        let tags = team.tags.to_json();
        self.transaction(
            ResourceType::Team,
            LookupType::ById(team_id),
            move |conn| {
                authz::require_team_admin(conn, user_id, team_id)?;
                sql(
                    conn,
                    "UPDATE team SET tags = CAST($1 AS JSONB) \
                     WHERE team_id = $2",
                )
                .bind::<Text, _>(tags)
                .bind::<BigInt, _>(team_id.as_i64())
                .execute(conn)?;
                Ok(())
            },
        )
        .await
    }

    async fn delete_team(&self, user_id: Key, team_id: Key) -> DeleteResult {
        self.transaction(
            ResourceType::Team,
            LookupType::ById(team_id),
            move |conn| {
                authz::require_team_admin(conn, user_id, team_id)?;
                let team = load_team(conn, team_id)?;
                require_not_private(&team)?;
                for stmt in [
                    "DELETE FROM invite WHERE team_id = $1",
                    "DELETE FROM member WHERE team_id = $1",
                    "DELETE FROM team WHERE team_id = $1",
                ] {
                    sql(conn, stmt)
                        .bind::<BigInt, _>(team_id.as_i64())
                        .execute(conn)?;
                }
                Ok(())
            },
        )
        .await
    }

    async fn update_member_role(
        &self,
        user_id: Key,
        team_id: Key,
        member_id: Key,
        role: RoleId,
    ) -> UpdateResult<()> {
        self.transaction(
            ResourceType::Member,
            LookupType::ById(member_id),
            move |conn| {
                authz::require_team_admin(conn, user_id, team_id)?;
                let team = load_team(conn, team_id)?;
                require_not_private(&team)?;
                let current = team.role_of(member_id).ok_or_else(|| {
                    Error::not_found_by_id(ResourceType::Member, member_id)
                })?;
                if current == role {
                    return Ok(());
                }
                if current == RoleId::Admin && admin_count(conn, team_id)? <= 1
                {
                    return Err(Error::invalid_request(
                        "a team must keep at least one admin",
                    )
                    .into());
                }
                sql(
                    conn,
                    "UPDATE member SET role_id = $1 \
                     WHERE team_id = $2 AND user_id = $3",
                )
                .bind::<Integer, _>(role.code())
                .bind::<BigInt, _>(team_id.as_i64())
                .bind::<BigInt, _>(member_id.as_i64())
                .execute(conn)?;
                Ok(())
            },
        )
        .await
    }

    async fn remove_member(
        &self,
        user_id: Key,
        team_id: Key,
        member_id: Key,
    ) -> DeleteResult {
        self.transaction(
            ResourceType::Member,
            LookupType::ById(member_id),
            move |conn| {
                if user_id == member_id {
                    authz::require_team_member(conn, user_id, team_id)?;
                } else {
                    authz::require_team_admin(conn, user_id, team_id)?;
                }
                let team = load_team(conn, team_id)?;
                require_not_private(&team)?;
                let current = team.role_of(member_id).ok_or_else(|| {
                    Error::not_found_by_id(ResourceType::Member, member_id)
                })?;
                if current == RoleId::Admin && admin_count(conn, team_id)? <= 1
                {
                    return Err(Error::invalid_request(
                        "a team must keep at least one admin",
                    )
                    .into());
                }
                sql(
                    conn,
                    "DELETE FROM member WHERE team_id = $1 AND user_id = $2",
                )
                .bind::<BigInt, _>(team_id.as_i64())
                .bind::<BigInt, _>(member_id.as_i64())
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
    use crate::db::datastore::CollectionStore;
    use crate::db::datastore::InviteStore;
    use crate::db::pub_test_utils::fixtures;
    use crate::db::pub_test_utils::TestDatabase;
    use assert_matches::assert_matches;
    use horde_db_model::Tags;
    use horde_test_utils::dev;

    #[tokio::test]
    async fn test_team_membership_rules() {
        let logctx = dev::test_setup_log("test_team_membership_rules");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        let (admin, admin_private) = fixtures::user(&db, "admin").await;
        let (member, _) = fixtures::user(&db, "member").await;
        let (outsider, _) = fixtures::user(&db, "outsider").await;

        let team = fixtures::team(&db, admin.user_id).await;
        fixtures::join(&db, admin.user_id, team.team_id, member.user_id).await;

        // Non-members cannot see the team at all.
        assert_matches!(
            store.retrieve_team(outsider.user_id, team.team_id).await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Team, .. })
        );
        let seen = store.retrieve_team(member.user_id, team.team_id).await.unwrap();
        assert_eq!(seen.role_of(member.user_id), Some(RoleId::Member));
        assert_eq!(seen.role_of(admin.user_id), Some(RoleId::Admin));

        // Plain members cannot administer the team.
        let mut changed = seen.clone();
        changed.tags.set("name", "team");
        assert_matches!(
            store.update_team(member.user_id, &changed).await,
            Err(Error::AccessDenied { .. })
        );
        store.update_team(admin.user_id, &changed).await.unwrap();
        assert_eq!(
            store
                .retrieve_team(member.user_id, team.team_id)
                .await
                .unwrap()
                .tags
                .get("NAME"),
            "team"
        );

        // The last admin can be neither demoted nor removed.
        assert_matches!(
            store
                .update_member_role(
                    admin.user_id,
                    team.team_id,
                    admin.user_id,
                    RoleId::Member
                )
                .await,
            Err(Error::InvalidRequest { .. })
        );
        assert_matches!(
            store.remove_member(admin.user_id, team.team_id, admin.user_id).await,
            Err(Error::InvalidRequest { .. })
        );

        // With a second admin the first can step down.
        store
            .update_member_role(
                admin.user_id,
                team.team_id,
                member.user_id,
                RoleId::Admin,
            )
            .await
            .unwrap();
        store
            .update_member_role(
                admin.user_id,
                team.team_id,
                admin.user_id,
                RoleId::Member,
            )
            .await
            .unwrap();
        store.remove_member(admin.user_id, team.team_id, admin.user_id).await.unwrap();
        assert_matches!(
            store.retrieve_team(admin.user_id, team.team_id).await,
            Err(Error::ObjectNotFound { .. })
        );

        // Private teams never change membership and cannot be deleted.
        assert_matches!(
            store
                .update_member_role(
                    admin.user_id,
                    admin_private.team_id,
                    outsider.user_id,
                    RoleId::Admin
                )
                .await,
            Err(Error::AccessDenied { .. })
        );
        assert_matches!(
            store.delete_team(admin.user_id, admin_private.team_id).await,
            Err(Error::AccessDenied { .. })
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_delete_team() {
        let logctx = dev::test_setup_log("test_delete_team");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        let (admin, _) = fixtures::user(&db, "admin").await;
        let team = fixtures::team(&db, admin.user_id).await;
        let collection = fixtures::collection(&db, admin.user_id, team.team_id).await;
        fixtures::invite(&db, admin.user_id, team.team_id, "pending").await;

        // A team owning a collection is still referenced.
        assert_matches!(
            store.delete_team(admin.user_id, team.team_id).await,
            Err(Error::Referenced { type_name: ResourceType::Team, .. })
        );
        // The failed delete rolled back completely.
        assert!(store.retrieve_invite("pending").await.is_ok());

        store
            .delete_collection(admin.user_id, collection.collection_id)
            .await
            .unwrap();
        store.delete_team(admin.user_id, team.team_id).await.unwrap();
        assert_matches!(
            store.retrieve_invite("pending").await,
            Err(Error::ObjectNotFound { .. })
        );
        let teams = store.list_teams(admin.user_id).await.unwrap();
        assert_eq!(teams.len(), 1);
        assert!(teams[0].private);

        assert_matches!(
            store
                .create_team(
                    admin.user_id,
                    &Team {
                        team_id: db.new_id(horde_common::key::KeyKind::Team).await,
                        private: true,
                        members: vec![],
                        tags: Tags::new(),
                    }
                )
                .await,
            Err(Error::InvalidRequest { .. })
        );
        logctx.cleanup_successful();
    }
}
