// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`UserStore`] methods on users

use super::team::insert_member_row;
use super::team::insert_team_row;
use super::SqlStore;
use crate::db::pool_connection::sql;
use crate::db::pool_connection::DbConnection;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Bool;
use diesel::sql_types::Integer;
use diesel::sql_types::Text;
use diesel::QueryResult;
use diesel::RunQueryDsl;
use horde_common::api::external::CreateResult;
use horde_common::api::external::Error;
use horde_common::api::external::LookupResult;
use horde_common::api::external::LookupType;
use horde_common::api::external::ResourceType;
use horde_common::api::external::UpdateResult;
use horde_common::key::Key;
use horde_db_model::AuthType;
use horde_db_model::MemberRow;
use horde_db_model::RoleId;
use horde_db_model::Team;
use horde_db_model::TeamRow;
use horde_db_model::User;
use horde_db_model::UserRow;

pub(crate) const SELECT_ALL_USERS: &str = "SELECT user_id, external_id, \
    auth_type, name, email, phone, avatar_url, verified_email, \
    verified_phone, private_team_id FROM hordeuser ORDER BY user_id";

pub(crate) fn insert_user_row(
    conn: &mut DbConnection,
    row: &UserRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "INSERT INTO hordeuser (user_id, external_id, auth_type, name, \
         email, phone, avatar_url, verified_email, verified_phone, \
         private_team_id) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind::<BigInt, _>(row.user_id)
    .bind::<Text, _>(row.external_id.clone())
    .bind::<Integer, _>(row.auth_type)
    .bind::<Text, _>(row.name.clone())
    .bind::<Text, _>(row.email.clone())
    .bind::<Text, _>(row.phone.clone())
    .bind::<Text, _>(row.avatar_url.clone())
    .bind::<Bool, _>(row.verified_email)
    .bind::<Bool, _>(row.verified_phone)
    .bind::<BigInt, _>(row.private_team_id)
    .execute(conn)
}

fn user_row(user: &User) -> UserRow {
    UserRow {
        user_id: user.user_id.as_i64(),
        external_id: user.external_id.clone(),
        auth_type: user.auth_type.code(),
        name: user.name.clone(),
        email: user.email.clone(),
        phone: user.phone.clone(),
        avatar_url: user.avatar_url.clone(),
        verified_email: user.verified_email,
        verified_phone: user.verified_phone,
        private_team_id: user.private_team_id.as_i64(),
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Creates a user together with its private team.  The user becomes
    /// the only member, and admin, of the private team.
    async fn create_user(
        &self,
        user: &User,
        private_team: &Team,
    ) -> CreateResult<()>;

    async fn retrieve_user(&self, user_id: Key) -> LookupResult<User>;

    /// Looks up a user by the identity an external provider knows it by.
    async fn retrieve_user_by_external_id(
        &self,
        auth_type: AuthType,
        external_id: &str,
    ) -> LookupResult<User>;

    /// Updates the profile fields of a user.  The private team and the
    /// external identity cannot change.
    async fn update_user(&self, user: &User) -> UpdateResult<()>;
}

#[async_trait]
impl UserStore for SqlStore {
    async fn create_user(
        &self,
        user: &User,
        private_team: &Team,
    ) -> CreateResult<()> {
        if !private_team.private
            || private_team.team_id != user.private_team_id
        {
            return Err(Error::invalid_request(
                "a user must be created with its own private team",
            ));
        }
        let user_row = user_row(user);
        let team_row = TeamRow {
            team_id: private_team.team_id.as_i64(),
            private: true,
            tags: private_team.tags.to_json(),
        };
        let member_row = MemberRow {
            user_id: user.user_id.as_i64(),
            team_id: private_team.team_id.as_i64(),
            role_id: RoleId::Admin.code(),
        };
        self.transaction(
            ResourceType::User,
            LookupType::ById(user.user_id),
            move |conn| {
                insert_team_row(conn, &team_row)?;
                insert_user_row(conn, &user_row)?;
                insert_member_row(conn, &member_row)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_user(&self, user_id: Key) -> LookupResult<User> {
        let row = self
            .transaction(
                ResourceType::User,
                LookupType::ById(user_id),
                move |conn| {
                    Ok(sql(
                        conn,
                        "SELECT user_id, external_id, auth_type, name, \
                         email, phone, avatar_url, verified_email, \
                         verified_phone, private_team_id \
                         FROM hordeuser WHERE user_id = $1",
                    )
                    .bind::<BigInt, _>(user_id.as_i64())
                    .get_result::<UserRow>(conn)?)
                },
            )
            .await?;
        User::try_from(row)
    }

    async fn retrieve_user_by_external_id(
        &self,
        auth_type: AuthType,
        external_id: &str,
    ) -> LookupResult<User> {
        let external_id = external_id.to_owned();
        let row = self
            .transaction(
                ResourceType::User,
                LookupType::ByName(external_id.clone()),
                move |conn| {
                    Ok(sql(
                        conn,
                        "SELECT user_id, external_id, auth_type, name, \
                         email, phone, avatar_url, verified_email, \
                         verified_phone, private_team_id \
                         FROM hordeuser \
                         WHERE auth_type = $1 AND external_id = $2",
                    )
                    .bind::<Integer, _>(auth_type.code())
                    .bind::<Text, _>(external_id)
                    .get_result::<UserRow>(conn)?)
                },
            )
            .await?;
        User::try_from(row)
    }

    async fn update_user(&self, user: &User) -> UpdateResult<()> {
        let row = user_row(user);
        let user_id = user.user_id;
        self.transaction(
            ResourceType::User,
            LookupType::ById(user_id),
            move |conn| {
                let updated = sql(
                    conn,
                    "UPDATE hordeuser SET name = $1, email = $2, phone = $3, \
                     avatar_url = $4, verified_email = $5, \
                     verified_phone = $6 WHERE user_id = $7",
                )
                .bind::<Text, _>(row.name)
                .bind::<Text, _>(row.email)
                .bind::<Text, _>(row.phone)
                .bind::<Text, _>(row.avatar_url)
                .bind::<Bool, _>(row.verified_email)
                .bind::<Bool, _>(row.verified_phone)
                .bind::<BigInt, _>(row.user_id)
                .execute(conn)?;
                if updated == 0 {
                    return Err(Error::not_found_by_id(
                        ResourceType::User,
                        user_id,
                    )
                    .into());
                }
                Ok(())
            },
        )
        .await
    }
}
