// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`TokenStore`] methods on API tokens

use super::ExpectRows;
use super::SqlStore;
use crate::db::pool_connection::sql;
use crate::db::pool_connection::DbConnection;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Bool;
use diesel::sql_types::Text;
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
use horde_db_model::Token;
use horde_db_model::TokenRow;

pub(crate) const SELECT_ALL_TOKENS: &str = "SELECT token, user_id, \
    resource, write_access, CAST(tags AS TEXT) AS tags FROM token \
    ORDER BY token";

pub(crate) fn insert_token_row(
    conn: &mut DbConnection,
    row: &TokenRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "INSERT INTO token (token, user_id, resource, write_access, tags) \
         VALUES ($1, $2, $3, $4, CAST($5 AS JSONB))",
    )
    .bind::<Text, _>(row.token.clone())
    .bind::<BigInt, _>(row.user_id)
    .bind::<Text, _>(row.resource.clone())
    .bind::<Bool, _>(row.write_access)
    .bind::<Text, _>(row.tags.clone())
    .execute(conn)
}

fn token_row(token: &Token) -> TokenRow {
    TokenRow {
        token: token.token.clone(),
        user_id: token.user_id.as_i64(),
        resource: token.resource.clone(),
        write_access: token.write,
        tags: token.tags.to_json(),
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn create_token(&self, token: &Token) -> CreateResult<()>;

    /// Looks up a token by its secret.  Used when authenticating requests,
    /// so there is no acting user.
    async fn retrieve_token(&self, token: &str) -> LookupResult<Token>;

    async fn list_tokens(&self, user_id: Key) -> ListResultVec<Token>;

    /// Updates the resource, access and tags of a token owned by `user_id`.
    async fn update_token(&self, user_id: Key, token: &Token)
        -> UpdateResult<()>;

    async fn delete_token(&self, user_id: Key, token: &str) -> DeleteResult;
}

#[async_trait]
impl TokenStore for SqlStore {
    async fn create_token(&self, token: &Token) -> CreateResult<()> {
        let row = token_row(token);
        self.transaction(ResourceType::Token, LookupType::BySecret, move |conn| {
            insert_token_row(conn, &row)?;
            Ok(())
        })
        .await
    }

    async fn retrieve_token(&self, token: &str) -> LookupResult<Token> {
        let token = token.to_owned();
        let row = self
            .transaction(ResourceType::Token, LookupType::BySecret, move |conn| {
                Ok(sql(
                    conn,
                    "SELECT token, user_id, resource, write_access, \
                     CAST(tags AS TEXT) AS tags FROM token WHERE token = $1",
                )
                .bind::<Text, _>(token)
                .get_result::<TokenRow>(conn)?)
            })
            .await?;
        Token::try_from(row)
    }

    async fn list_tokens(&self, user_id: Key) -> ListResultVec<Token> {
        let rows = self
            .transaction(
                ResourceType::Token,
                LookupType::ById(user_id),
                move |conn| {
                    Ok(sql(
                        conn,
                        "SELECT token, user_id, resource, write_access, \
                         CAST(tags AS TEXT) AS tags FROM token \
                         WHERE user_id = $1 ORDER BY token",
                    )
                    .bind::<BigInt, _>(user_id.as_i64())
                    .load::<TokenRow>(conn)?)
                },
            )
            .await?;
        rows.into_iter().map(Token::try_from).collect()
    }

    async fn update_token(
        &self,
        user_id: Key,
        token: &Token,
    ) -> UpdateResult<()> {
        let row = token_row(token);
        self.transaction(ResourceType::Token, LookupType::BySecret, move |conn| {
            sql(
                conn,
                "UPDATE token SET resource = $1, write_access = $2, \
                 tags = CAST($3 AS JSONB) \
                 WHERE token = $4 AND user_id = $5",
            )
            .bind::<Text, _>(row.resource)
            .bind::<Bool, _>(row.write_access)
            .bind::<Text, _>(row.tags)
            .bind::<Text, _>(row.token)
            .bind::<BigInt, _>(user_id.as_i64())
            .execute(conn)?
            .or_not_found(Error::ObjectNotFound {
                type_name: ResourceType::Token,
                lookup_type: LookupType::BySecret,
            })
        })
        .await
    }

    async fn delete_token(&self, user_id: Key, token: &str) -> DeleteResult {
        let token = token.to_owned();
        self.transaction(ResourceType::Token, LookupType::BySecret, move |conn| {
            sql(conn, "DELETE FROM token WHERE token = $1 AND user_id = $2")
                .bind::<Text, _>(token)
                .bind::<BigInt, _>(user_id.as_i64())
                .execute(conn)?
                .or_not_found(Error::ObjectNotFound {
                    type_name: ResourceType::Token,
                    lookup_type: LookupType::BySecret,
                })
        })
        .await
    }
}
