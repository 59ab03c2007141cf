// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Tags;
use diesel::sql_types::BigInt;
use diesel::sql_types::Bool;
use diesel::sql_types::Integer;
use diesel::sql_types::Text;
use diesel::QueryableByName;
use horde_common::api::external::Error;
use horde_common::key::Key;

/// How a user authenticates
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AuthType {
    Internal,
    Connect,
    GitHub,
    Token,
}

impl AuthType {
    pub fn code(&self) -> i32 {
        match self {
            AuthType::Internal => 0,
            AuthType::Connect => 1,
            AuthType::GitHub => 2,
            AuthType::Token => 3,
        }
    }
}

impl TryFrom<i32> for AuthType {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(AuthType::Internal),
            1 => Ok(AuthType::Connect),
            2 => Ok(AuthType::GitHub),
            3 => Ok(AuthType::Token),
            _ => Err(Error::internal_error(&format!(
                "unknown auth type {}",
                code
            ))),
        }
    }
}

/// A user of the system
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct User {
    pub user_id: Key,
    pub external_id: String,
    pub auth_type: AuthType,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub avatar_url: String,
    pub verified_email: bool,
    pub verified_phone: bool,
    /// The user's private team, created along with the user.
    pub private_team_id: Key,
}

#[derive(Clone, Debug, QueryableByName)]
pub struct UserRow {
    #[diesel(sql_type = BigInt)]
    pub user_id: i64,
    #[diesel(sql_type = Text)]
    pub external_id: String,
    #[diesel(sql_type = Integer)]
    pub auth_type: i32,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Text)]
    pub email: String,
    #[diesel(sql_type = Text)]
    pub phone: String,
    #[diesel(sql_type = Text)]
    pub avatar_url: String,
    #[diesel(sql_type = Bool)]
    pub verified_email: bool,
    #[diesel(sql_type = Bool)]
    pub verified_phone: bool,
    #[diesel(sql_type = BigInt)]
    pub private_team_id: i64,
}

impl TryFrom<UserRow> for User {
    type Error = Error;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            user_id: Key::from_i64(row.user_id),
            external_id: row.external_id,
            auth_type: AuthType::try_from(row.auth_type)?,
            name: row.name,
            email: row.email,
            phone: row.phone,
            avatar_url: row.avatar_url,
            verified_email: row.verified_email,
            verified_phone: row.verified_phone,
            private_team_id: Key::from_i64(row.private_team_id),
        })
    }
}

/// An API token
///
/// Tokens are addressed by their random token string and are visible only to
/// their owner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Token {
    pub token: String,
    pub user_id: Key,
    /// The resource path the token grants access to.
    pub resource: String,
    pub write: bool,
    pub tags: Tags,
}

#[derive(Clone, Debug, QueryableByName)]
pub struct TokenRow {
    #[diesel(sql_type = Text)]
    pub token: String,
    #[diesel(sql_type = BigInt)]
    pub user_id: i64,
    #[diesel(sql_type = Text)]
    pub resource: String,
    #[diesel(sql_type = Bool)]
    pub write_access: bool,
    #[diesel(sql_type = Text)]
    pub tags: String,
}

impl TryFrom<TokenRow> for Token {
    type Error = Error;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        Ok(Token {
            token: row.token,
            user_id: Key::from_i64(row.user_id),
            resource: row.resource,
            write: row.write_access,
            tags: Tags::from_json(&row.tags)?,
        })
    }
}
