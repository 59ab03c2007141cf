// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::from_column_time;
use crate::Tags;
use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use diesel::sql_types::BigInt;
use diesel::sql_types::Bool;
use diesel::sql_types::Integer;
use diesel::sql_types::Text;
use diesel::sql_types::Timestamp;
use diesel::QueryableByName;
use horde_common::api::external::Error;
use horde_common::key::Key;

/// A member's role within a team
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum RoleId {
    Member,
    Admin,
}

impl RoleId {
    pub fn code(&self) -> i32 {
        match self {
            RoleId::Member => 0,
            RoleId::Admin => 1,
        }
    }
}

impl TryFrom<i32> for RoleId {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(RoleId::Member),
            1 => Ok(RoleId::Admin),
            _ => Err(Error::internal_error(&format!("unknown role {}", code))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Member {
    pub user_id: Key,
    pub role: RoleId,
}

/// A team of users owning collections
///
/// Every team has at least one admin.  A private team belongs to exactly one
/// user and never gains further members.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Team {
    pub team_id: Key,
    pub private: bool,
    /// Members, ordered by user id.
    pub members: Vec<Member>,
    pub tags: Tags,
}

impl Team {
    pub fn role_of(&self, user_id: Key) -> Option<RoleId> {
        self.members.iter().find(|m| m.user_id == user_id).map(|m| m.role)
    }

    pub fn is_admin(&self, user_id: Key) -> bool {
        self.role_of(user_id) == Some(RoleId::Admin)
    }

    pub fn is_member(&self, user_id: Key) -> bool {
        self.role_of(user_id).is_some()
    }
}

#[derive(Clone, Debug, QueryableByName)]
pub struct TeamRow {
    #[diesel(sql_type = BigInt)]
    pub team_id: i64,
    #[diesel(sql_type = Bool)]
    pub private: bool,
    #[diesel(sql_type = Text)]
    pub tags: String,
}

#[derive(Clone, Debug, QueryableByName)]
pub struct MemberRow {
    #[diesel(sql_type = BigInt)]
    pub user_id: i64,
    #[diesel(sql_type = BigInt)]
    pub team_id: i64,
    #[diesel(sql_type = Integer)]
    pub role_id: i32,
}

impl TryFrom<&MemberRow> for Member {
    type Error = Error;

    fn try_from(row: &MemberRow) -> Result<Self, Self::Error> {
        Ok(Member {
            user_id: Key::from_i64(row.user_id),
            role: RoleId::try_from(row.role_id)?,
        })
    }
}

impl Team {
    /// Assembles a team from its row and the member rows belonging to it.
    pub fn from_rows(row: TeamRow, members: &[MemberRow]) -> Result<Team, Error> {
        let mut members = members
            .iter()
            .filter(|m| m.team_id == row.team_id)
            .map(Member::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        members.sort_by_key(|m| m.user_id);
        Ok(Team {
            team_id: Key::from_i64(row.team_id),
            private: row.private,
            members,
            tags: Tags::from_json(&row.tags)?,
        })
    }
}

/// An invitation to join a team, addressed by its random code
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Invite {
    pub code: String,
    pub team_id: Key,
    /// The admin who issued the invite.
    pub user_id: Key,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Debug, QueryableByName)]
pub struct InviteRow {
    #[diesel(sql_type = Text)]
    pub code: String,
    #[diesel(sql_type = BigInt)]
    pub team_id: i64,
    #[diesel(sql_type = BigInt)]
    pub user_id: i64,
    #[diesel(sql_type = Timestamp)]
    pub created: NaiveDateTime,
}

impl From<InviteRow> for Invite {
    fn from(row: InviteRow) -> Self {
        Invite {
            code: row.code,
            team_id: Key::from_i64(row.team_id),
            user_id: Key::from_i64(row.user_id),
            created: from_column_time(row.created),
        }
    }
}
