// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`TagStore`] accessors for the tags of any tagged entity

use super::authz;
use super::SqlStore;
use crate::db::error::TransactionError;
use crate::db::pool_connection::sql;
use crate::db::pool_connection::DbConnection;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Text;
use diesel::QueryableByName;
use diesel::RunQueryDsl;
use horde_common::api::external::Error;
use horde_common::api::external::LookupResult;
use horde_common::api::external::LookupType;
use horde_common::api::external::ResourceType;
use horde_common::api::external::UpdateResult;
use horde_common::key::Key;
use horde_db_model::Tags;

/// An entity carrying tags
///
/// Entities inside a collection are addressed through it, the same way their
/// own store methods address them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TagTarget {
    Team(Key),
    Collection(Key),
    Device { collection_id: Key, device_id: Key },
    Output { collection_id: Key, output_id: Key },
    Firmware { collection_id: Key, firmware_id: Key },
    Token(String),
}

impl TagTarget {
    fn resource_type(&self) -> ResourceType {
        match self {
            TagTarget::Team(_) => ResourceType::Team,
            TagTarget::Collection(_) => ResourceType::Collection,
            TagTarget::Device { .. } => ResourceType::Device,
            TagTarget::Output { .. } => ResourceType::Output,
            TagTarget::Firmware { .. } => ResourceType::Firmware,
            TagTarget::Token(_) => ResourceType::Token,
        }
    }

    fn lookup_type(&self) -> LookupType {
        match self {
            TagTarget::Team(id) | TagTarget::Collection(id) => {
                LookupType::ById(*id)
            }
            TagTarget::Device { device_id: id, .. }
            | TagTarget::Output { output_id: id, .. }
            | TagTarget::Firmware { firmware_id: id, .. } => {
                LookupType::ById(*id)
            }
            TagTarget::Token(_) => LookupType::BySecret,
        }
    }

    fn not_found(&self) -> Error {
        Error::ObjectNotFound {
            type_name: self.resource_type(),
            lookup_type: self.lookup_type(),
        }
    }

    /// Table and `WHERE` clause selecting the row, with placeholders
    /// numbered from `first`.
    fn row_filter(&self, first: usize) -> (&'static str, String) {
        let second = first + 1;
        match self {
            TagTarget::Team(_) => {
                ("team", format!("WHERE team_id = ${}", first))
            }
            TagTarget::Collection(_) => {
                ("collection", format!("WHERE collection_id = ${}", first))
            }
            TagTarget::Device { .. } => (
                "device",
                format!(
                    "WHERE device_id = ${} AND collection_id = ${}",
                    first, second
                ),
            ),
            TagTarget::Output { .. } => (
                "output",
                format!(
                    "WHERE output_id = ${} AND collection_id = ${}",
                    first, second
                ),
            ),
            TagTarget::Firmware { .. } => (
                "firmware",
                format!(
                    "WHERE firmware_id = ${} AND collection_id = ${}",
                    first, second
                ),
            ),
            TagTarget::Token(_) => (
                "token",
                format!("WHERE token = ${} AND user_id = ${}", first, second),
            ),
        }
    }

    /// Applies the authorization rules of the owning entity.  Token
    /// ownership is part of the row predicate instead.
    fn authorize(
        &self,
        conn: &mut DbConnection,
        user_id: Key,
        write: bool,
    ) -> Result<(), TransactionError> {
        match self {
            TagTarget::Team(team_id) => {
                if write {
                    authz::require_team_admin(conn, user_id, *team_id)?;
                } else {
                    authz::require_team_member(conn, user_id, *team_id)?;
                }
            }
            TagTarget::Collection(collection_id)
            | TagTarget::Device { collection_id, .. }
            | TagTarget::Output { collection_id, .. }
            | TagTarget::Firmware { collection_id, .. } => {
                if write {
                    authz::require_collection_admin(
                        conn,
                        user_id,
                        *collection_id,
                    )?;
                } else {
                    authz::require_collection_member(
                        conn,
                        user_id,
                        *collection_id,
                    )?;
                }
            }
            TagTarget::Token(_) => (),
        }
        Ok(())
    }
}

#[derive(QueryableByName)]
struct TagsRow {
    #[diesel(sql_type = Text)]
    tags: String,
}

fn read_tags(
    conn: &mut DbConnection,
    user_id: Key,
    target: &TagTarget,
) -> Result<Tags, TransactionError> {
    let (table, filter) = target.row_filter(1);
    let text =
        format!("SELECT CAST(tags AS TEXT) AS tags FROM {} {}", table, filter);
    let query = sql(conn, &text);
    let rows = match target {
        TagTarget::Team(id) | TagTarget::Collection(id) => query
            .bind::<BigInt, _>(id.as_i64())
            .load::<TagsRow>(conn)?,
        TagTarget::Device { collection_id, device_id: id }
        | TagTarget::Output { collection_id, output_id: id }
        | TagTarget::Firmware { collection_id, firmware_id: id } => query
            .bind::<BigInt, _>(id.as_i64())
            .bind::<BigInt, _>(collection_id.as_i64())
            .load::<TagsRow>(conn)?,
        TagTarget::Token(token) => query
            .bind::<Text, _>(token.clone())
            .bind::<BigInt, _>(user_id.as_i64())
            .load::<TagsRow>(conn)?,
    };
    let row = rows.into_iter().next().ok_or_else(|| target.not_found())?;
    Ok(Tags::from_json(&row.tags)?)
}

fn write_tags(
    conn: &mut DbConnection,
    user_id: Key,
    target: &TagTarget,
    tags: &Tags,
) -> Result<(), TransactionError> {
    // The new value is $1, so the row filter starts at $2.
    let (table, filter) = target.row_filter(2);
    let text =
        format!("UPDATE {} SET tags = CAST($1 AS JSONB) {}", table, filter);
    let query = sql(conn, &text).bind::<Text, _>(tags.to_json());
    let updated = match target {
        TagTarget::Team(id) | TagTarget::Collection(id) => {
            query.bind::<BigInt, _>(id.as_i64()).execute(conn)?
        }
        TagTarget::Device { collection_id, device_id: id }
        | TagTarget::Output { collection_id, output_id: id }
        | TagTarget::Firmware { collection_id, firmware_id: id } => query
            .bind::<BigInt, _>(id.as_i64())
            .bind::<BigInt, _>(collection_id.as_i64())
            .execute(conn)?,
        TagTarget::Token(token) => query
            .bind::<Text, _>(token.clone())
            .bind::<BigInt, _>(user_id.as_i64())
            .execute(conn)?,
    };
    if updated == 0 {
        return Err(target.not_found().into());
    }
    Ok(())
}

#[async_trait]
pub trait TagStore: Send + Sync {
    /// Sets one tag.  An empty value removes the tag.
    async fn update_tag(
        &self,
        user_id: Key,
        target: &TagTarget,
        key: &str,
        value: &str,
    ) -> UpdateResult<()>;

    /// Returns one tag, or the empty string when it is not set.
    async fn retrieve_tag(
        &self,
        user_id: Key,
        target: &TagTarget,
        key: &str,
    ) -> LookupResult<String>;

    async fn retrieve_tags(
        &self,
        user_id: Key,
        target: &TagTarget,
    ) -> LookupResult<Tags>;
}

#[async_trait]
impl TagStore for SqlStore {
    async fn update_tag(
        &self,
        user_id: Key,
        target: &TagTarget,
        key: &str,
        value: &str,
    ) -> UpdateResult<()> {
        let target = target.clone();
        let key = key.to_owned();
        let value = value.to_owned();
        self.transaction(
            target.resource_type(),
            target.lookup_type(),
            move |conn| {
                target.authorize(conn, user_id, true)?;
                let mut tags = read_tags(conn, user_id, &target)?;
                tags.set(&key, &value);
                write_tags(conn, user_id, &target, &tags)
            },
        )
        .await
    }

    async fn retrieve_tag(
        &self,
        user_id: Key,
        target: &TagTarget,
        key: &str,
    ) -> LookupResult<String> {
        let tags = self.retrieve_tags(user_id, target).await?;
        Ok(tags.get(key).to_owned())
    }

    async fn retrieve_tags(
        &self,
        user_id: Key,
        target: &TagTarget,
    ) -> LookupResult<Tags> {
        let target = target.clone();
        self.transaction(
            target.resource_type(),
            target.lookup_type(),
            move |conn| {
                target.authorize(conn, user_id, false)?;
                read_tags(conn, user_id, &target)
            },
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::datastore::DeviceStore;
    use crate::db::datastore::TeamStore;
    use crate::db::pub_test_utils::fixtures;
    use crate::db::pub_test_utils::TestDatabase;
    use assert_matches::assert_matches;
    use horde_test_utils::dev;

    #[tokio::test]
    async fn test_tags() {
        let logctx = dev::test_setup_log("test_tags");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        let (admin, _) = fixtures::user(&db, "admin").await;
        let (member, _) = fixtures::user(&db, "member").await;
        let team = fixtures::team(&db, admin.user_id).await;
        fixtures::join(&db, admin.user_id, team.team_id, member.user_id).await;
        let collection =
            fixtures::collection(&db, admin.user_id, team.team_id).await;
        let device =
            fixtures::device(&db, admin.user_id, collection.collection_id, 42)
                .await;

        let target = TagTarget::Device {
            collection_id: collection.collection_id,
            device_id: device.device_id,
        };
        store
            .update_tag(admin.user_id, &target, "Location", "  roof ")
            .await
            .unwrap();
        assert_eq!(
            store
                .retrieve_tag(member.user_id, &target, "LOCATION")
                .await
                .unwrap(),
            "roof"
        );
        assert_eq!(
            store.retrieve_tag(member.user_id, &target, "name").await.unwrap(),
            ""
        );
        // The entity's own reads see the same tags.
        let reread = store
            .retrieve_device(member.user_id, collection.collection_id, device.device_id)
            .await
            .unwrap();
        assert_eq!(reread.tags.get("location"), "roof");

        // Members read, admins write.
        assert_matches!(
            store.update_tag(member.user_id, &target, "location", "").await,
            Err(Error::AccessDenied { .. })
        );
        store.update_tag(admin.user_id, &target, "location", "").await.unwrap();
        assert!(store
            .retrieve_tags(member.user_id, &target)
            .await
            .unwrap()
            .is_empty());

        let team_target = TagTarget::Team(team.team_id);
        store
            .update_tag(admin.user_id, &team_target, "name", "ops")
            .await
            .unwrap();
        assert_eq!(
            store
                .retrieve_team(member.user_id, team.team_id)
                .await
                .unwrap()
                .tags
                .get("name"),
            "ops"
        );

        // A device addressed through the wrong collection does not exist.
        let other = fixtures::collection(&db, admin.user_id, team.team_id).await;
        let misplaced = TagTarget::Device {
            collection_id: other.collection_id,
            device_id: device.device_id,
        };
        assert_matches!(
            store.retrieve_tags(admin.user_id, &misplaced).await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Device, .. })
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_token_tags() {
        let logctx = dev::test_setup_log("test_token_tags");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        let (owner, _) = fixtures::user(&db, "owner").await;
        let (other, _) = fixtures::user(&db, "other").await;
        fixtures::token(&db, owner.user_id, "tok").await;

        let target = TagTarget::Token(String::from("tok"));
        store.update_tag(owner.user_id, &target, "ci", "yes").await.unwrap();
        assert_eq!(
            store.retrieve_tag(owner.user_id, &target, "ci").await.unwrap(),
            "yes"
        );
        assert_matches!(
            store.retrieve_tag(other.user_id, &target, "ci").await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Token, .. })
        );
        assert_matches!(
            store.update_tag(other.user_id, &target, "ci", "no").await,
            Err(Error::ObjectNotFound { .. })
        );
        logctx.cleanup_successful();
    }
}
