// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`CollectionStore`] methods on collections

use super::authz;
use super::SqlStore;
use crate::db::pool_connection::sql;
use crate::db::pool_connection::DbConnection;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Integer;
use diesel::sql_types::Nullable;
use diesel::sql_types::Text;
use diesel::QueryResult;
use diesel::RunQueryDsl;
use horde_common::api::external::CreateResult;
use horde_common::api::external::DeleteResult;
use horde_common::api::external::ListResultVec;
use horde_common::api::external::LookupResult;
use horde_common::api::external::LookupType;
use horde_common::api::external::ResourceType;
use horde_common::api::external::UpdateResult;
use horde_common::key::Key;
use horde_db_model::key_to_column;
use horde_db_model::Collection;
use horde_db_model::CollectionRow;

const COLLECTION_COLUMNS: &str = "collection_id, team_id, field_mask, \
    firmware_current_id, firmware_target_id, firmware_management, \
    CAST(tags AS TEXT) AS tags";

pub(crate) const SELECT_ALL_COLLECTIONS: &str = "SELECT collection_id, \
    team_id, field_mask, firmware_current_id, firmware_target_id, \
    firmware_management, CAST(tags AS TEXT) AS tags FROM collection \
    ORDER BY collection_id";

pub(crate) fn insert_collection_row(
    conn: &mut DbConnection,
    row: &CollectionRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "INSERT INTO collection (collection_id, team_id, field_mask, \
         firmware_current_id, firmware_target_id, firmware_management, \
         tags) VALUES ($1, $2, $3, $4, $5, $6, CAST($7 AS JSONB))",
    )
    .bind::<BigInt, _>(row.collection_id)
    .bind::<BigInt, _>(row.team_id)
    .bind::<Integer, _>(row.field_mask)
    .bind::<Nullable<BigInt>, _>(row.firmware_current_id)
    .bind::<Nullable<BigInt>, _>(row.firmware_target_id)
    .bind::<Text, _>(row.firmware_management.clone())
    .bind::<Text, _>(row.tags.clone())
    .execute(conn)
}

fn collection_row(collection: &Collection) -> CollectionRow {
    CollectionRow {
        collection_id: collection.collection_id.as_i64(),
        team_id: collection.team_id.as_i64(),
        field_mask: collection.field_mask.bits() as i32,
        firmware_current_id: key_to_column(collection.firmware.current_id),
        firmware_target_id: key_to_column(collection.firmware.target_id),
        firmware_management: collection.firmware.management.code().to_owned(),
        tags: collection.tags.to_json(),
    }
}

#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Creates a collection in a team the acting user administers.
    async fn create_collection(
        &self,
        user_id: Key,
        collection: &Collection,
    ) -> CreateResult<()>;

    async fn retrieve_collection(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> LookupResult<Collection>;

    /// Lists the collections of every team the acting user is a member of.
    async fn list_collections(&self, user_id: Key)
        -> ListResultVec<Collection>;

    /// Updates a collection.  Changing `team_id` moves the collection, which
    /// requires admin rights in both teams.
    async fn update_collection(
        &self,
        user_id: Key,
        collection: &Collection,
    ) -> UpdateResult<()>;

    async fn delete_collection(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> DeleteResult;
}

#[async_trait]
impl CollectionStore for SqlStore {
    async fn create_collection(
        &self,
        user_id: Key,
        collection: &Collection,
    ) -> CreateResult<()> {
        let row = collection_row(collection);
        let collection_id = collection.collection_id;
        let team_id = collection.team_id;
        let firmware = collection.firmware;
        self.transaction(
            ResourceType::Collection,
            LookupType::ById(collection_id),
            move |conn| {
                authz::require_team_admin(conn, user_id, team_id)?;
                // A new collection has no firmware of its own yet.
                authz::require_firmware_in_collection(
                    conn,
                    collection_id,
                    firmware.current_id,
                )?;
                authz::require_firmware_in_collection(
                    conn,
                    collection_id,
                    firmware.target_id,
                )?;
                insert_collection_row(conn, &row)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_collection(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> LookupResult<Collection> {
        let row = self
            .transaction(
                ResourceType::Collection,
                LookupType::ById(collection_id),
                move |conn| {
                    authz::require_collection_member(
                        conn,
                        user_id,
                        collection_id,
                    )?;
                    Ok(sql(
                        conn,
                        &format!(
                            "SELECT {} FROM collection \
                             WHERE collection_id = $1",
                            COLLECTION_COLUMNS
                        ),
                    )
                    .bind::<BigInt, _>(collection_id.as_i64())
                    .get_result::<CollectionRow>(conn)?)
                },
            )
            .await?;
        Collection::try_from(row)
    }

    async fn list_collections(
        &self,
        user_id: Key,
    ) -> ListResultVec<Collection> {
        let rows = self
            .transaction(
                ResourceType::Collection,
                LookupType::ById(user_id),
                move |conn| {
                    Ok(sql(
                        conn,
                        &format!(
                            "SELECT {} FROM collection WHERE team_id IN \
                             (SELECT team_id FROM member WHERE user_id = $1) \
                             ORDER BY collection_id",
                            COLLECTION_COLUMNS
                        ),
                    )
                    .bind::<BigInt, _>(user_id.as_i64())
                    .load::<CollectionRow>(conn)?)
                },
            )
            .await?;
        rows.into_iter().map(Collection::try_from).collect()
    }

    async fn update_collection(
        &self,
        user_id: Key,
        collection: &Collection,
    ) -> UpdateResult<()> {
        let row = collection_row(collection);
        let collection_id = collection.collection_id;
        let team_id = collection.team_id;
        let firmware = collection.firmware;
        self.transaction(
            ResourceType::Collection,
            LookupType::ById(collection_id),
            move |conn| {
                let current_team =
                    authz::require_collection_admin(conn, user_id, collection_id)?;
                if current_team != team_id {
                    authz::require_team_admin(conn, user_id, team_id)?;
                }
                authz::require_firmware_in_collection(
                    conn,
                    collection_id,
                    firmware.current_id,
                )?;
                authz::require_firmware_in_collection(
                    conn,
                    collection_id,
                    firmware.target_id,
                )?;
                sql(
                    conn,
                    "UPDATE collection SET team_id = $1, field_mask = $2, \
                     firmware_current_id = $3, firmware_target_id = $4, \
                     firmware_management = $5, tags = CAST($6 AS JSONB) \
                     WHERE collection_id = $7",
                )
                .bind::<BigInt, _>(row.team_id)
                .bind::<Integer, _>(row.field_mask)
                .bind::<Nullable<BigInt>, _>(row.firmware_current_id)
                .bind::<Nullable<BigInt>, _>(row.firmware_target_id)
                .bind::<Text, _>(row.firmware_management)
                .bind::<Text, _>(row.tags)
                .bind::<BigInt, _>(row.collection_id)
                .execute(conn)?;
                Ok(())
            },
        )
        .await
    }

    async fn delete_collection(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> DeleteResult {
        self.transaction(
            ResourceType::Collection,
            LookupType::ById(collection_id),
            move |conn| {
                authz::require_collection_admin(conn, user_id, collection_id)?;
                sql(conn, "DELETE FROM collection WHERE collection_id = $1")
                    .bind::<BigInt, _>(collection_id.as_i64())
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
    use horde_common::api::external::Error;
    use horde_db_model::FieldMask;
    use horde_db_model::FirmwareManagement;
    use horde_db_model::RoleId;
    use horde_test_utils::dev;

    #[tokio::test]
    async fn test_collection_access() {
        let logctx = dev::test_setup_log("test_collection_access");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        let (admin, _) = fixtures::user(&db, "admin").await;
        let (member, _) = fixtures::user(&db, "member").await;
        let (outsider, _) = fixtures::user(&db, "outsider").await;
        let team = fixtures::team(&db, admin.user_id).await;
        fixtures::join(&db, admin.user_id, team.team_id, member.user_id).await;

        let mut collection =
            fixtures::collection(&db, admin.user_id, team.team_id).await;
        assert_eq!(
            store
                .retrieve_collection(member.user_id, collection.collection_id)
                .await
                .unwrap(),
            collection
        );
        assert_matches!(
            store
                .retrieve_collection(outsider.user_id, collection.collection_id)
                .await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Collection, .. })
        );
        assert_eq!(
            store.list_collections(member.user_id).await.unwrap(),
            [collection.clone()]
        );
        assert!(store.list_collections(outsider.user_id).await.unwrap().is_empty());

        collection.field_mask = FieldMask::IMSI | FieldMask::MSISDN;
        collection.firmware.management = FirmwareManagement::Device;
        collection.tags.set("name", "meters");
        assert_matches!(
            store.update_collection(member.user_id, &collection).await,
            Err(Error::AccessDenied { .. })
        );
        store.update_collection(admin.user_id, &collection).await.unwrap();
        assert_eq!(
            store
                .retrieve_collection(member.user_id, collection.collection_id)
                .await
                .unwrap(),
            collection
        );

        // Firmware references must name firmware in the collection.
        let mut bad = collection.clone();
        bad.firmware.target_id = db.new_id(horde_common::key::KeyKind::Firmware).await;
        assert_matches!(
            store.update_collection(admin.user_id, &bad).await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Firmware, .. })
        );

        assert_matches!(
            store
                .delete_collection(member.user_id, collection.collection_id)
                .await,
            Err(Error::AccessDenied { .. })
        );
        store
            .delete_collection(admin.user_id, collection.collection_id)
            .await
            .unwrap();
        assert_matches!(
            store
                .retrieve_collection(admin.user_id, collection.collection_id)
                .await,
            Err(Error::ObjectNotFound { .. })
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_collection_move() {
        let logctx = dev::test_setup_log("test_collection_move");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        let (admin, _) = fixtures::user(&db, "admin").await;
        let (other, _) = fixtures::user(&db, "other").await;
        let source = fixtures::team(&db, admin.user_id).await;
        let destination = fixtures::team(&db, other.user_id).await;
        let mut collection =
            fixtures::collection(&db, admin.user_id, source.team_id).await;

        // Moving needs admin rights in the destination too.
        collection.team_id = destination.team_id;
        assert_matches!(
            store.update_collection(admin.user_id, &collection).await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Team, .. })
        );
        fixtures::join(&db, other.user_id, destination.team_id, admin.user_id)
            .await;
        assert_matches!(
            store.update_collection(admin.user_id, &collection).await,
            Err(Error::AccessDenied { type_name: ResourceType::Team, .. })
        );
        store
            .update_member_role(
                other.user_id,
                destination.team_id,
                admin.user_id,
                RoleId::Admin,
            )
            .await
            .unwrap();
        store.update_collection(admin.user_id, &collection).await.unwrap();
        assert_eq!(
            store
                .retrieve_collection(other.user_id, collection.collection_id)
                .await
                .unwrap()
                .team_id,
            destination.team_id
        );
        logctx.cleanup_successful();
    }
}
