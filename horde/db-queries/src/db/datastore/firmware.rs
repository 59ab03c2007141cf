// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`FirmwareStore`] methods on firmware image metadata

use super::authz;
use super::ExpectRows;
use super::SqlStore;
use crate::db::error::TransactionError;
use crate::db::pool_connection::sql;
use crate::db::pool_connection::DbConnection;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Nullable;
use diesel::sql_types::Text;
use diesel::sql_types::Timestamp;
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
use horde_db_model::to_column_time;
use horde_db_model::Firmware;
use horde_db_model::FirmwareRow;
use horde_db_model::FirmwareUse;

const FIRMWARE_COLUMNS: &str = "firmware_id, collection_id, filename, \
    version, length, sha256, created, CAST(tags AS TEXT) AS tags";

pub(crate) const SELECT_ALL_FIRMWARE: &str = "SELECT firmware_id, \
    collection_id, filename, version, length, sha256, created, \
    CAST(tags AS TEXT) AS tags FROM firmware ORDER BY firmware_id";

pub(crate) fn insert_firmware_row(
    conn: &mut DbConnection,
    row: &FirmwareRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "INSERT INTO firmware (firmware_id, collection_id, filename, \
         version, length, sha256, created, tags) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, CAST($8 AS JSONB))",
    )
    .bind::<BigInt, _>(row.firmware_id)
    .bind::<BigInt, _>(row.collection_id)
    .bind::<Text, _>(row.filename.clone())
    .bind::<Text, _>(row.version.clone())
    .bind::<BigInt, _>(row.length)
    .bind::<Text, _>(row.sha256.clone())
    .bind::<Timestamp, _>(row.created)
    .bind::<Text, _>(row.tags.clone())
    .execute(conn)
}

#[derive(QueryableByName)]
struct DeviceIdRow {
    #[diesel(sql_type = BigInt)]
    device_id: i64,
}

#[derive(QueryableByName)]
struct CollectionUseRow {
    #[diesel(sql_type = Nullable<BigInt>)]
    #[allow(dead_code)]
    firmware_id: Option<i64>,
}

#[derive(QueryableByName)]
struct FirmwareIdRow {
    #[diesel(sql_type = BigInt)]
    #[allow(dead_code)]
    firmware_id: i64,
}

fn select_firmware(
    conn: &mut DbConnection,
    collection_id: Key,
    firmware_id: Key,
) -> Result<FirmwareRow, TransactionError> {
    Ok(sql(
        conn,
        &format!(
            "SELECT {} FROM firmware \
             WHERE firmware_id = $1 AND collection_id = $2",
            FIRMWARE_COLUMNS
        ),
    )
    .bind::<BigInt, _>(firmware_id.as_i64())
    .bind::<BigInt, _>(collection_id.as_i64())
    .get_result::<FirmwareRow>(conn)?)
}

fn device_ids(
    conn: &mut DbConnection,
    column: &str,
    firmware_id: Key,
) -> Result<Vec<Key>, TransactionError> {
    let rows = sql(
        conn,
        &format!(
            "SELECT device_id FROM device WHERE {} = $1 ORDER BY device_id",
            column
        ),
    )
    .bind::<BigInt, _>(firmware_id.as_i64())
    .load::<DeviceIdRow>(conn)?;
    Ok(rows.into_iter().map(|r| Key::from_i64(r.device_id)).collect())
}

#[async_trait]
pub trait FirmwareStore: Send + Sync {
    /// Records a new image.  The SHA-256 digest and the version must both be
    /// new to the collection.
    async fn create_firmware(
        &self,
        user_id: Key,
        firmware: &Firmware,
    ) -> CreateResult<()>;

    async fn retrieve_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware_id: Key,
    ) -> LookupResult<Firmware>;

    async fn retrieve_firmware_by_version(
        &self,
        user_id: Key,
        collection_id: Key,
        version: &str,
    ) -> LookupResult<Firmware>;

    async fn list_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> ListResultVec<Firmware>;

    /// Updates the version, file name and tags of an image.  The image
    /// itself never changes.
    async fn update_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware: &Firmware,
    ) -> UpdateResult<()>;

    /// Deletes an image that neither the collection nor any device refers
    /// to.
    async fn delete_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware_id: Key,
    ) -> DeleteResult;

    /// Lists the devices currently running, or targeted with, an image.
    async fn retrieve_firmware_in_use(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware_id: Key,
    ) -> LookupResult<FirmwareUse>;
}

#[async_trait]
impl FirmwareStore for SqlStore {
    async fn create_firmware(
        &self,
        user_id: Key,
        firmware: &Firmware,
    ) -> CreateResult<()> {
        let row = FirmwareRow {
            firmware_id: firmware.firmware_id.as_i64(),
            collection_id: firmware.collection_id.as_i64(),
            filename: firmware.filename.clone(),
            version: firmware.version.clone(),
            length: firmware.length,
            sha256: firmware.sha256.clone(),
            created: to_column_time(&firmware.created),
            tags: firmware.tags.to_json(),
        };
        let collection_id = firmware.collection_id;
        self.transaction(
            ResourceType::Firmware,
            LookupType::ByName(firmware.version.clone()),
            move |conn| {
                authz::require_collection_admin(conn, user_id, collection_id)?;
                let duplicate = sql(
                    conn,
                    "SELECT firmware_id FROM firmware \
                     WHERE collection_id = $1 AND sha256 = $2",
                )
                .bind::<BigInt, _>(row.collection_id)
                .bind::<Text, _>(row.sha256.clone())
                .get_result::<FirmwareIdRow>(conn)
                .optional()?;
                if duplicate.is_some() {
                    return Err(Error::ShaAlreadyExists {
                        sha256: row.sha256.clone(),
                    }
                    .into());
                }
                insert_firmware_row(conn, &row)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware_id: Key,
    ) -> LookupResult<Firmware> {
        let row = self
            .transaction(
                ResourceType::Firmware,
                LookupType::ById(firmware_id),
                move |conn| {
                    authz::require_collection_member(
                        conn,
                        user_id,
                        collection_id,
                    )?;
                    select_firmware(conn, collection_id, firmware_id)
                },
            )
            .await?;
        Firmware::try_from(row)
    }

    async fn retrieve_firmware_by_version(
        &self,
        user_id: Key,
        collection_id: Key,
        version: &str,
    ) -> LookupResult<Firmware> {
        let version = version.to_owned();
        let row = self
            .transaction(
                ResourceType::Firmware,
                LookupType::ByName(version.clone()),
                move |conn| {
                    authz::require_collection_member(
                        conn,
                        user_id,
                        collection_id,
                    )?;
                    Ok(sql(
                        conn,
                        &format!(
                            "SELECT {} FROM firmware \
                             WHERE collection_id = $1 AND version = $2",
                            FIRMWARE_COLUMNS
                        ),
                    )
                    .bind::<BigInt, _>(collection_id.as_i64())
                    .bind::<Text, _>(version)
                    .get_result::<FirmwareRow>(conn)?)
                },
            )
            .await?;
        Firmware::try_from(row)
    }

    async fn list_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> ListResultVec<Firmware> {
        let rows = self
            .transaction(
                ResourceType::Firmware,
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
                            "SELECT {} FROM firmware \
                             WHERE collection_id = $1 ORDER BY created, \
                             firmware_id",
                            FIRMWARE_COLUMNS
                        ),
                    )
                    .bind::<BigInt, _>(collection_id.as_i64())
                    .load::<FirmwareRow>(conn)?)
                },
            )
            .await?;
        rows.into_iter().map(Firmware::try_from).collect()
    }

    async fn update_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware: &Firmware,
    ) -> UpdateResult<()> {
        let firmware_id = firmware.firmware_id;
        let version = firmware.version.clone();
        let filename = firmware.filename.clone();
        let tags = firmware.tags.to_json();
        self.transaction(
            ResourceType::Firmware,
            LookupType::ByName(version.clone()),
            move |conn| {
                authz::require_collection_admin(conn, user_id, collection_id)?;
                sql(
                    conn,
                    "UPDATE firmware SET version = $1, filename = $2, \
                     tags = CAST($3 AS JSONB) \
                     WHERE firmware_id = $4 AND collection_id = $5",
                )
                .bind::<Text, _>(version)
                .bind::<Text, _>(filename)
                .bind::<Text, _>(tags)
                .bind::<BigInt, _>(firmware_id.as_i64())
                .bind::<BigInt, _>(collection_id.as_i64())
                .execute(conn)?
                .or_not_found(Error::not_found_by_id(
                    ResourceType::Firmware,
                    firmware_id,
                ))
            },
        )
        .await
    }

    async fn delete_firmware(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware_id: Key,
    ) -> DeleteResult {
        self.transaction(
            ResourceType::Firmware,
            LookupType::ById(firmware_id),
            move |conn| {
                authz::require_collection_admin(conn, user_id, collection_id)?;
                select_firmware(conn, collection_id, firmware_id)?;
                // The collection's references are not foreign keys.
                let in_use = sql(
                    conn,
                    "SELECT firmware_current_id AS firmware_id \
                     FROM collection WHERE collection_id = $1 AND \
                     (firmware_current_id = $2 OR firmware_target_id = $2)",
                )
                .bind::<BigInt, _>(collection_id.as_i64())
                .bind::<BigInt, _>(firmware_id.as_i64())
                .load::<CollectionUseRow>(conn)?;
                if !in_use.is_empty() {
                    return Err(Error::referenced(
                        ResourceType::Firmware,
                        &firmware_id.to_string(),
                    )
                    .into());
                }
                sql(conn, "DELETE FROM firmware WHERE firmware_id = $1")
                    .bind::<BigInt, _>(firmware_id.as_i64())
                    .execute(conn)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_firmware_in_use(
        &self,
        user_id: Key,
        collection_id: Key,
        firmware_id: Key,
    ) -> LookupResult<FirmwareUse> {
        self.transaction(
            ResourceType::Firmware,
            LookupType::ById(firmware_id),
            move |conn| {
                authz::require_collection_member(conn, user_id, collection_id)?;
                select_firmware(conn, collection_id, firmware_id)?;
                Ok(FirmwareUse {
                    firmware_id,
                    current: device_ids(conn, "fw_current_id", firmware_id)?,
                    targeted: device_ids(conn, "fw_target_id", firmware_id)?,
                })
            },
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::datastore::CollectionStore;
    use crate::db::datastore::DeviceStore;
    use crate::db::pub_test_utils::fixtures;
    use crate::db::pub_test_utils::TestDatabase;
    use assert_matches::assert_matches;
    use horde_db_model::FirmwareManagement;
    use horde_test_utils::dev;

    #[tokio::test]
    async fn test_firmware_uniqueness() {
        let logctx = dev::test_setup_log("test_firmware_uniqueness");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        let (admin, team) = fixtures::user(&db, "admin").await;
        let collection =
            fixtures::collection(&db, admin.user_id, team.team_id).await;
        let other = fixtures::collection(&db, admin.user_id, team.team_id).await;
        let first = fixtures::firmware(
            &db,
            admin.user_id,
            collection.collection_id,
            "1.0.0",
            "aa",
        )
        .await;

        let mut same_image = fixtures::firmware_model(
            &db,
            collection.collection_id,
            "1.0.1",
            "aa",
        )
        .await;
        assert_matches!(
            store.create_firmware(admin.user_id, &same_image).await,
            Err(Error::ShaAlreadyExists { sha256 }) if sha256 == "aa"
        );
        let same_version =
            fixtures::firmware_model(&db, collection.collection_id, "1.0.0", "bb")
                .await;
        assert_matches!(
            store.create_firmware(admin.user_id, &same_version).await,
            Err(Error::ObjectAlreadyExists { type_name: ResourceType::Firmware, .. })
        );

        // Uniqueness is per collection.
        same_image.collection_id = other.collection_id;
        store.create_firmware(admin.user_id, &same_image).await.unwrap();

        assert_eq!(
            store
                .retrieve_firmware_by_version(
                    admin.user_id,
                    collection.collection_id,
                    "1.0.0"
                )
                .await
                .unwrap(),
            first
        );
        assert_matches!(
            store
                .retrieve_firmware(
                    admin.user_id,
                    collection.collection_id,
                    same_image.firmware_id
                )
                .await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Firmware, .. })
        );

        let mut renamed = first.clone();
        renamed.version = String::from("1.0.0-rc");
        renamed.filename = String::from("image.bin");
        store
            .update_firmware(admin.user_id, collection.collection_id, &renamed)
            .await
            .unwrap();
        assert_eq!(
            store
                .list_firmware(admin.user_id, collection.collection_id)
                .await
                .unwrap(),
            [renamed]
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_firmware_in_use() {
        let logctx = dev::test_setup_log("test_firmware_in_use");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        let (admin, team) = fixtures::user(&db, "admin").await;
        let mut collection =
            fixtures::collection(&db, admin.user_id, team.team_id).await;
        let image = fixtures::firmware(
            &db,
            admin.user_id,
            collection.collection_id,
            "2.0",
            "cc",
        )
        .await;

        // Referenced by the collection.
        collection.firmware.target_id = image.firmware_id;
        collection.firmware.management = FirmwareManagement::Collection;
        store.update_collection(admin.user_id, &collection).await.unwrap();
        assert_matches!(
            store
                .delete_firmware(
                    admin.user_id,
                    collection.collection_id,
                    image.firmware_id
                )
                .await,
            Err(Error::Referenced { type_name: ResourceType::Firmware, .. })
        );
        collection.firmware.target_id = Key::UNSET;
        store.update_collection(admin.user_id, &collection).await.unwrap();

        // Referenced by a device.
        let mut device =
            fixtures::device(&db, admin.user_id, collection.collection_id, 77)
                .await;
        device.firmware.current_id = image.firmware_id;
        store.update_device_metadata(&device).await.unwrap();
        assert_eq!(
            store
                .retrieve_firmware_in_use(
                    admin.user_id,
                    collection.collection_id,
                    image.firmware_id
                )
                .await
                .unwrap(),
            FirmwareUse {
                firmware_id: image.firmware_id,
                current: vec![device.device_id],
                targeted: vec![],
            }
        );
        assert_matches!(
            store
                .delete_firmware(
                    admin.user_id,
                    collection.collection_id,
                    image.firmware_id
                )
                .await,
            Err(Error::Referenced { type_name: ResourceType::Firmware, .. })
        );

        device.firmware.current_id = Key::UNSET;
        store.update_device_metadata(&device).await.unwrap();
        store
            .delete_firmware(
                admin.user_id,
                collection.collection_id,
                image.firmware_id,
            )
            .await
            .unwrap();
        logctx.cleanup_successful();
    }
}
