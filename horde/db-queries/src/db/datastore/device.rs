// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DeviceStore`] methods on devices and the IMSI index

use super::authz;
use super::ExpectRows;
use super::SqlStore;
use crate::db::error::TransactionError;
use crate::db::pool_connection::sql;
use crate::db::pool_connection::DbConnection;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Integer;
use diesel::sql_types::Nullable;
use diesel::sql_types::Text;
use diesel::sql_types::Timestamp;
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
use horde_db_model::key_to_column;
use horde_db_model::to_column_time;
use horde_db_model::Device;
use horde_db_model::DeviceLookupRow;
use horde_db_model::DeviceRow;

const DEVICE_COLUMNS: &str = "device_id, collection_id, imsi, imei, \
    net_apn_id, net_nas_id, net_allocated_ip, net_allocated_at, \
    net_cell_id, fw_current_id, fw_target_id, fw_state, fw_state_message, \
    fw_version, fw_serial_number, fw_model_number, fw_manufacturer, \
    CAST(tags AS TEXT) AS tags";

pub(crate) const SELECT_ALL_DEVICES: &str = "SELECT device_id, \
    collection_id, imsi, imei, net_apn_id, net_nas_id, net_allocated_ip, \
    net_allocated_at, net_cell_id, fw_current_id, fw_target_id, fw_state, \
    fw_state_message, fw_version, fw_serial_number, fw_model_number, \
    fw_manufacturer, CAST(tags AS TEXT) AS tags FROM device \
    ORDER BY device_id";

pub(crate) const SELECT_ALL_DEVICE_LOOKUPS: &str = "SELECT imsi, imei, \
    device_id, collection_id FROM device_lookup ORDER BY imsi";

pub(crate) fn insert_device_row(
    conn: &mut DbConnection,
    row: &DeviceRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "INSERT INTO device (device_id, collection_id, imsi, imei, \
         net_apn_id, net_nas_id, net_allocated_ip, net_allocated_at, \
         net_cell_id, fw_current_id, fw_target_id, fw_state, \
         fw_state_message, fw_version, fw_serial_number, fw_model_number, \
         fw_manufacturer, tags) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, \
         $10, $11, $12, $13, $14, $15, $16, $17, CAST($18 AS JSONB))",
    )
    .bind::<BigInt, _>(row.device_id)
    .bind::<BigInt, _>(row.collection_id)
    .bind::<BigInt, _>(row.imsi)
    .bind::<BigInt, _>(row.imei)
    .bind::<Nullable<Integer>, _>(row.net_apn_id)
    .bind::<Nullable<Integer>, _>(row.net_nas_id)
    .bind::<Nullable<Text>, _>(row.net_allocated_ip.clone())
    .bind::<Nullable<Timestamp>, _>(row.net_allocated_at)
    .bind::<Nullable<BigInt>, _>(row.net_cell_id)
    .bind::<Nullable<BigInt>, _>(row.fw_current_id)
    .bind::<Nullable<BigInt>, _>(row.fw_target_id)
    .bind::<Text, _>(row.fw_state.clone())
    .bind::<Nullable<Text>, _>(row.fw_state_message.clone())
    .bind::<Nullable<Text>, _>(row.fw_version.clone())
    .bind::<Nullable<Text>, _>(row.fw_serial_number.clone())
    .bind::<Nullable<Text>, _>(row.fw_model_number.clone())
    .bind::<Nullable<Text>, _>(row.fw_manufacturer.clone())
    .bind::<Text, _>(row.tags.clone())
    .execute(conn)
}

pub(crate) fn insert_device_lookup_row(
    conn: &mut DbConnection,
    row: &DeviceLookupRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "INSERT INTO device_lookup (imsi, imei, device_id, collection_id) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind::<BigInt, _>(row.imsi)
    .bind::<BigInt, _>(row.imei)
    .bind::<BigInt, _>(row.device_id)
    .bind::<BigInt, _>(row.collection_id)
    .execute(conn)
}

/// Writes the network and firmware metadata columns of an existing device.
fn update_metadata_row(
    conn: &mut DbConnection,
    row: &DeviceRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "UPDATE device SET net_apn_id = $1, net_nas_id = $2, \
         net_allocated_ip = $3, net_allocated_at = $4, net_cell_id = $5, \
         fw_current_id = $6, fw_target_id = $7, fw_state = $8, \
         fw_state_message = $9, fw_version = $10, fw_serial_number = $11, \
         fw_model_number = $12, fw_manufacturer = $13 WHERE device_id = $14",
    )
    .bind::<Nullable<Integer>, _>(row.net_apn_id)
    .bind::<Nullable<Integer>, _>(row.net_nas_id)
    .bind::<Nullable<Text>, _>(row.net_allocated_ip.clone())
    .bind::<Nullable<Timestamp>, _>(row.net_allocated_at)
    .bind::<Nullable<BigInt>, _>(row.net_cell_id)
    .bind::<Nullable<BigInt>, _>(row.fw_current_id)
    .bind::<Nullable<BigInt>, _>(row.fw_target_id)
    .bind::<Text, _>(row.fw_state.clone())
    .bind::<Nullable<Text>, _>(row.fw_state_message.clone())
    .bind::<Nullable<Text>, _>(row.fw_version.clone())
    .bind::<Nullable<Text>, _>(row.fw_serial_number.clone())
    .bind::<Nullable<Text>, _>(row.fw_model_number.clone())
    .bind::<Nullable<Text>, _>(row.fw_manufacturer.clone())
    .bind::<BigInt, _>(row.device_id)
    .execute(conn)
}

fn device_row(device: &Device) -> DeviceRow {
    DeviceRow {
        device_id: device.device_id.as_i64(),
        collection_id: device.collection_id.as_i64(),
        imsi: device.imsi,
        imei: device.imei,
        net_apn_id: device.network.apn_id,
        net_nas_id: device.network.nas_id,
        net_allocated_ip: device.network.allocated_ip.map(|ip| ip.to_string()),
        net_allocated_at: device.network.allocated_at.as_ref().map(to_column_time),
        net_cell_id: device.network.cell_id,
        fw_current_id: key_to_column(device.firmware.current_id),
        fw_target_id: key_to_column(device.firmware.target_id),
        fw_state: device.firmware.state.code().to_owned(),
        fw_state_message: device.firmware.state_message.clone(),
        fw_version: device.firmware.version.clone(),
        fw_serial_number: device.firmware.serial_number.clone(),
        fw_model_number: device.firmware.model_number.clone(),
        fw_manufacturer: device.firmware.manufacturer.clone(),
        tags: device.tags.to_json(),
    }
}

fn lookup_row(device: &Device) -> DeviceLookupRow {
    DeviceLookupRow {
        imsi: device.imsi,
        imei: device.imei,
        device_id: device.device_id.as_i64(),
        collection_id: device.collection_id.as_i64(),
    }
}

/// Loads a device, which must live in `collection_id`.
fn select_device(
    conn: &mut DbConnection,
    collection_id: Key,
    device_id: Key,
) -> Result<DeviceRow, TransactionError> {
    Ok(sql(
        conn,
        &format!(
            "SELECT {} FROM device \
             WHERE device_id = $1 AND collection_id = $2",
            DEVICE_COLUMNS
        ),
    )
    .bind::<BigInt, _>(device_id.as_i64())
    .bind::<BigInt, _>(collection_id.as_i64())
    .get_result::<DeviceRow>(conn)?)
}

/// Requires the firmware a device points at to live in its collection.
fn require_device_firmware(
    conn: &mut DbConnection,
    device: &DeviceRow,
) -> Result<(), TransactionError> {
    let collection_id = Key::from_i64(device.collection_id);
    for firmware_id in
        [device.fw_current_id, device.fw_target_id].into_iter().flatten()
    {
        authz::require_firmware_in_collection(
            conn,
            collection_id,
            Key::from_i64(firmware_id),
        )?;
    }
    Ok(())
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Creates a device in `device.collection_id`.  IMSI and IMEI must be
    /// unused.
    async fn create_device(&self, user_id: Key, device: &Device)
        -> CreateResult<()>;

    async fn retrieve_device(
        &self,
        user_id: Key,
        collection_id: Key,
        device_id: Key,
    ) -> LookupResult<Device>;

    /// Looks up a device by IMSI for the transport listeners, without an
    /// acting user.
    async fn retrieve_device_by_imsi(&self, imsi: i64) -> LookupResult<Device>;

    async fn list_devices(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> ListResultVec<Device>;

    /// Updates a device currently in `collection_id`.  When
    /// `device.collection_id` differs the device moves, which requires admin
    /// rights on both collections.
    async fn update_device(
        &self,
        user_id: Key,
        collection_id: Key,
        device: &Device,
    ) -> UpdateResult<()>;

    async fn delete_device(
        &self,
        user_id: Key,
        collection_id: Key,
        device_id: Key,
    ) -> DeleteResult;

    /// Records network and firmware metadata reported for a device.  This is
    /// done on behalf of the device itself, so there is no acting user.
    async fn update_device_metadata(&self, device: &Device)
        -> UpdateResult<()>;
}

#[async_trait]
impl DeviceStore for SqlStore {
    async fn create_device(
        &self,
        user_id: Key,
        device: &Device,
    ) -> CreateResult<()> {
        let row = device_row(device);
        let lookup = lookup_row(device);
        let collection_id = device.collection_id;
        self.transaction(
            ResourceType::Device,
            LookupType::ById(device.device_id),
            move |conn| {
                authz::require_collection_admin(conn, user_id, collection_id)?;
                require_device_firmware(conn, &row)?;
                insert_device_row(conn, &row)?;
                insert_device_lookup_row(conn, &lookup)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_device(
        &self,
        user_id: Key,
        collection_id: Key,
        device_id: Key,
    ) -> LookupResult<Device> {
        let row = self
            .transaction(
                ResourceType::Device,
                LookupType::ById(device_id),
                move |conn| {
                    authz::require_collection_member(
                        conn,
                        user_id,
                        collection_id,
                    )?;
                    select_device(conn, collection_id, device_id)
                },
            )
            .await?;
        Device::try_from(row)
    }

    async fn retrieve_device_by_imsi(&self, imsi: i64) -> LookupResult<Device> {
        let row = self
            .transaction(
                ResourceType::Device,
                LookupType::ByImsi(imsi),
                move |conn| {
                    Ok(sql(
                        conn,
                        &format!(
                            "SELECT {} FROM device WHERE device_id = \
                             (SELECT device_id FROM device_lookup \
                             WHERE imsi = $1)",
                            DEVICE_COLUMNS
                        ),
                    )
                    .bind::<BigInt, _>(imsi)
                    .get_result::<DeviceRow>(conn)?)
                },
            )
            .await?;
        Device::try_from(row)
    }

    async fn list_devices(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> ListResultVec<Device> {
        let rows = self
            .transaction(
                ResourceType::Device,
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
                            "SELECT {} FROM device WHERE collection_id = $1 \
                             ORDER BY device_id",
                            DEVICE_COLUMNS
                        ),
                    )
                    .bind::<BigInt, _>(collection_id.as_i64())
                    .load::<DeviceRow>(conn)?)
                },
            )
            .await?;
        rows.into_iter().map(Device::try_from).collect()
    }

    async fn update_device(
        &self,
        user_id: Key,
        collection_id: Key,
        device: &Device,
    ) -> UpdateResult<()> {
        let row = device_row(device);
        let lookup = lookup_row(device);
        let device_id = device.device_id;
        let destination = device.collection_id;
        self.transaction(
            ResourceType::Device,
            LookupType::ById(device_id),
            move |conn| {
                authz::require_collection_admin(conn, user_id, collection_id)?;
                select_device(conn, collection_id, device_id)?;
                if destination != collection_id {
                    authz::require_collection_admin(
                        conn,
                        user_id,
                        destination,
                    )?;
                }
                require_device_firmware(conn, &row)?;
                // The index row goes first: it references the device's
                // collection, not the other way round.
                sql(conn, "DELETE FROM device_lookup WHERE device_id = $1")
                    .bind::<BigInt, _>(row.device_id)
                    .execute(conn)?;
                sql(
                    conn,
                    "UPDATE device SET collection_id = $1, imsi = $2, \
                     imei = $3, tags = CAST($4 AS JSONB) WHERE device_id = $5",
                )
                .bind::<BigInt, _>(row.collection_id)
                .bind::<BigInt, _>(row.imsi)
                .bind::<BigInt, _>(row.imei)
                .bind::<Text, _>(row.tags.clone())
                .bind::<BigInt, _>(row.device_id)
                .execute(conn)?;
                update_metadata_row(conn, &row)?;
                insert_device_lookup_row(conn, &lookup)?;
                Ok(())
            },
        )
        .await
    }

    async fn delete_device(
        &self,
        user_id: Key,
        collection_id: Key,
        device_id: Key,
    ) -> DeleteResult {
        self.transaction(
            ResourceType::Device,
            LookupType::ById(device_id),
            move |conn| {
                authz::require_collection_admin(conn, user_id, collection_id)?;
                sql(conn, "DELETE FROM device_lookup WHERE device_id = $1")
                    .bind::<BigInt, _>(device_id.as_i64())
                    .execute(conn)?;
                sql(
                    conn,
                    "DELETE FROM device \
                     WHERE device_id = $1 AND collection_id = $2",
                )
                .bind::<BigInt, _>(device_id.as_i64())
                .bind::<BigInt, _>(collection_id.as_i64())
                .execute(conn)?
                .or_not_found(Error::not_found_by_id(
                    ResourceType::Device,
                    device_id,
                ))
            },
        )
        .await
    }

    async fn update_device_metadata(
        &self,
        device: &Device,
    ) -> UpdateResult<()> {
        let row = device_row(device);
        let device_id = device.device_id;
        self.transaction(
            ResourceType::Device,
            LookupType::ById(device_id),
            move |conn| {
                require_device_firmware(conn, &row)?;
                update_metadata_row(conn, &row)?.or_not_found(
                    Error::not_found_by_id(ResourceType::Device, device_id),
                )
            },
        )
        .await
    }
}
