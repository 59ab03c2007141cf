// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::from_column_time;
use crate::impl_code_enum;
use crate::key_from_column;
use crate::Tags;
use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use diesel::sql_types::BigInt;
use diesel::sql_types::Integer;
use diesel::sql_types::Nullable;
use diesel::sql_types::Text;
use diesel::sql_types::Timestamp;
use diesel::QueryableByName;
use horde_common::api::external::Error;
use horde_common::key::Key;
use std::net::Ipv4Addr;

impl_code_enum! {
    /// A device's progress through a firmware update
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub enum FirmwareState {
        #[default]
        Unknown => " ",
        Current => "c",
        Initializing => "i",
        Pending => "p",
        Downloading => "d",
        Completed => "u",
        UpdateFailed => "f",
        TimedOut => "t",
        Reverted => "r",
    }
}

impl FirmwareState {
    /// Whether the update ended in an error the device will not recover from
    /// on its own.
    pub fn is_terminal_error(&self) -> bool {
        matches!(
            self,
            FirmwareState::UpdateFailed
                | FirmwareState::TimedOut
                | FirmwareState::Reverted
        )
    }
}

/// What the network side last reported about a device
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetworkMetadata {
    pub apn_id: Option<i32>,
    pub nas_id: Option<i32>,
    pub allocated_ip: Option<Ipv4Addr>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub cell_id: Option<i64>,
}

/// Firmware bookkeeping for one device
///
/// The `current_id`/`target_id` keys are [`Key::UNSET`] when not set; when
/// set they must name firmware in the device's collection.  The remaining
/// fields are reported by the device itself.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FirmwareMetadata {
    pub current_id: Key,
    pub target_id: Key,
    pub state: FirmwareState,
    pub state_message: Option<String>,
    pub version: Option<String>,
    pub serial_number: Option<String>,
    pub model_number: Option<String>,
    pub manufacturer: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Device {
    pub device_id: Key,
    pub collection_id: Key,
    pub imsi: i64,
    pub imei: i64,
    pub network: NetworkMetadata,
    pub firmware: FirmwareMetadata,
    pub tags: Tags,
}

#[derive(Clone, Debug, QueryableByName)]
pub struct DeviceRow {
    #[diesel(sql_type = BigInt)]
    pub device_id: i64,
    #[diesel(sql_type = BigInt)]
    pub collection_id: i64,
    #[diesel(sql_type = BigInt)]
    pub imsi: i64,
    #[diesel(sql_type = BigInt)]
    pub imei: i64,
    #[diesel(sql_type = Nullable<Integer>)]
    pub net_apn_id: Option<i32>,
    #[diesel(sql_type = Nullable<Integer>)]
    pub net_nas_id: Option<i32>,
    #[diesel(sql_type = Nullable<Text>)]
    pub net_allocated_ip: Option<String>,
    #[diesel(sql_type = Nullable<Timestamp>)]
    pub net_allocated_at: Option<NaiveDateTime>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub net_cell_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub fw_current_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub fw_target_id: Option<i64>,
    #[diesel(sql_type = Text)]
    pub fw_state: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub fw_state_message: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub fw_version: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub fw_serial_number: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub fw_model_number: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub fw_manufacturer: Option<String>,
    #[diesel(sql_type = Text)]
    pub tags: String,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let allocated_ip = row
            .net_allocated_ip
            .as_deref()
            .map(|ip| {
                ip.parse::<Ipv4Addr>().map_err(|_| {
                    Error::internal_error(&format!(
                        "device {}: malformed address {:?}",
                        row.device_id, ip
                    ))
                })
            })
            .transpose()?;
        let state = FirmwareState::from_code(&row.fw_state).ok_or_else(|| {
            Error::internal_error(&format!(
                "device {}: unknown firmware state {:?}",
                row.device_id, row.fw_state
            ))
        })?;
        Ok(Device {
            device_id: Key::from_i64(row.device_id),
            collection_id: Key::from_i64(row.collection_id),
            imsi: row.imsi,
            imei: row.imei,
            network: NetworkMetadata {
                apn_id: row.net_apn_id,
                nas_id: row.net_nas_id,
                allocated_ip,
                allocated_at: row.net_allocated_at.map(from_column_time),
                cell_id: row.net_cell_id,
            },
            firmware: FirmwareMetadata {
                current_id: key_from_column(row.fw_current_id),
                target_id: key_from_column(row.fw_target_id),
                state,
                state_message: row.fw_state_message,
                version: row.fw_version,
                serial_number: row.fw_serial_number,
                model_number: row.fw_model_number,
                manufacturer: row.fw_manufacturer,
            },
            tags: Tags::from_json(&row.tags)?,
        })
    }
}

/// Entry of the IMSI index used by the transport listeners
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceLookup {
    pub imsi: i64,
    pub imei: i64,
    pub device_id: Key,
    pub collection_id: Key,
}

#[derive(Clone, Debug, QueryableByName)]
pub struct DeviceLookupRow {
    #[diesel(sql_type = BigInt)]
    pub imsi: i64,
    #[diesel(sql_type = BigInt)]
    pub imei: i64,
    #[diesel(sql_type = BigInt)]
    pub device_id: i64,
    #[diesel(sql_type = BigInt)]
    pub collection_id: i64,
}

impl From<DeviceLookupRow> for DeviceLookup {
    fn from(row: DeviceLookupRow) -> Self {
        DeviceLookup {
            imsi: row.imsi,
            imei: row.imei,
            device_id: Key::from_i64(row.device_id),
            collection_id: Key::from_i64(row.collection_id),
        }
    }
}
