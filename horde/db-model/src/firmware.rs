// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::from_column_time;
use crate::Tags;
use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use diesel::sql_types::BigInt;
use diesel::sql_types::Text;
use diesel::sql_types::Timestamp;
use diesel::QueryableByName;
use horde_common::api::external::Error;
use horde_common::key::Key;

/// Metadata for a firmware image
///
/// The image itself lives in the blob store under the same key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Firmware {
    pub firmware_id: Key,
    pub collection_id: Key,
    pub filename: String,
    /// Unique within the collection.
    pub version: String,
    pub length: i64,
    /// Hex encoded, unique within the collection.
    pub sha256: String,
    pub created: DateTime<Utc>,
    pub tags: Tags,
}

#[derive(Clone, Debug, QueryableByName)]
pub struct FirmwareRow {
    #[diesel(sql_type = BigInt)]
    pub firmware_id: i64,
    #[diesel(sql_type = BigInt)]
    pub collection_id: i64,
    #[diesel(sql_type = Text)]
    pub filename: String,
    #[diesel(sql_type = Text)]
    pub version: String,
    #[diesel(sql_type = BigInt)]
    pub length: i64,
    #[diesel(sql_type = Text)]
    pub sha256: String,
    #[diesel(sql_type = Timestamp)]
    pub created: NaiveDateTime,
    #[diesel(sql_type = Text)]
    pub tags: String,
}

impl TryFrom<FirmwareRow> for Firmware {
    type Error = Error;

    fn try_from(row: FirmwareRow) -> Result<Self, Self::Error> {
        Ok(Firmware {
            firmware_id: Key::from_i64(row.firmware_id),
            collection_id: Key::from_i64(row.collection_id),
            filename: row.filename,
            version: row.version,
            length: row.length,
            sha256: row.sha256,
            created: from_column_time(row.created),
            tags: Tags::from_json(&row.tags)?,
        })
    }
}

/// Devices that use a firmware image
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FirmwareUse {
    pub firmware_id: Key,
    /// Devices reporting the image as their current firmware.
    pub current: Vec<Key>,
    /// Devices the image is targeted at.
    pub targeted: Vec<Key>,
}
