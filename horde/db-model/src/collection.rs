// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::impl_code_enum;
use crate::Tags;
use diesel::sql_types::BigInt;
use diesel::sql_types::Integer;
use diesel::sql_types::Nullable;
use diesel::sql_types::Text;
use diesel::QueryableByName;
use horde_common::api::external::Error;
use horde_common::key::Key;
use std::ops::BitOr;

/// Which device identifiers are forwarded with data from a collection
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct FieldMask(u32);

impl FieldMask {
    pub const IMSI: FieldMask = FieldMask(1);
    pub const IMEI: FieldMask = FieldMask(2);
    pub const LOCATION: FieldMask = FieldMask(4);
    pub const MSISDN: FieldMask = FieldMask(8);

    pub const fn empty() -> FieldMask {
        FieldMask(0)
    }

    pub const fn all() -> FieldMask {
        FieldMask(1 | 2 | 4 | 8)
    }

    pub fn from_bits(bits: u32) -> FieldMask {
        FieldMask(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: FieldMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: FieldMask, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl BitOr for FieldMask {
    type Output = FieldMask;

    fn bitor(self, rhs: FieldMask) -> FieldMask {
        FieldMask(self.0 | rhs.0)
    }
}

impl_code_enum! {
    /// How firmware updates are managed for the devices of a collection
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub enum FirmwareManagement {
        #[default]
        Disabled => " ",
        /// The collection's current/target firmware applies to every device.
        Collection => "c",
        /// Each device carries its own current/target firmware.
        Device => "d",
    }
}

/// Firmware settings of a collection
///
/// `current_id` and `target_id` are [`Key::UNSET`] when not set.  They are
/// only consulted when management is [`FirmwareManagement::Collection`], but
/// are validated on every write.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CollectionFirmware {
    pub current_id: Key,
    pub target_id: Key,
    pub management: FirmwareManagement,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Collection {
    pub collection_id: Key,
    pub team_id: Key,
    pub field_mask: FieldMask,
    pub firmware: CollectionFirmware,
    pub tags: Tags,
}

#[derive(Clone, Debug, QueryableByName)]
pub struct CollectionRow {
    #[diesel(sql_type = BigInt)]
    pub collection_id: i64,
    #[diesel(sql_type = BigInt)]
    pub team_id: i64,
    #[diesel(sql_type = Integer)]
    pub field_mask: i32,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub firmware_current_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub firmware_target_id: Option<i64>,
    #[diesel(sql_type = Text)]
    pub firmware_management: String,
    #[diesel(sql_type = Text)]
    pub tags: String,
}

/// Maps an optional key column to a key, using [`Key::UNSET`] for NULL.
pub fn key_from_column(value: Option<i64>) -> Key {
    value.map(Key::from_i64).unwrap_or(Key::UNSET)
}

/// Maps a key to an optional key column, using NULL for [`Key::UNSET`].
pub fn key_to_column(key: Key) -> Option<i64> {
    if key.is_unset() {
        None
    } else {
        Some(key.as_i64())
    }
}

impl TryFrom<CollectionRow> for Collection {
    type Error = Error;

    fn try_from(row: CollectionRow) -> Result<Self, Self::Error> {
        let management =
            FirmwareManagement::from_code(&row.firmware_management)
                .ok_or_else(|| {
                    Error::internal_error(&format!(
                        "unknown firmware management code {:?}",
                        row.firmware_management
                    ))
                })?;
        Ok(Collection {
            collection_id: Key::from_i64(row.collection_id),
            team_id: Key::from_i64(row.team_id),
            field_mask: FieldMask::from_bits(row.field_mask as u32),
            firmware: CollectionFirmware {
                current_id: key_from_column(row.firmware_current_id),
                target_id: key_from_column(row.firmware_target_id),
                management,
            },
            tags: Tags::from_json(&row.tags)?,
        })
    }
}
