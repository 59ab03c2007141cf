// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::from_column_time;
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
use std::net::Ipv4Addr;

/// An access point network
#[derive(Clone, Debug, Eq, PartialEq, QueryableByName)]
pub struct Apn {
    #[diesel(sql_type = Integer, column_name = apn_id)]
    pub id: i32,
    #[diesel(sql_type = Text)]
    pub name: String,
}

/// A RADIUS-speaking gateway within an APN, owning one IPv4 range
#[derive(Clone, Debug, Eq, PartialEq, QueryableByName)]
pub struct Nas {
    #[diesel(sql_type = Integer, column_name = nas_id)]
    pub id: i32,
    #[diesel(sql_type = Integer)]
    pub apn_id: i32,
    #[diesel(sql_type = Text)]
    pub identifier: String,
    /// IPv4 address and prefix, e.g. `10.1.1.1/24`.  Allocation starts at the
    /// address given here rather than at the network address.
    #[diesel(sql_type = Text)]
    pub cidr: String,
}

/// An address handed to a device on a NAS
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Allocation {
    pub imsi: i64,
    pub apn_id: i32,
    pub nas_id: i32,
    pub imei: Option<i64>,
    pub ip: Ipv4Addr,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Debug, QueryableByName)]
pub struct AllocationRow {
    #[diesel(sql_type = BigInt)]
    pub imsi: i64,
    #[diesel(sql_type = Integer)]
    pub apn_id: i32,
    #[diesel(sql_type = Integer)]
    pub nas_id: i32,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub imei: Option<i64>,
    #[diesel(sql_type = Text)]
    pub ip: String,
    #[diesel(sql_type = Timestamp)]
    pub created: NaiveDateTime,
}

impl TryFrom<AllocationRow> for Allocation {
    type Error = Error;

    fn try_from(row: AllocationRow) -> Result<Self, Self::Error> {
        let ip = row.ip.parse::<Ipv4Addr>().map_err(|_| {
            Error::internal_error(&format!(
                "allocation for imsi {} on nas {}: malformed address {:?}",
                row.imsi, row.nas_id, row.ip
            ))
        })?;
        Ok(Allocation {
            imsi: row.imsi,
            apn_id: row.apn_id,
            nas_id: row.nas_id,
            imei: row.imei,
            ip,
            created: from_column_time(row.created),
        })
    }
}
