// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::from_column_time;
use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use diesel::sql_types::BigInt;
use diesel::sql_types::Binary;
use diesel::sql_types::Integer;
use diesel::sql_types::Timestamp;
use diesel::QueryableByName;
use horde_common::key::Key;
use strum::Display;
use strum::EnumString;

/// How a downstream message reaches its device
///
/// Integer codes are stored; codes this build does not know decode to
/// [`Transport::Unknown`].
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
pub enum Transport {
    #[strum(to_string = "udp")]
    Udp,
    /// `"coap"` is accepted for compatibility with older clients.
    #[strum(to_string = "coap-push", serialize = "coap")]
    CoapPush,
    #[strum(to_string = "coap-pull")]
    CoapPull,
    #[strum(to_string = "udp-pull")]
    UdpPull,
    #[strum(to_string = "unknown")]
    Unknown,
}

impl Transport {
    pub fn code(&self) -> i32 {
        match self {
            Transport::Udp => 0,
            Transport::CoapPush => 1,
            Transport::CoapPull => 2,
            Transport::UdpPull => 3,
            Transport::Unknown => 999,
        }
    }

    pub fn from_code(code: i32) -> Transport {
        match code {
            0 => Transport::Udp,
            1 => Transport::CoapPush,
            2 => Transport::CoapPull,
            3 => Transport::UdpPull,
            _ => Transport::Unknown,
        }
    }
}

/// A message waiting for delivery to a device
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DownstreamMessage {
    pub message_id: Key,
    pub apn_id: i32,
    pub nas_id: i32,
    pub device_id: Key,
    pub transport: Transport,
    pub created: DateTime<Utc>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, QueryableByName)]
pub struct DownstreamMessageRow {
    #[diesel(sql_type = BigInt)]
    pub message_id: i64,
    #[diesel(sql_type = Integer)]
    pub apn_id: i32,
    #[diesel(sql_type = Integer)]
    pub nas_id: i32,
    #[diesel(sql_type = BigInt)]
    pub device_id: i64,
    #[diesel(sql_type = Integer)]
    pub transport: i32,
    #[diesel(sql_type = Timestamp)]
    pub created: NaiveDateTime,
    #[diesel(sql_type = Binary)]
    pub payload: Vec<u8>,
}

impl From<DownstreamMessageRow> for DownstreamMessage {
    fn from(row: DownstreamMessageRow) -> Self {
        DownstreamMessage {
            message_id: Key::from_i64(row.message_id),
            apn_id: row.apn_id,
            nas_id: row.nas_id,
            device_id: Key::from_i64(row.device_id),
            transport: Transport::from_code(row.transport),
            created: from_column_time(row.created),
            payload: row.payload,
        }
    }
}
