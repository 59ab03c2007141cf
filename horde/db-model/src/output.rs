// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Tags;
use diesel::sql_types::BigInt;
use diesel::sql_types::Bool;
use diesel::sql_types::Text;
use diesel::QueryableByName;
use horde_common::api::external::Error;
use horde_common::key::Key;
use serde_json::Map;
use serde_json::Value;

/// A data forwarder attached to a collection (webhook, MQTT, ...)
///
/// The configuration is opaque to the core.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Output {
    pub output_id: Key,
    pub collection_id: Key,
    pub output_type: String,
    pub config: Map<String, Value>,
    pub enabled: bool,
    pub tags: Tags,
}

impl Output {
    /// Serialises the configuration for the JSON column.
    pub fn config_json(&self) -> String {
        Value::Object(self.config.clone()).to_string()
    }
}

#[derive(Clone, Debug, QueryableByName)]
pub struct OutputRow {
    #[diesel(sql_type = BigInt)]
    pub output_id: i64,
    #[diesel(sql_type = BigInt)]
    pub collection_id: i64,
    #[diesel(sql_type = Text)]
    pub output_type: String,
    #[diesel(sql_type = Text)]
    pub config: String,
    #[diesel(sql_type = Bool)]
    pub enabled: bool,
    #[diesel(sql_type = Text)]
    pub tags: String,
}

impl TryFrom<OutputRow> for Output {
    type Error = Error;

    fn try_from(row: OutputRow) -> Result<Self, Self::Error> {
        let config = match serde_json::from_str::<Value>(&row.config) {
            Ok(Value::Object(config)) => config,
            Ok(_) => {
                return Err(Error::internal_error(&format!(
                    "output {}: configuration is not an object",
                    row.output_id
                )))
            }
            Err(e) => {
                return Err(Error::internal_error(&format!(
                    "output {}: malformed configuration: {}",
                    row.output_id, e
                )))
            }
        };
        Ok(Output {
            output_id: Key::from_i64(row.output_id),
            collection_id: Key::from_i64(row.collection_id),
            output_type: row.output_type,
            config,
            enabled: row.enabled,
            tags: Tags::from_json(&row.tags)?,
        })
    }
}
