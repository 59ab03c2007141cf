// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`OutputStore`] methods on outputs

use super::authz;
use super::ExpectRows;
use super::SqlStore;
use crate::db::pool_connection::sql;
use crate::db::pool_connection::DbConnection;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Bool;
use diesel::sql_types::Text;
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
use horde_db_model::Output;
use horde_db_model::OutputRow;

const OUTPUT_COLUMNS: &str = "output_id, collection_id, output_type, \
    CAST(config AS TEXT) AS config, enabled, CAST(tags AS TEXT) AS tags";

pub(crate) const SELECT_ALL_OUTPUTS: &str = "SELECT output_id, \
    collection_id, output_type, CAST(config AS TEXT) AS config, enabled, \
    CAST(tags AS TEXT) AS tags FROM output ORDER BY output_id";

pub(crate) fn insert_output_row(
    conn: &mut DbConnection,
    row: &OutputRow,
) -> QueryResult<usize> {
    sql(
        conn,
        "INSERT INTO output (output_id, collection_id, output_type, config, \
         enabled, tags) VALUES ($1, $2, $3, CAST($4 AS JSONB), $5, \
         CAST($6 AS JSONB))",
    )
    .bind::<BigInt, _>(row.output_id)
    .bind::<BigInt, _>(row.collection_id)
    .bind::<Text, _>(row.output_type.clone())
    .bind::<Text, _>(row.config.clone())
    .bind::<Bool, _>(row.enabled)
    .bind::<Text, _>(row.tags.clone())
    .execute(conn)
}

fn output_row(output: &Output) -> OutputRow {
    OutputRow {
        output_id: output.output_id.as_i64(),
        collection_id: output.collection_id.as_i64(),
        output_type: output.output_type.clone(),
        config: output.config_json(),
        enabled: output.enabled,
        tags: output.tags.to_json(),
    }
}

#[async_trait]
pub trait OutputStore: Send + Sync {
    async fn create_output(&self, user_id: Key, output: &Output)
        -> CreateResult<()>;

    async fn retrieve_output(
        &self,
        user_id: Key,
        collection_id: Key,
        output_id: Key,
    ) -> LookupResult<Output>;

    async fn list_outputs(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> ListResultVec<Output>;

    /// Updates the type, configuration, enabled flag and tags of an output.
    /// Outputs do not move between collections.
    async fn update_output(
        &self,
        user_id: Key,
        collection_id: Key,
        output: &Output,
    ) -> UpdateResult<()>;

    async fn delete_output(
        &self,
        user_id: Key,
        collection_id: Key,
        output_id: Key,
    ) -> DeleteResult;

    /// Lists every output, for starting the forwarders.
    async fn list_all_outputs(&self) -> ListResultVec<Output>;
}

#[async_trait]
impl OutputStore for SqlStore {
    async fn create_output(
        &self,
        user_id: Key,
        output: &Output,
    ) -> CreateResult<()> {
        let row = output_row(output);
        let collection_id = output.collection_id;
        self.transaction(
            ResourceType::Output,
            LookupType::ById(output.output_id),
            move |conn| {
                authz::require_collection_admin(conn, user_id, collection_id)?;
                insert_output_row(conn, &row)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_output(
        &self,
        user_id: Key,
        collection_id: Key,
        output_id: Key,
    ) -> LookupResult<Output> {
        let row = self
            .transaction(
                ResourceType::Output,
                LookupType::ById(output_id),
                move |conn| {
                    authz::require_collection_member(
                        conn,
                        user_id,
                        collection_id,
                    )?;
                    Ok(sql(
                        conn,
                        &format!(
                            "SELECT {} FROM output \
                             WHERE output_id = $1 AND collection_id = $2",
                            OUTPUT_COLUMNS
                        ),
                    )
                    .bind::<BigInt, _>(output_id.as_i64())
                    .bind::<BigInt, _>(collection_id.as_i64())
                    .get_result::<OutputRow>(conn)?)
                },
            )
            .await?;
        Output::try_from(row)
    }

    async fn list_outputs(
        &self,
        user_id: Key,
        collection_id: Key,
    ) -> ListResultVec<Output> {
        let rows = self
            .transaction(
                ResourceType::Output,
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
                            "SELECT {} FROM output WHERE collection_id = $1 \
                             ORDER BY output_id",
                            OUTPUT_COLUMNS
                        ),
                    )
                    .bind::<BigInt, _>(collection_id.as_i64())
                    .load::<OutputRow>(conn)?)
                },
            )
            .await?;
        rows.into_iter().map(Output::try_from).collect()
    }

    async fn update_output(
        &self,
        user_id: Key,
        collection_id: Key,
        output: &Output,
    ) -> UpdateResult<()> {
        if output.collection_id != collection_id {
            return Err(Error::invalid_request(
                "outputs cannot move between collections",
            ));
        }
        let row = output_row(output);
        let output_id = output.output_id;
        self.transaction(
            ResourceType::Output,
            LookupType::ById(output_id),
            move |conn| {
                authz::require_collection_admin(conn, user_id, collection_id)?;
                sql(
                    conn,
                    "UPDATE output SET output_type = $1, \
                     config = CAST($2 AS JSONB), enabled = $3, \
                     tags = CAST($4 AS JSONB) \
                     WHERE output_id = $5 AND collection_id = $6",
                )
                .bind::<Text, _>(row.output_type)
                .bind::<Text, _>(row.config)
                .bind::<Bool, _>(row.enabled)
                .bind::<Text, _>(row.tags)
                .bind::<BigInt, _>(row.output_id)
                .bind::<BigInt, _>(row.collection_id)
                .execute(conn)?
                .or_not_found(Error::not_found_by_id(
                    ResourceType::Output,
                    output_id,
                ))
            },
        )
        .await
    }

    async fn delete_output(
        &self,
        user_id: Key,
        collection_id: Key,
        output_id: Key,
    ) -> DeleteResult {
        self.transaction(
            ResourceType::Output,
            LookupType::ById(output_id),
            move |conn| {
                authz::require_collection_admin(conn, user_id, collection_id)?;
                sql(
                    conn,
                    "DELETE FROM output \
                     WHERE output_id = $1 AND collection_id = $2",
                )
                .bind::<BigInt, _>(output_id.as_i64())
                .bind::<BigInt, _>(collection_id.as_i64())
                .execute(conn)?
                .or_not_found(Error::not_found_by_id(
                    ResourceType::Output,
                    output_id,
                ))
            },
        )
        .await
    }

    async fn list_all_outputs(&self) -> ListResultVec<Output> {
        let rows = self
            .transaction(
                ResourceType::Output,
                LookupType::ByCompositeId(String::from("all")),
                move |conn| {
                    Ok(sql(conn, SELECT_ALL_OUTPUTS).load::<OutputRow>(conn)?)
                },
            )
            .await?;
        rows.into_iter().map(Output::try_from).collect()
    }
}
