// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequence counters backing the key generator

use super::SqlStore;
use crate::db::pool_connection::sql;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Text;
use diesel::OptionalExtension;
use diesel::QueryableByName;
use diesel::RunQueryDsl;
use horde_common::api::external::Error;
use horde_common::api::external::LookupResult;
use horde_common::api::external::LookupType;
use horde_common::api::external::ResourceType;

/// Named, monotonic counters with compare-and-set updates
///
/// Both operations are linearizable with respect to each other across every
/// client of the same database.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Returns the current value of the named counter.
    async fn current_sequence(&self, name: &str) -> LookupResult<i64>;

    /// Sets the named counter to `new_value` if it currently holds
    /// `expected`, returning whether it did.  A counter that does not exist
    /// yet is created with `new_value`; if another client creates it first,
    /// this returns `false`.
    async fn allocate_sequence(
        &self,
        name: &str,
        expected: i64,
        new_value: i64,
    ) -> Result<bool, Error>;
}

#[derive(QueryableByName)]
struct CounterRow {
    #[diesel(sql_type = BigInt)]
    counter: i64,
}

#[async_trait]
impl SequenceStore for SqlStore {
    async fn current_sequence(&self, name: &str) -> LookupResult<i64> {
        let name = name.to_owned();
        self.transaction(
            ResourceType::Sequence,
            LookupType::ByName(name.clone()),
            move |conn| {
                let row = sql(
                    conn,
                    "SELECT counter FROM sequence WHERE identifier = $1",
                )
                .bind::<Text, _>(name)
                .get_result::<CounterRow>(conn)?;
                Ok(row.counter)
            },
        )
        .await
    }

    async fn allocate_sequence(
        &self,
        name: &str,
        expected: i64,
        new_value: i64,
    ) -> Result<bool, Error> {
        if new_value < expected {
            return Err(Error::internal_error(&format!(
                "sequence {:?} would move backwards ({} -> {})",
                name, expected, new_value
            )));
        }
        let name = name.to_owned();
        let result = self
            .transaction(
                ResourceType::Sequence,
                LookupType::ByName(name.clone()),
                move |conn| {
                    let updated = sql(
                        conn,
                        "UPDATE sequence SET counter = $1 \
                         WHERE identifier = $2 AND counter = $3",
                    )
                    .bind::<BigInt, _>(new_value)
                    .bind::<Text, _>(name.clone())
                    .bind::<BigInt, _>(expected)
                    .execute(conn)?;
                    if updated > 0 {
                        return Ok(true);
                    }
                    let exists = sql(
                        conn,
                        "SELECT counter FROM sequence WHERE identifier = $1",
                    )
                    .bind::<Text, _>(name.clone())
                    .get_result::<CounterRow>(conn)
                    .optional()?;
                    if exists.is_some() {
                        return Ok(false);
                    }
                    sql(
                        conn,
                        "INSERT INTO sequence (identifier, counter) \
                         VALUES ($1, $2)",
                    )
                    .bind::<Text, _>(name)
                    .bind::<BigInt, _>(new_value)
                    .execute(conn)?;
                    Ok(true)
                },
            )
            .await;
        match result {
            // Another client created the counter between our check and our
            // insert.
            Err(Error::ObjectAlreadyExists { .. }) => Ok(false),
            result => result,
        }
    }
}

#[cfg(test)]
mod test {
    use super::SequenceStore;
    use crate::db::pub_test_utils::TestDatabase;
    use assert_matches::assert_matches;
    use horde_common::api::external::Error;
    use horde_test_utils::dev;

    #[tokio::test]
    async fn test_compare_and_set() {
        let logctx = dev::test_setup_log("test_compare_and_set");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        assert_matches!(
            store.current_sequence("device/1/1").await,
            Err(Error::ObjectNotFound { .. })
        );
        // A missing counter is created regardless of the expected value.
        assert!(store.allocate_sequence("device/1/1", 1, 11).await.unwrap());
        assert_eq!(store.current_sequence("device/1/1").await.unwrap(), 11);

        // A stale expectation fails and leaves the counter alone.
        assert!(!store.allocate_sequence("device/1/1", 1, 11).await.unwrap());
        assert_eq!(store.current_sequence("device/1/1").await.unwrap(), 11);

        assert!(store.allocate_sequence("device/1/1", 11, 21).await.unwrap());
        assert_eq!(store.current_sequence("device/1/1").await.unwrap(), 21);

        // Counters are independent.
        assert_matches!(
            store.current_sequence("device/2/1").await,
            Err(Error::ObjectNotFound { .. })
        );

        // Counters never move backwards.
        assert_matches!(
            store.allocate_sequence("device/1/1", 21, 3).await,
            Err(Error::InternalError { .. })
        );
        logctx.cleanup_successful();
    }
}
