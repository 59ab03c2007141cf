// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`ApnStore`]: access point networks, their NASes, and the addresses
//! allocated on them

use super::ExpectRows;
use super::SqlStore;
use crate::db::pool_connection::sql;
use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::sql_types::Integer;
use diesel::sql_types::Nullable;
use diesel::sql_types::Text;
use diesel::sql_types::Timestamp;
use diesel::OptionalExtension;
use diesel::RunQueryDsl;
use horde_common::api::external::CreateResult;
use horde_common::api::external::DeleteResult;
use horde_common::api::external::Error;
use horde_common::api::external::ListResultVec;
use horde_common::api::external::LookupResult;
use horde_common::api::external::LookupType;
use horde_common::api::external::ResourceType;
use horde_db_model::to_column_time;
use horde_db_model::Allocation;
use horde_db_model::AllocationRow;
use horde_db_model::Apn;
use horde_db_model::Nas;

/// Persistent APN configuration and address allocations
///
/// This is the only view of the database the IP allocator needs, so it can
/// run against test doubles.
#[async_trait]
pub trait ApnStore: Send + Sync {
    async fn create_apn(&self, apn: &Apn) -> CreateResult<()>;

    async fn retrieve_apn(&self, apn_id: i32) -> LookupResult<Apn>;

    async fn list_apns(&self) -> ListResultVec<Apn>;

    /// Deletes an APN without NASes.
    async fn delete_apn(&self, apn_id: i32) -> DeleteResult;

    async fn create_nas(&self, nas: &Nas) -> CreateResult<()>;

    async fn retrieve_nas(&self, apn_id: i32, nas_id: i32)
        -> LookupResult<Nas>;

    async fn list_nas(&self, apn_id: i32) -> ListResultVec<Nas>;

    /// Deletes a NAS without allocations.
    async fn delete_nas(&self, apn_id: i32, nas_id: i32) -> DeleteResult;

    /// Persists an allocation.  Both the IMSI and the address must be free
    /// on the NAS.
    async fn create_allocation(&self, allocation: &Allocation)
        -> CreateResult<()>;

    async fn retrieve_allocation(
        &self,
        imsi: i64,
        apn_id: i32,
        nas_id: i32,
    ) -> LookupResult<Allocation>;

    async fn list_allocations(
        &self,
        apn_id: i32,
        nas_id: i32,
    ) -> ListResultVec<Allocation>;

    async fn delete_allocation(
        &self,
        imsi: i64,
        apn_id: i32,
        nas_id: i32,
    ) -> DeleteResult;
}

fn nas_lookup(apn_id: i32, nas_id: i32) -> LookupType {
    LookupType::ByCompositeId(format!("apn {} nas {}", apn_id, nas_id))
}

fn allocation_lookup(imsi: i64, apn_id: i32, nas_id: i32) -> LookupType {
    LookupType::ByCompositeId(format!(
        "imsi {} apn {} nas {}",
        imsi, apn_id, nas_id
    ))
}

#[async_trait]
impl ApnStore for SqlStore {
    async fn create_apn(&self, apn: &Apn) -> CreateResult<()> {
        let apn = apn.clone();
        self.transaction(
            ResourceType::Apn,
            LookupType::ByName(apn.name.clone()),
            move |conn| {
                sql(conn, "INSERT INTO apn (apn_id, name) VALUES ($1, $2)")
                    .bind::<Integer, _>(apn.id)
                    .bind::<Text, _>(apn.name)
                    .execute(conn)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_apn(&self, apn_id: i32) -> LookupResult<Apn> {
        self.transaction(
            ResourceType::Apn,
            LookupType::ByCompositeId(apn_id.to_string()),
            move |conn| {
                Ok(sql(conn, "SELECT apn_id, name FROM apn WHERE apn_id = $1")
                    .bind::<Integer, _>(apn_id)
                    .get_result::<Apn>(conn)?)
            },
        )
        .await
    }

    async fn list_apns(&self) -> ListResultVec<Apn> {
        self.transaction(
            ResourceType::Apn,
            LookupType::ByCompositeId(String::from("all")),
            move |conn| {
                Ok(sql(conn, "SELECT apn_id, name FROM apn ORDER BY apn_id")
                    .load::<Apn>(conn)?)
            },
        )
        .await
    }

    async fn delete_apn(&self, apn_id: i32) -> DeleteResult {
        self.transaction(
            ResourceType::Apn,
            LookupType::ByCompositeId(apn_id.to_string()),
            move |conn| {
                sql(conn, "DELETE FROM apn WHERE apn_id = $1")
                    .bind::<Integer, _>(apn_id)
                    .execute(conn)?
                    .or_not_found(Error::ObjectNotFound {
                        type_name: ResourceType::Apn,
                        lookup_type: LookupType::ByCompositeId(
                            apn_id.to_string(),
                        ),
                    })
            },
        )
        .await
    }

    async fn create_nas(&self, nas: &Nas) -> CreateResult<()> {
        let nas = nas.clone();
        self.transaction(
            ResourceType::Nas,
            LookupType::ByName(nas.identifier.clone()),
            move |conn| {
                // A missing APN is not found rather than referenced.
                sql(conn, "SELECT apn_id, name FROM apn WHERE apn_id = $1")
                    .bind::<Integer, _>(nas.apn_id)
                    .get_result::<Apn>(conn)
                    .optional()?
                    .ok_or_else(|| Error::ObjectNotFound {
                        type_name: ResourceType::Apn,
                        lookup_type: LookupType::ByCompositeId(
                            nas.apn_id.to_string(),
                        ),
                    })?;
                sql(
                    conn,
                    "INSERT INTO nas (nas_id, apn_id, identifier, cidr) \
                     VALUES ($1, $2, $3, $4)",
                )
                .bind::<Integer, _>(nas.id)
                .bind::<Integer, _>(nas.apn_id)
                .bind::<Text, _>(nas.identifier)
                .bind::<Text, _>(nas.cidr)
                .execute(conn)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_nas(
        &self,
        apn_id: i32,
        nas_id: i32,
    ) -> LookupResult<Nas> {
        self.transaction(
            ResourceType::Nas,
            nas_lookup(apn_id, nas_id),
            move |conn| {
                Ok(sql(
                    conn,
                    "SELECT nas_id, apn_id, identifier, cidr FROM nas \
                     WHERE apn_id = $1 AND nas_id = $2",
                )
                .bind::<Integer, _>(apn_id)
                .bind::<Integer, _>(nas_id)
                .get_result::<Nas>(conn)?)
            },
        )
        .await
    }

    async fn list_nas(&self, apn_id: i32) -> ListResultVec<Nas> {
        self.transaction(
            ResourceType::Nas,
            LookupType::ByCompositeId(apn_id.to_string()),
            move |conn| {
                Ok(sql(
                    conn,
                    "SELECT nas_id, apn_id, identifier, cidr FROM nas \
                     WHERE apn_id = $1 ORDER BY nas_id",
                )
                .bind::<Integer, _>(apn_id)
                .load::<Nas>(conn)?)
            },
        )
        .await
    }

    async fn delete_nas(&self, apn_id: i32, nas_id: i32) -> DeleteResult {
        self.transaction(
            ResourceType::Nas,
            nas_lookup(apn_id, nas_id),
            move |conn| {
                sql(conn, "DELETE FROM nas WHERE apn_id = $1 AND nas_id = $2")
                    .bind::<Integer, _>(apn_id)
                    .bind::<Integer, _>(nas_id)
                    .execute(conn)?
                    .or_not_found(Error::ObjectNotFound {
                        type_name: ResourceType::Nas,
                        lookup_type: nas_lookup(apn_id, nas_id),
                    })
            },
        )
        .await
    }

    async fn create_allocation(
        &self,
        allocation: &Allocation,
    ) -> CreateResult<()> {
        let row = AllocationRow {
            imsi: allocation.imsi,
            apn_id: allocation.apn_id,
            nas_id: allocation.nas_id,
            imei: allocation.imei,
            ip: allocation.ip.to_string(),
            created: to_column_time(&allocation.created),
        };
        self.transaction(
            ResourceType::Allocation,
            allocation_lookup(row.imsi, row.apn_id, row.nas_id),
            move |conn| {
                sql(
                    conn,
                    "INSERT INTO nasalloc (imsi, apn_id, nas_id, imei, ip, \
                     created) VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind::<BigInt, _>(row.imsi)
                .bind::<Integer, _>(row.apn_id)
                .bind::<Integer, _>(row.nas_id)
                .bind::<Nullable<BigInt>, _>(row.imei)
                .bind::<Text, _>(row.ip)
                .bind::<Timestamp, _>(row.created)
                .execute(conn)?;
                Ok(())
            },
        )
        .await
    }

    async fn retrieve_allocation(
        &self,
        imsi: i64,
        apn_id: i32,
        nas_id: i32,
    ) -> LookupResult<Allocation> {
        let row = self
            .transaction(
                ResourceType::Allocation,
                allocation_lookup(imsi, apn_id, nas_id),
                move |conn| {
                    Ok(sql(
                        conn,
                        "SELECT imsi, apn_id, nas_id, imei, ip, created \
                         FROM nasalloc \
                         WHERE imsi = $1 AND apn_id = $2 AND nas_id = $3",
                    )
                    .bind::<BigInt, _>(imsi)
                    .bind::<Integer, _>(apn_id)
                    .bind::<Integer, _>(nas_id)
                    .get_result::<AllocationRow>(conn)?)
                },
            )
            .await?;
        Allocation::try_from(row)
    }

    async fn list_allocations(
        &self,
        apn_id: i32,
        nas_id: i32,
    ) -> ListResultVec<Allocation> {
        let rows = self
            .transaction(
                ResourceType::Allocation,
                nas_lookup(apn_id, nas_id),
                move |conn| {
                    Ok(sql(
                        conn,
                        "SELECT imsi, apn_id, nas_id, imei, ip, created \
                         FROM nasalloc WHERE apn_id = $1 AND nas_id = $2 \
                         ORDER BY created, imsi",
                    )
                    .bind::<Integer, _>(apn_id)
                    .bind::<Integer, _>(nas_id)
                    .load::<AllocationRow>(conn)?)
                },
            )
            .await?;
        rows.into_iter().map(Allocation::try_from).collect()
    }

    async fn delete_allocation(
        &self,
        imsi: i64,
        apn_id: i32,
        nas_id: i32,
    ) -> DeleteResult {
        self.transaction(
            ResourceType::Allocation,
            allocation_lookup(imsi, apn_id, nas_id),
            move |conn| {
                sql(
                    conn,
                    "DELETE FROM nasalloc \
                     WHERE imsi = $1 AND apn_id = $2 AND nas_id = $3",
                )
                .bind::<BigInt, _>(imsi)
                .bind::<Integer, _>(apn_id)
                .bind::<Integer, _>(nas_id)
                .execute(conn)?
                .or_not_found(Error::ObjectNotFound {
                    type_name: ResourceType::Allocation,
                    lookup_type: allocation_lookup(imsi, apn_id, nas_id),
                })
            },
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::pub_test_utils::fixtures;
    use crate::db::pub_test_utils::TestDatabase;
    use assert_matches::assert_matches;
    use horde_db_model::now;
    use horde_test_utils::dev;
    use std::net::Ipv4Addr;

    fn allocation(imsi: i64, ip: Ipv4Addr) -> Allocation {
        Allocation {
            imsi,
            apn_id: 1,
            nas_id: 10,
            imei: Some(imsi + 1),
            ip,
            created: now(),
        }
    }

    #[tokio::test]
    async fn test_apn_configuration() {
        let logctx = dev::test_setup_log("test_apn_configuration");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();

        let apn = Apn { id: 1, name: String::from("mda.ee") };
        store.create_apn(&apn).await.unwrap();
        assert_matches!(
            store.create_apn(&apn).await,
            Err(Error::ObjectAlreadyExists { type_name: ResourceType::Apn, .. })
        );
        assert_eq!(store.retrieve_apn(1).await.unwrap(), apn);
        assert_eq!(store.list_apns().await.unwrap(), [apn.clone()]);

        let nas = Nas {
            id: 10,
            apn_id: 1,
            identifier: String::from("nas-a"),
            cidr: String::from("10.1.1.1/24"),
        };
        assert_matches!(
            store.create_nas(&Nas { apn_id: 2, ..nas.clone() }).await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Apn, .. })
        );
        store.create_nas(&nas).await.unwrap();
        assert_eq!(store.retrieve_nas(1, 10).await.unwrap(), nas);
        assert_eq!(store.list_nas(1).await.unwrap(), [nas.clone()]);

        store
            .create_allocation(&allocation(1, Ipv4Addr::new(10, 1, 1, 1)))
            .await
            .unwrap();

        // Referenced rows cannot go.
        assert_matches!(
            store.delete_apn(1).await,
            Err(Error::Referenced { type_name: ResourceType::Apn, .. })
        );
        assert_matches!(
            store.delete_nas(1, 10).await,
            Err(Error::Referenced { type_name: ResourceType::Nas, .. })
        );

        store.delete_allocation(1, 1, 10).await.unwrap();
        store.delete_nas(1, 10).await.unwrap();
        assert_matches!(
            store.delete_nas(1, 10).await,
            Err(Error::ObjectNotFound { .. })
        );
        store.delete_apn(1).await.unwrap();
        assert!(store.list_apns().await.unwrap().is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_allocations() {
        let logctx = dev::test_setup_log("test_allocations");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store();
        fixtures::apn(&db, 1, "mda.ee").await;
        fixtures::nas(&db, 1, 10, "10.1.1.1/24").await;

        let first = allocation(100, Ipv4Addr::new(10, 1, 1, 1));
        store.create_allocation(&first).await.unwrap();
        assert_eq!(store.retrieve_allocation(100, 1, 10).await.unwrap(), first);

        // Neither the IMSI nor the address can be reused on the NAS.
        assert_matches!(
            store
                .create_allocation(&allocation(100, Ipv4Addr::new(10, 1, 1, 2)))
                .await,
            Err(Error::ObjectAlreadyExists { type_name: ResourceType::Allocation, .. })
        );
        assert_matches!(
            store
                .create_allocation(&allocation(101, Ipv4Addr::new(10, 1, 1, 1)))
                .await,
            Err(Error::ObjectAlreadyExists { type_name: ResourceType::Allocation, .. })
        );

        let second = allocation(101, Ipv4Addr::new(10, 1, 1, 2));
        store.create_allocation(&second).await.unwrap();
        let listed = store.list_allocations(1, 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&first) && listed.contains(&second));
        assert!(store.list_allocations(1, 11).await.unwrap().is_empty());

        store.delete_allocation(100, 1, 10).await.unwrap();
        assert_matches!(
            store.retrieve_allocation(100, 1, 10).await,
            Err(Error::ObjectNotFound { type_name: ResourceType::Allocation, .. })
        );
        assert_matches!(
            store.delete_allocation(100, 1, 10).await,
            Err(Error::ObjectNotFound { .. })
        );
        logctx.cleanup_successful();
    }
}
