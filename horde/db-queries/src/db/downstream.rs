// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queue of messages waiting to be delivered to devices
//!
//! Messages are persisted in `downstream_messages` until the transport that
//! delivers them confirms delivery with [`DownstreamQueue::delete`].  A
//! retrieved message moves to the in-flight list; if delivery fails the
//! transport puts it back with [`DownstreamQueue::release`], behind the
//! messages queued meanwhile.  Messages that were in flight when the process
//! stopped are queued again on start, so a message may be delivered more
//! than once but is never lost.

use super::datastore::ExpectRows;
use super::SqlStore;
use crate::db::pool_connection::sql;
use diesel::sql_types::BigInt;
use diesel::sql_types::Binary;
use diesel::sql_types::Integer;
use diesel::sql_types::Timestamp;
use diesel::RunQueryDsl;
use horde_common::api::external::CreateResult;
use horde_common::api::external::DeleteResult;
use horde_common::api::external::Error;
use horde_common::api::external::LookupResult;
use horde_common::api::external::LookupType;
use horde_common::api::external::ResourceType;
use horde_common::key::Key;
use horde_db_model::now;
use horde_db_model::to_column_time;
use horde_db_model::DownstreamMessage;
use horde_db_model::DownstreamMessageRow;
use horde_db_model::Transport;
use slog::Logger;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

struct QueueState {
    queued: VecDeque<DownstreamMessage>,
    in_flight: Vec<DownstreamMessage>,
}

impl QueueState {
    /// Moves the first queued message matching `filter` to the in-flight
    /// list.
    fn take(
        &mut self,
        filter: impl Fn(&DownstreamMessage) -> bool,
    ) -> Option<(Key, Vec<u8>)> {
        let index = self.queued.iter().position(filter)?;
        let message = self.queued.remove(index)?;
        let found = (message.message_id, message.payload.clone());
        self.in_flight.push(message);
        Some(found)
    }
}

/// Table-backed FIFO of downstream messages
pub struct DownstreamQueue {
    log: Logger,
    store: Arc<SqlStore>,
    state: Mutex<QueueState>,
}

impl DownstreamQueue {
    /// Loads every stored message, oldest first.
    pub async fn new(
        log: &Logger,
        store: Arc<SqlStore>,
    ) -> Result<DownstreamQueue, Error> {
        let log = log.new(o!("component" => "DownstreamQueue"));
        let rows = store
            .transaction(
                ResourceType::DownstreamMessage,
                LookupType::ByCompositeId(String::from("all")),
                |conn| {
                    Ok(sql(
                        conn,
                        "SELECT message_id, apn_id, nas_id, device_id, \
                         transport, created, payload \
                         FROM downstream_messages \
                         ORDER BY created ASC, message_id ASC",
                    )
                    .load::<DownstreamMessageRow>(conn)?)
                },
            )
            .await?;
        let queued: VecDeque<DownstreamMessage> =
            rows.into_iter().map(DownstreamMessage::from).collect();
        info!(&log, "loaded downstream messages"; "count" => queued.len());
        Ok(DownstreamQueue {
            log,
            store,
            state: Mutex::new(QueueState { queued, in_flight: Vec::new() }),
        })
    }

    /// Stores a message and queues it for delivery.
    pub async fn create(
        &self,
        apn_id: i32,
        nas_id: i32,
        device_id: Key,
        message_id: Key,
        transport: Transport,
        payload: Vec<u8>,
    ) -> CreateResult<()> {
        let message = DownstreamMessage {
            message_id,
            apn_id,
            nas_id,
            device_id,
            transport,
            created: now(),
            payload,
        };
        let row = message.clone();
        self.store
            .transaction(
                ResourceType::DownstreamMessage,
                LookupType::ById(message_id),
                move |conn| {
                    sql(
                        conn,
                        "INSERT INTO downstream_messages (message_id, apn_id, \
                         nas_id, device_id, transport, created, payload) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind::<BigInt, _>(row.message_id.as_i64())
                    .bind::<Integer, _>(row.apn_id)
                    .bind::<Integer, _>(row.nas_id)
                    .bind::<BigInt, _>(row.device_id.as_i64())
                    .bind::<Integer, _>(row.transport.code())
                    .bind::<Timestamp, _>(to_column_time(&row.created))
                    .bind::<Binary, _>(row.payload)
                    .execute(conn)?;
                    Ok(())
                },
            )
            .await?;
        debug!(
            &self.log,
            "queued message";
            "message_id" => %message_id,
            "device_id" => %device_id,
            "transport" => %transport,
        );
        self.state.lock().unwrap().queued.push_back(message);
        Ok(())
    }

    /// Takes the oldest queued message for a NAS and transport, returning
    /// its id and payload.
    pub fn retrieve(
        &self,
        apn_id: i32,
        nas_id: i32,
        transport: Transport,
    ) -> LookupResult<(Key, Vec<u8>)> {
        self.state
            .lock()
            .unwrap()
            .take(|m| {
                m.apn_id == apn_id
                    && m.nas_id == nas_id
                    && m.transport == transport
            })
            .ok_or_else(|| {
                LookupType::ByCompositeId(format!(
                    "apn {} nas {} transport {}",
                    apn_id, nas_id, transport
                ))
                .into_not_found(ResourceType::DownstreamMessage)
            })
    }

    /// Takes the oldest queued message for a device and transport.
    pub fn retrieve_by_device(
        &self,
        device_id: Key,
        transport: Transport,
    ) -> LookupResult<(Key, Vec<u8>)> {
        self.state
            .lock()
            .unwrap()
            .take(|m| m.device_id == device_id && m.transport == transport)
            .ok_or_else(|| {
                LookupType::ByCompositeId(format!(
                    "device {} transport {}",
                    device_id, transport
                ))
                .into_not_found(ResourceType::DownstreamMessage)
            })
    }

    /// Puts an in-flight message back at the end of the queue.
    pub fn release(&self, message_id: Key) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let index = state
            .in_flight
            .iter()
            .position(|m| m.message_id == message_id)
            .ok_or_else(|| {
                Error::not_found_by_id(
                    ResourceType::DownstreamMessage,
                    message_id,
                )
            })?;
        let message = state.in_flight.remove(index);
        state.queued.push_back(message);
        Ok(())
    }

    /// Deletes a delivered (or abandoned) message.
    pub async fn delete(&self, message_id: Key) -> DeleteResult {
        self.store
            .transaction(
                ResourceType::DownstreamMessage,
                LookupType::ById(message_id),
                move |conn| {
                    sql(
                        conn,
                        "DELETE FROM downstream_messages \
                         WHERE message_id = $1",
                    )
                    .bind::<BigInt, _>(message_id.as_i64())
                    .execute(conn)?
                    .or_not_found(Error::not_found_by_id(
                        ResourceType::DownstreamMessage,
                        message_id,
                    ))
                },
            )
            .await?;
        let mut state = self.state.lock().unwrap();
        state.in_flight.retain(|m| m.message_id != message_id);
        state.queued.retain(|m| m.message_id != message_id);
        Ok(())
    }

    /// Number of messages waiting to be retrieved.
    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queued.len()
    }

    /// Number of messages retrieved but neither released nor deleted.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::pub_test_utils::TestDatabase;
    use assert_matches::assert_matches;
    use horde_test_utils::dev;

    fn key(n: u64) -> Key {
        Key::new(n)
    }

    #[tokio::test]
    async fn test_fifo_with_release() {
        let logctx = dev::test_setup_log("test_fifo_with_release");
        let db = TestDatabase::new(&logctx.log).await;
        let queue =
            DownstreamQueue::new(&logctx.log, db.store().clone()).await.unwrap();

        let device = key(1000);
        for n in 1..=10 {
            queue
                .create(1, 10, device, key(n), Transport::UdpPull, vec![n as u8])
                .await
                .unwrap();
        }
        assert_eq!(queue.queued(), 10);
        assert_matches!(
            queue
                .create(1, 10, device, key(3), Transport::UdpPull, vec![])
                .await,
            Err(Error::ObjectAlreadyExists { .. })
        );
        assert_eq!(queue.queued(), 10);

        let (first, payload) = queue.retrieve(1, 10, Transport::UdpPull).unwrap();
        assert_eq!((first, payload), (key(1), vec![1]));
        let (second, _) =
            queue.retrieve_by_device(device, Transport::UdpPull).unwrap();
        assert_eq!(second, key(2));
        assert_eq!((queue.queued(), queue.in_flight()), (8, 2));

        // A released message goes behind everything already queued.
        queue.release(first).unwrap();
        assert_matches!(
            queue.release(first),
            Err(Error::ObjectNotFound { .. })
        );
        queue.delete(second).await.unwrap();
        assert_matches!(
            queue.delete(second).await,
            Err(Error::ObjectNotFound { .. })
        );

        let mut order = Vec::new();
        while let Ok((id, _)) = queue.retrieve(1, 10, Transport::UdpPull) {
            order.push(id);
        }
        let expected: Vec<Key> =
            (3..=10).chain(std::iter::once(1)).map(key).collect();
        assert_eq!(order, expected);
        assert_eq!((queue.queued(), queue.in_flight()), (0, 9));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_released_messages_keep_their_order() {
        let logctx =
            dev::test_setup_log("test_released_messages_keep_their_order");
        let db = TestDatabase::new(&logctx.log).await;
        let queue =
            DownstreamQueue::new(&logctx.log, db.store().clone()).await.unwrap();

        let device = key(500);
        for n in 0..10 {
            queue
                .create(1, 10, device, key(n), Transport::CoapPush, vec![])
                .await
                .unwrap();
        }
        for n in 0..10 {
            let (id, _) =
                queue.retrieve_by_device(device, Transport::CoapPush).unwrap();
            assert_eq!(id, key(n));
        }
        for n in 0..10 {
            if n % 2 == 1 {
                queue.release(key(n)).unwrap();
            } else {
                queue.delete(key(n)).await.unwrap();
            }
        }
        assert_eq!((queue.queued(), queue.in_flight()), (5, 0));

        let mut order = Vec::new();
        for _ in 0..5 {
            let (id, _) =
                queue.retrieve_by_device(device, Transport::CoapPush).unwrap();
            order.push(id);
        }
        assert_eq!(order, [1, 3, 5, 7, 9].map(key));
        assert_matches!(
            queue.retrieve_by_device(device, Transport::CoapPush),
            Err(Error::ObjectNotFound { .. })
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_filters_and_restart() {
        let logctx = dev::test_setup_log("test_filters_and_restart");
        let db = TestDatabase::new(&logctx.log).await;
        let queue =
            DownstreamQueue::new(&logctx.log, db.store().clone()).await.unwrap();

        queue
            .create(1, 10, key(100), key(1), Transport::CoapPull, vec![1])
            .await
            .unwrap();
        queue
            .create(1, 11, key(101), key(2), Transport::UdpPull, vec![2])
            .await
            .unwrap();
        queue
            .create(1, 10, key(101), key(3), Transport::UdpPull, vec![3])
            .await
            .unwrap();

        assert_matches!(
            queue.retrieve(1, 10, Transport::Udp),
            Err(Error::ObjectNotFound {
                type_name: ResourceType::DownstreamMessage,
                ..
            })
        );
        assert_eq!(
            queue.retrieve(1, 10, Transport::UdpPull).unwrap(),
            (key(3), vec![3])
        );
        assert_matches!(
            queue.retrieve_by_device(key(100), Transport::UdpPull),
            Err(Error::ObjectNotFound { .. })
        );
        assert_eq!(
            queue.retrieve_by_device(key(101), Transport::UdpPull).unwrap(),
            (key(2), vec![2])
        );
        queue.delete(key(2)).await.unwrap();

        // In-flight messages are queued again after a restart.
        drop(queue);
        let queue =
            DownstreamQueue::new(&logctx.log, db.store().clone()).await.unwrap();
        assert_eq!((queue.queued(), queue.in_flight()), (2, 0));
        assert_eq!(
            queue.retrieve_by_device(key(100), Transport::CoapPull).unwrap(),
            (key(1), vec![1])
        );
        assert_eq!(
            queue.retrieve(1, 10, Transport::UdpPull).unwrap(),
            (key(3), vec![3])
        );
        logctx.cleanup_successful();
    }
}
