// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Horde core: the storage and address management shared by the Horde
//! front ends
//!
//! [`Horde::build`] opens the persistent database, primes the in-memory
//! mirror behind the write-through store, loads the APN configuration and
//! rebuilds the address ranges and the downstream queue from what is
//! persisted.

pub mod config;

use anyhow::Context;
use horde_common::api::external::CreateResult;
use horde_common::key::Key;
use horde_common::key::KeyKind;
use horde_common::FileKv;
use horde_db_model::Transport;
use horde_db_queries::db::datastore::ApnStore;
use horde_db_queries::db::downstream::DownstreamQueue;
use horde_db_queries::db::write_through::WriteThroughStore;
use horde_db_queries::db::Pool;
use horde_db_queries::db::SqlStore;
use horde_ipam::ApnConfigCache;
use horde_ipam::IpAllocator;
use slog::info;
use slog::o;
use slog::Logger;
use std::sync::Arc;

pub use config::Config;

/// The write-through store over the persistent database and its mirror
pub type Store = WriteThroughStore<SqlStore, SqlStore>;

/// Builds the process logger described by `config`.
///
/// Warnings and errors carry the file and line they were logged from.
pub fn logger(config: &Config) -> anyhow::Result<Logger> {
    let log = config.log.to_logger("horde").context("initializing logger")?;
    Ok(log.new(o!(FileKv)))
}

/// A running set of Horde core components
pub struct Horde {
    log: Logger,
    persistent: Arc<SqlStore>,
    store: Arc<Store>,
    apn_config: Arc<ApnConfigCache>,
    allocator: IpAllocator,
    downstream: DownstreamQueue,
}

impl Horde {
    pub async fn build(config: &Config, log: &Logger) -> anyhow::Result<Horde> {
        let log = log.new(o!("component" => "Horde"));
        let origin = config.keys.origin().context("invalid key origin")?;

        let pool = Pool::new(&log, &config.database)
            .context("creating database pool")?;
        let persistent = Arc::new(
            SqlStore::new(&log, Arc::new(pool))
                .await
                .context("initializing persistent store")?,
        );
        let store = Arc::new(
            Store::open(
                &log,
                persistent.clone(),
                origin,
                config.keys.block_size,
            )
            .await
            .context("priming in-memory store")?,
        );

        let apn_config = Arc::new(
            ApnConfigCache::new(&log, persistent.as_ref())
                .await
                .context("loading APN configuration")?,
        );
        let allocator = IpAllocator::new(
            &log,
            apn_config.clone(),
            persistent.clone() as Arc<dyn ApnStore>,
        );
        allocator.rebuild_all().await.context("rebuilding address ranges")?;

        let downstream = DownstreamQueue::new(&log, persistent.clone())
            .await
            .context("loading downstream messages")?;

        info!(
            &log,
            "horde core ready";
            "data_center" => origin.data_center(),
            "worker" => origin.worker(),
        );
        Ok(Horde { log, persistent, store, apn_config, allocator, downstream })
    }

    /// The entity store.  Reads are served from memory.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The persistent database, for the APN tables and allocations, which
    /// are not mirrored.
    pub fn persistent(&self) -> &Arc<SqlStore> {
        &self.persistent
    }

    pub fn apn_config(&self) -> &Arc<ApnConfigCache> {
        &self.apn_config
    }

    pub fn allocator(&self) -> &IpAllocator {
        &self.allocator
    }

    pub fn downstream(&self) -> &DownstreamQueue {
        &self.downstream
    }

    /// Picks up APN and NAS changes made in the database.
    ///
    /// NASes that are new since the last load get their address range built
    /// on first use.
    pub async fn reload_apn_config(&self) -> anyhow::Result<()> {
        self.apn_config
            .reload(self.persistent.as_ref())
            .await
            .context("reloading APN configuration")?;
        info!(&self.log, "APN configuration reloaded");
        Ok(())
    }

    /// Queues `payload` for delivery to a device, returning the new
    /// message's key.
    pub async fn queue_message(
        &self,
        apn_id: i32,
        nas_id: i32,
        device_id: Key,
        transport: Transport,
        payload: Vec<u8>,
    ) -> CreateResult<Key> {
        let message_id = self.store.new_id(KeyKind::Message).await;
        self.downstream
            .create(apn_id, nas_id, device_id, message_id, transport, payload)
            .await?;
        Ok(message_id)
    }
}
