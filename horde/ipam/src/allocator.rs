// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent, per-IMSI address allocation

use crate::config::ApnConfigCache;
use crate::config::NasEntry;
use crate::range::RangeAllocator;
use horde_common::api::external::DeleteResult;
use horde_common::api::external::Error;
use horde_db_model::now;
use horde_db_model::Allocation;
use horde_db_queries::db::datastore::ApnStore;
use slog::Logger;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;

/// Range allocator of one NAS and the APN it was built for
struct NasRange {
    apn_id: i32,
    range: RangeAllocator,
}

/// Range of one NAS, built on first use
type RangeSlot = Arc<AsyncMutex<Option<NasRange>>>;

/// Allocates device addresses on the configured NASes, persisting every
/// allocation in the APN store
///
/// An IMSI holds at most one address per NAS: allocating again returns the
/// address it already has.  Each NAS's range is rebuilt from the persisted
/// allocations the first time it is used, so nothing is lost across
/// restarts.
///
/// Allocation on a NAS runs under that NAS's lock from the lookup of an
/// existing allocation until the new one is persisted.  NASes do not share
/// locks.
///
/// A built range is only used while the NAS's current configuration has the
/// same APN and CIDR; after a reload that changes either, the range is
/// rebuilt.
pub struct IpAllocator {
    log: Logger,
    config: Arc<ApnConfigCache>,
    store: Arc<dyn ApnStore>,
    ranges: Mutex<BTreeMap<i32, RangeSlot>>,
}

impl IpAllocator {
    pub fn new(
        log: &Logger,
        config: Arc<ApnConfigCache>,
        store: Arc<dyn ApnStore>,
    ) -> IpAllocator {
        IpAllocator {
            log: log.new(o!("component" => "IpAllocator")),
            config,
            store,
            ranges: Mutex::new(BTreeMap::new()),
        }
    }

    fn find_nas(&self, nas_id: i32) -> Result<Arc<NasEntry>, Error> {
        self.config
            .find_nas_by_id(nas_id)
            .ok_or_else(|| Error::invalid_request("unknown NAS range"))
    }

    fn slot(&self, nas_id: i32) -> RangeSlot {
        self.ranges.lock().unwrap().entry(nas_id).or_default().clone()
    }

    /// Builds the range allocator of `nas` from its persisted allocations.
    async fn build(&self, nas: &NasEntry) -> Result<RangeAllocator, Error> {
        let network = nas.network().ok_or_else(|| {
            Error::invalid_request(&format!(
                "NAS {} has an invalid address range {:?}",
                nas.id(),
                nas.nas().cidr
            ))
        })?;
        let allocations =
            self.store.list_allocations(nas.apn_id(), nas.id()).await?;
        info!(
            &self.log,
            "building address range";
            "nas_id" => nas.id(),
            "range" => %network,
            "allocations" => allocations.len(),
        );
        Ok(RangeAllocator::rebuild(
            &self.log,
            network,
            allocations.into_iter().map(|a| a.ip),
        ))
    }

    /// The range of `nas` held in `slot`, built or rebuilt as needed.
    async fn range<'a>(
        &self,
        nas: &NasEntry,
        slot: &'a mut Option<NasRange>,
    ) -> Result<&'a mut RangeAllocator, Error> {
        let current = match slot.take() {
            Some(built)
                if built.apn_id == nas.apn_id()
                    && nas.network() == Some(built.range.network()) =>
            {
                built
            }
            stale => {
                if let Some(stale) = stale {
                    info!(
                        &self.log,
                        "NAS configuration changed";
                        "nas_id" => nas.id(),
                        "old_apn_id" => stale.apn_id,
                        "old_range" => %stale.range.network(),
                    );
                }
                NasRange { apn_id: nas.apn_id(), range: self.build(nas).await? }
            }
        };
        Ok(&mut slot.insert(current).range)
    }

    /// Returns the address of `imsi` on NAS `nas_id`, allocating one if
    /// needed.  The flag is true when the address was newly allocated.
    pub async fn allocate(
        &self,
        imsi: i64,
        imei: Option<i64>,
        nas_id: i32,
    ) -> Result<(Ipv4Addr, bool), Error> {
        let nas = self.find_nas(nas_id)?;
        let slot = self.slot(nas_id);
        let mut slot = slot.lock().await;

        match self.store.retrieve_allocation(imsi, nas.apn_id(), nas_id).await
        {
            Ok(existing) => return Ok((existing.ip, false)),
            Err(Error::ObjectNotFound { .. }) => (),
            Err(e) => return Err(e),
        }

        let range = self.range(&nas, &mut slot).await?;
        let ip = range.allocate().map_err(|e| {
            warn!(&self.log, "address range exhausted"; "nas_id" => nas_id);
            Error::from(e)
        })?;

        let allocation = Allocation {
            imsi,
            apn_id: nas.apn_id(),
            nas_id,
            imei,
            ip,
            created: now(),
        };
        if let Err(e) = self.store.create_allocation(&allocation).await {
            if let Err(release_error) = range.release(ip) {
                error!(
                    &self.log,
                    "failed to return unpersisted address";
                    "ip" => %ip,
                    "error" => %release_error,
                );
            }
            return Err(e);
        }
        debug!(
            &self.log,
            "allocated address";
            "imsi" => imsi,
            "nas_id" => nas_id,
            "ip" => %ip,
        );
        Ok((ip, true))
    }

    /// Releases the address `imsi` holds on NAS `nas_id`.
    pub async fn release(&self, imsi: i64, nas_id: i32) -> DeleteResult {
        let nas = self.find_nas(nas_id)?;
        let slot = self.slot(nas_id);
        let mut slot = slot.lock().await;

        let range = self.range(&nas, &mut slot).await?;
        let allocation =
            self.store.retrieve_allocation(imsi, nas.apn_id(), nas_id).await?;
        let ip = allocation.ip;
        self.store.delete_allocation(imsi, nas.apn_id(), nas_id).await?;
        // A persisted address the range does not track (outside the range,
        // for instance) has nothing to return.
        if let Err(e) = range.release(ip) {
            warn!(
                &self.log,
                "persisted allocation is not tracked by the range";
                "imsi" => imsi,
                "nas_id" => nas_id,
                "error" => %e,
            );
        }
        debug!(
            &self.log,
            "released address";
            "imsi" => imsi,
            "nas_id" => nas_id,
            "ip" => %ip,
        );
        Ok(())
    }

    /// Number of addresses left on NAS `nas_id`; 0 for an unknown NAS.
    pub async fn available(&self, nas_id: i32) -> Result<u64, Error> {
        let Some(nas) = self.config.find_nas_by_id(nas_id) else {
            return Ok(0);
        };
        let slot = self.slot(nas_id);
        let mut slot = slot.lock().await;
        Ok(self.range(&nas, &mut slot).await?.available())
    }

    /// Number of addresses handed out on NAS `nas_id`; 0 for an unknown NAS.
    pub async fn allocated(&self, nas_id: i32) -> Result<usize, Error> {
        let Some(nas) = self.config.find_nas_by_id(nas_id) else {
            return Ok(0);
        };
        let slot = self.slot(nas_id);
        let mut slot = slot.lock().await;
        Ok(self.range(&nas, &mut slot).await?.allocated())
    }

    /// Builds the range of every configured NAS that has not been built yet
    /// or whose configuration changed since.
    pub async fn rebuild_all(&self) -> Result<(), Error> {
        for nas in self.config.list().nases() {
            let slot = self.slot(nas.id());
            let mut slot = slot.lock().await;
            self.range(nas, &mut slot).await?;
        }
        Ok(())
    }
}
