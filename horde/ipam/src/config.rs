// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cached APN and NAS configuration

use horde_common::api::external::Error;
use horde_db_model::Apn;
use horde_db_model::Nas;
use horde_db_queries::db::datastore::ApnStore;
use ipnetwork::Ipv4Network;
use slog::Logger;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

/// A configured NAS and its address range
#[derive(Debug)]
pub struct NasEntry {
    log: Logger,
    nas: Nas,
    /// Parsed on first use.  `None` when the CIDR is invalid.
    network: OnceLock<Option<Ipv4Network>>,
}

impl NasEntry {
    fn new(log: &Logger, nas: Nas) -> NasEntry {
        let log = log.new(o!(
            "nas_id" => nas.id,
            "nas" => nas.identifier.clone(),
        ));
        NasEntry { log, nas, network: OnceLock::new() }
    }

    pub fn nas(&self) -> &Nas {
        &self.nas
    }

    pub fn id(&self) -> i32 {
        self.nas.id
    }

    pub fn apn_id(&self) -> i32 {
        self.nas.apn_id
    }

    /// The NAS's address range, or `None` if its CIDR does not parse.
    pub fn network(&self) -> Option<Ipv4Network> {
        *self.network.get_or_init(|| {
            match self.nas.cidr.parse::<Ipv4Network>() {
                Ok(network) => Some(network),
                Err(e) => {
                    error!(
                        &self.log,
                        "invalid NAS address range";
                        "cidr" => &self.nas.cidr,
                        "error" => %e,
                    );
                    None
                }
            }
        })
    }

    /// Whether `ip` is in the NAS's address range.  A NAS with an invalid
    /// range contains nothing.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.network().is_some_and(|network| network.contains(ip))
    }
}

/// An APN and its NASes
#[derive(Debug)]
pub struct ApnEntry {
    pub apn: Apn,
    pub nases: Vec<Arc<NasEntry>>,
}

/// A consistent snapshot of the configuration
#[derive(Debug, Default)]
pub struct ApnConfig {
    pub apns: Vec<ApnEntry>,
}

impl ApnConfig {
    /// Every configured NAS.
    pub fn nases(&self) -> impl Iterator<Item = &Arc<NasEntry>> {
        self.apns.iter().flat_map(|apn| apn.nases.iter())
    }

    async fn load(
        log: &Logger,
        store: &dyn ApnStore,
    ) -> Result<ApnConfig, Error> {
        let mut apns = Vec::new();
        for apn in store.list_apns().await? {
            let nases = store
                .list_nas(apn.id)
                .await?
                .into_iter()
                .map(|nas| Arc::new(NasEntry::new(log, nas)))
                .collect();
            apns.push(ApnEntry { apn, nases });
        }
        Ok(ApnConfig { apns })
    }
}

/// Snapshot of the APN configuration that can be reloaded while in use
///
/// Lookups see either the old or the new snapshot, never a mix.  The lock is
/// only held to swap or clone the snapshot pointer.
pub struct ApnConfigCache {
    log: Logger,
    snapshot: Mutex<Arc<ApnConfig>>,
}

impl ApnConfigCache {
    /// Creates a cache with the configuration currently in `store`.
    pub async fn new(
        log: &Logger,
        store: &dyn ApnStore,
    ) -> Result<ApnConfigCache, Error> {
        let log = log.new(o!("component" => "ApnConfigCache"));
        let config = ApnConfig::load(&log, store).await?;
        info!(
            &log,
            "loaded APN configuration";
            "apns" => config.apns.len(),
            "nases" => config.nases().count(),
        );
        Ok(ApnConfigCache { log, snapshot: Mutex::new(Arc::new(config)) })
    }

    /// Replaces the snapshot with the configuration currently in `store`.
    /// On error the old snapshot stays in place.
    pub async fn reload(&self, store: &dyn ApnStore) -> Result<(), Error> {
        let config = ApnConfig::load(&self.log, store).await?;
        info!(
            &self.log,
            "reloaded APN configuration";
            "apns" => config.apns.len(),
            "nases" => config.nases().count(),
        );
        *self.snapshot.lock().unwrap() = Arc::new(config);
        Ok(())
    }

    /// The current snapshot.
    pub fn list(&self) -> Arc<ApnConfig> {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn find_nas_by_identifier(
        &self,
        identifier: &str,
    ) -> Option<Arc<NasEntry>> {
        self.list().nases().find(|n| n.nas.identifier == identifier).cloned()
    }

    pub fn find_nas_by_id(&self, nas_id: i32) -> Option<Arc<NasEntry>> {
        self.list().nases().find(|n| n.nas.id == nas_id).cloned()
    }

    pub fn find_apn(&self, apn_id: i32) -> Option<Apn> {
        self.list()
            .apns
            .iter()
            .find(|entry| entry.apn.id == apn_id)
            .map(|entry| entry.apn.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use horde_db_queries::db::pub_test_utils::fixtures;
    use horde_db_queries::db::pub_test_utils::TestDatabase;
    use horde_test_utils::dev;

    #[tokio::test]
    async fn test_lookup_and_reload() {
        let logctx = dev::test_setup_log("test_lookup_and_reload");
        let db = TestDatabase::new(&logctx.log).await;
        let store = db.store().as_ref();
        fixtures::apn(&db, 1, "mda.ee").await;
        fixtures::nas(&db, 1, 10, "10.1.1.1/24").await;
        fixtures::nas(&db, 1, 11, "not a range").await;

        let cache = ApnConfigCache::new(&logctx.log, store).await.unwrap();
        assert_eq!(cache.find_apn(1).unwrap().name, "mda.ee");
        assert!(cache.find_apn(2).is_none());

        let nas = cache.find_nas_by_identifier("nas-10").unwrap();
        assert_eq!((nas.id(), nas.apn_id()), (10, 1));
        assert_eq!(nas.network(), Some("10.1.1.1/24".parse().unwrap()));
        assert!(nas.contains(Ipv4Addr::new(10, 1, 1, 77)));
        assert!(!nas.contains(Ipv4Addr::new(10, 1, 2, 1)));

        let broken = cache.find_nas_by_id(11).unwrap();
        assert_eq!(broken.network(), None);
        assert!(!broken.contains(Ipv4Addr::new(10, 1, 1, 77)));

        // A snapshot taken before a reload is unaffected by it.
        let before = cache.list();
        fixtures::apn(&db, 2, "mda2.ee").await;
        fixtures::nas(&db, 2, 20, "10.2.0.1/16").await;
        assert!(cache.find_nas_by_id(20).is_none());
        cache.reload(store).await.unwrap();
        assert_eq!(cache.find_nas_by_id(20).unwrap().apn_id(), 2);
        assert_eq!(cache.find_apn(2).unwrap().name, "mda2.ee");
        assert_eq!(before.nases().count(), 2);
        assert_eq!(cache.list().nases().count(), 3);
        logctx.cleanup_successful();
    }
}
