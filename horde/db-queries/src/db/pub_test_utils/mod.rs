// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test support code that can be enabled by dependencies via this crate's
//! `testing` feature.
//!
//! This feature should only be enabled under `dev-dependencies` to avoid this
//! test support code leaking into release binaries.

use crate::db::keygen::KeyGenerators;
use crate::db::keygen::DEFAULT_BLOCK_SIZE;
use crate::db::Pool;
use crate::db::SqlStore;
use horde_common::key::Key;
use horde_common::key::KeyKind;
use horde_common::key::KeyOrigin;
use slog::Logger;
use std::sync::Arc;

pub mod fixtures;

/// A fresh in-memory database with the schema applied, plus key generators
/// minting keys from it
pub struct TestDatabase {
    store: Arc<SqlStore>,
    keys: KeyGenerators,
}

impl TestDatabase {
    pub async fn new(log: &Logger) -> TestDatabase {
        let pool = Arc::new(Pool::new_in_memory(log).unwrap());
        let store = Arc::new(SqlStore::new(log, pool).await.unwrap());
        let keys = KeyGenerators::new(
            log,
            KeyOrigin::new(1, 1).unwrap(),
            DEFAULT_BLOCK_SIZE,
            store.clone(),
        );
        TestDatabase { store, keys }
    }

    pub fn store(&self) -> &Arc<SqlStore> {
        &self.store
    }

    pub fn keys(&self) -> &KeyGenerators {
        &self.keys
    }

    pub async fn new_id(&self, kind: KeyKind) -> Key {
        self.keys.new_id(kind).await
    }
}
