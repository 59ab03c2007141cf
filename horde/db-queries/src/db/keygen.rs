// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key generator
//!
//! Each generator owns a window `[current, max)` of sequence values for one
//! `(kind, data center, worker)` triple and hands out keys from it without
//! touching the database.  When the window is used up, the generator
//! reserves the next block of the triple's sequence counter with a
//! compare-and-set, so any number of generators (in this process or
//! others) can share a triple without ever minting the same key.
//!
//! A generator is an actor: a task owns the window and serves requests
//! arriving on a channel, one at a time.

use super::datastore::SequenceStore;
use horde_common::api::external::Error;
use horde_common::key::sequence_name;
use horde_common::key::Key;
use horde_common::key::KeyKind;
use horde_common::key::KeyOrigin;
use horde_common::key::MAX_SEQUENCE;
use rand::thread_rng;
use rand::Rng;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

/// Default number of sequence values reserved per block.
pub const DEFAULT_BLOCK_SIZE: u64 = 10;

/// Upper bound on the randomized wait after a lost compare-and-set.
const MAX_BACKOFF: Duration = Duration::from_millis(10);

/// Handle to a running key generator
#[derive(Clone)]
pub struct KeyGenerator {
    name: Arc<str>,
    requests: mpsc::UnboundedSender<oneshot::Sender<Key>>,
}

impl KeyGenerator {
    /// Starts a generator for keys of `kind` minted by `origin`.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        log: &Logger,
        kind: &str,
        origin: KeyOrigin,
        block_size: u64,
        store: Arc<dyn SequenceStore>,
    ) -> KeyGenerator {
        let name = sequence_name(kind, &origin);
        let log = log.new(o!(
            "component" => "KeyGenerator",
            "sequence" => name.clone(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let window = Window {
            log,
            name: name.clone(),
            origin,
            block_size: block_size.max(1) as i64,
            current: 0,
            max: 0,
            store,
        };
        tokio::spawn(window.serve(rx));
        KeyGenerator { name: name.into(), requests: tx }
    }

    /// Returns a new key.
    ///
    /// # Panics
    ///
    /// Panics if the generator has stopped after an unrecoverable error from
    /// the sequence store.  No further keys can be minted safely.
    pub async fn new_id(&self) -> Key {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(tx).is_err() {
            panic!("key generator for {:?} has stopped", self.name);
        }
        match rx.await {
            Ok(key) => key,
            Err(_) => panic!("key generator for {:?} has stopped", self.name),
        }
    }
}

/// State owned by the generator task
struct Window {
    log: Logger,
    name: String,
    origin: KeyOrigin,
    block_size: i64,
    current: i64,
    max: i64,
    store: Arc<dyn SequenceStore>,
}

impl Window {
    async fn serve(
        mut self,
        mut requests: mpsc::UnboundedReceiver<oneshot::Sender<Key>>,
    ) {
        while let Some(reply) = requests.recv().await {
            if self.current == self.max {
                self.allocate_block().await;
            }
            let key = self.origin.pack(self.current as u64);
            self.current += 1;
            // The requester may have gone away; the key is simply skipped.
            let _ = reply.send(key);
        }
        debug!(&self.log, "key generator stopping");
    }

    /// Reserves the next block of the sequence, retrying until it succeeds.
    async fn allocate_block(&mut self) {
        loop {
            let current = match self.store.current_sequence(&self.name).await
            {
                Ok(v) => v,
                // Sequences start at 1 so that no key is zero.
                Err(Error::ObjectNotFound { .. }) => 1,
                Err(e) => {
                    self.check_retryable(e);
                    backoff().await;
                    continue;
                }
            };
            let next = current + self.block_size;
            if next as u64 > MAX_SEQUENCE {
                crit!(&self.log, "sequence exhausted"; "counter" => current);
                panic!("sequence {:?} exhausted", self.name);
            }
            match self.store.allocate_sequence(&self.name, current, next).await
            {
                Ok(true) => {
                    debug!(
                        &self.log,
                        "allocated block";
                        "start" => current,
                        "end" => next,
                    );
                    self.current = current;
                    self.max = next;
                    return;
                }
                Ok(false) => {
                    trace!(&self.log, "lost block race"; "counter" => current);
                }
                Err(e) => self.check_retryable(e),
            }
            backoff().await;
        }
    }

    /// Logs a sequence store error, panicking unless it is transient.
    fn check_retryable(&self, error: Error) {
        if error.retryable() {
            warn!(
                &self.log,
                "sequence store unavailable, retrying";
                "error" => %error,
            );
        } else {
            crit!(
                &self.log,
                "sequence store failed";
                "error" => %error,
            );
            panic!("sequence {:?}: {}", self.name, error);
        }
    }
}

async fn backoff() {
    let millis = thread_rng().gen_range(0..=MAX_BACKOFF.as_millis() as u64);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

/// One lazily started generator per key kind, for a single origin
pub struct KeyGenerators {
    log: Logger,
    origin: KeyOrigin,
    block_size: u64,
    store: Arc<dyn SequenceStore>,
    generators: Mutex<BTreeMap<KeyKind, KeyGenerator>>,
}

impl KeyGenerators {
    pub fn new(
        log: &Logger,
        origin: KeyOrigin,
        block_size: u64,
        store: Arc<dyn SequenceStore>,
    ) -> Self {
        KeyGenerators {
            log: log.clone(),
            origin,
            block_size,
            store,
            generators: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    /// Returns a new key of the given kind.
    ///
    /// # Panics
    ///
    /// See [`KeyGenerator::new_id`].
    pub async fn new_id(&self, kind: KeyKind) -> Key {
        let generator = self
            .generators
            .lock()
            .unwrap()
            .entry(kind)
            .or_insert_with(|| {
                KeyGenerator::start(
                    &self.log,
                    kind.as_str(),
                    self.origin,
                    self.block_size,
                    self.store.clone(),
                )
            })
            .clone();
        generator.new_id().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::pub_test_utils::TestDatabase;
    use async_trait::async_trait;
    use horde_common::api::external::LookupResult;
    use horde_test_utils::dev;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_keys_are_unique_under_contention() {
        let logctx = dev::test_setup_log("test_keys_are_unique_under_contention");
        let db = TestDatabase::new(&logctx.log).await;
        let store: Arc<dyn SequenceStore> = db.store().clone();

        let origins = [
            KeyOrigin::new(1, 1).unwrap(),
            KeyOrigin::new(1, 1).unwrap(),
            KeyOrigin::new(2, 1).unwrap(),
            KeyOrigin::new(2, 1).unwrap(),
        ];
        let mut tasks = Vec::new();
        for origin in origins {
            let generator = KeyGenerator::start(
                &logctx.log,
                "test",
                origin,
                DEFAULT_BLOCK_SIZE,
                store.clone(),
            );
            tasks.push(tokio::spawn(async move {
                let mut keys = Vec::new();
                for _ in 0..100 {
                    keys.push(generator.new_id().await);
                }
                keys
            }));
        }

        let mut all = BTreeSet::new();
        for task in tasks {
            let keys = task.await.unwrap();
            // Keys from one generator are strictly increasing.
            assert!(keys.windows(2).all(|w| w[0] < w[1]));
            all.extend(keys);
        }
        assert_eq!(all.len(), 400);
        assert!(all.iter().all(|k| !k.is_unset()));

        // Both triples have reserved at least the 200 values handed out.
        for name in ["test/1/1", "test/2/1"] {
            assert!(store.current_sequence(name).await.unwrap() >= 201);
        }
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_keys_survive_restart() {
        let logctx = dev::test_setup_log("test_keys_survive_restart");
        let db = TestDatabase::new(&logctx.log).await;
        let store: Arc<dyn SequenceStore> = db.store().clone();
        let origin = KeyOrigin::new(3, 7).unwrap();

        let first = KeyGenerators::new(&logctx.log, origin, 10, store.clone());
        let a = first.new_id(KeyKind::Device).await;
        let b = first.new_id(KeyKind::Device).await;
        assert!(a < b);
        assert_eq!(a.origin(), origin);
        assert_eq!(a.sequence(), 1);

        // A fresh generator resumes after the reserved block.
        let second = KeyGenerators::new(&logctx.log, origin, 10, store);
        let c = second.new_id(KeyKind::Device).await;
        assert!(c > b);
        assert_eq!(c.sequence(), 11);

        // Kinds have independent sequences.
        let d = second.new_id(KeyKind::Team).await;
        assert_eq!(d.sequence(), 1);
        logctx.cleanup_successful();
    }

    /// Sequence store that is unavailable for a while, then works.
    struct Flaky {
        failures: AtomicUsize,
        inner: Arc<dyn SequenceStore>,
    }

    #[async_trait]
    impl SequenceStore for Flaky {
        async fn current_sequence(&self, name: &str) -> LookupResult<i64> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    n.checked_sub(1)
                })
                .is_ok()
            {
                return Err(Error::unavail("database restarting"));
            }
            self.inner.current_sequence(name).await
        }

        async fn allocate_sequence(
            &self,
            name: &str,
            expected: i64,
            new_value: i64,
        ) -> Result<bool, Error> {
            self.inner.allocate_sequence(name, expected, new_value).await
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let logctx = dev::test_setup_log("test_transient_errors_are_retried");
        let db = TestDatabase::new(&logctx.log).await;
        let store = Arc::new(Flaky {
            failures: AtomicUsize::new(3),
            inner: db.store().clone(),
        });
        let generator = KeyGenerator::start(
            &logctx.log,
            "test",
            KeyOrigin::new(0, 0).unwrap(),
            DEFAULT_BLOCK_SIZE,
            store.clone(),
        );
        assert_eq!(generator.new_id().await.sequence(), 1);
        assert_eq!(store.failures.load(Ordering::SeqCst), 0);
        logctx.cleanup_successful();
    }

    struct Broken;

    #[async_trait]
    impl SequenceStore for Broken {
        async fn current_sequence(&self, _name: &str) -> LookupResult<i64> {
            Err(Error::internal_error("schema missing"))
        }

        async fn allocate_sequence(
            &self,
            _name: &str,
            _expected: i64,
            _new_value: i64,
        ) -> Result<bool, Error> {
            Err(Error::internal_error("schema missing"))
        }
    }

    #[tokio::test]
    #[should_panic(expected = "has stopped")]
    async fn test_permanent_errors_stop_the_generator() {
        let logctx = dev::test_setup_log("test_permanent_errors_stop_the_generator");
        let generator = KeyGenerator::start(
            &logctx.log,
            "test",
            KeyOrigin::new(0, 0).unwrap(),
            DEFAULT_BLOCK_SIZE,
            Arc::new(Broken),
        );
        generator.new_id().await;
    }
}
