//! In-memory backend (testing only)
//!
//! Behaves like a content-addressed store keyed by CID, with knobs to make
//! individual operations fail or stall so partial-failure and ordering
//! behaviour of the pipeline can be exercised deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Backend, StorageError, StorageResult};
use crate::car::read_car;
use crate::codec::{ContentId, IdentifierUrl};

#[derive(Debug, Default)]
struct Faults {
    store: HashSet<String>,
    panic_store: HashSet<String>,
    fetch: bool,
    size: bool,
    publish: bool,
    delays: HashMap<String, Duration>,
}

/// In-memory content-addressed backend backed by a `HashMap<cid, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    blocks: Mutex<HashMap<ContentId, Vec<u8>>>,
    faults: Mutex<Faults>,
    published: Mutex<Vec<Vec<u8>>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a dag-pb block directly (e.g. a template) and return its URL.
    pub fn insert_node_block(&self, bytes: &[u8]) -> String {
        let cid = ContentId::hash(bytes);
        self.blocks.lock().unwrap().insert(cid, bytes.to_vec());
        format!("{}/", cid.to_url())
    }

    /// Make `store` fail for the file called `name`.
    pub fn fail_store_for(&self, name: &str) {
        self.faults.lock().unwrap().store.insert(name.to_string());
    }

    /// Make `store` panic for the file called `name`.
    pub fn panic_store_for(&self, name: &str) {
        self.faults.lock().unwrap().panic_store.insert(name.to_string());
    }

    /// Make `store` for `name` wait `delay` before completing.
    pub fn delay_store_for(&self, name: &str, delay: Duration) {
        self.faults
            .lock()
            .unwrap()
            .delays
            .insert(name.to_string(), delay);
    }

    pub fn fail_fetch(&self) {
        self.faults.lock().unwrap().fetch = true;
    }

    pub fn fail_size(&self) {
        self.faults.lock().unwrap().size = true;
    }

    pub fn fail_publish(&self, fail: bool) {
        self.faults.lock().unwrap().publish = fail;
    }

    /// Containers accepted by `publish_container`, in order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.published.lock().unwrap().clone()
    }

    pub fn get(&self, cid: &ContentId) -> Option<Vec<u8>> {
        self.blocks.lock().unwrap().get(cid).cloned()
    }

    /// Highest number of `store` calls observed running at once.
    pub fn peak_concurrent_stores(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &str) -> StorageResult<Vec<u8>> {
        let cid = IdentifierUrl::parse(url)
            .map_err(|e| StorageError::InvalidIdentifier(e.to_string()))?
            .cid();
        self.get(&cid).ok_or_else(|| StorageError::NotFound {
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn store(&self, name: &str, data: &[u8]) -> StorageResult<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let (fail, panics, delay) = {
            let faults = self.faults.lock().unwrap();
            (
                faults.store.contains(name),
                faults.panic_store.contains(name),
                faults.delays.get(name).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        // Yield so sibling uploads get scheduled before this one settles.
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if panics {
            panic!("injected store panic for {name}");
        }
        if fail {
            return Err(StorageError::Rejected(format!("injected store failure for {name}")));
        }
        let cid = ContentId::hash_raw(data);
        self.blocks.lock().unwrap().insert(cid, data.to_vec());
        Ok(cid.to_url())
    }

    async fn size_of(&self, url: &str) -> StorageResult<u64> {
        if self.faults.lock().unwrap().size {
            return Err(StorageError::Rejected("injected size failure".to_string()));
        }
        Ok(self.lookup(url)?.len() as u64)
    }

    async fn fetch_raw(&self, url: &str) -> StorageResult<Vec<u8>> {
        if self.faults.lock().unwrap().fetch {
            return Err(StorageError::Rejected("injected fetch failure".to_string()));
        }
        self.lookup(url)
    }

    async fn publish_container(&self, car: &[u8]) -> StorageResult<Vec<String>> {
        if self.faults.lock().unwrap().publish {
            return Err(StorageError::Rejected("injected publish failure".to_string()));
        }
        let contents = read_car(car).map_err(|e| StorageError::Rejected(e.to_string()))?;
        if contents.blocks.len() < 2 {
            return Err(StorageError::Rejected(
                "single-block containers are not accepted".to_string(),
            ));
        }
        {
            let mut blocks = self.blocks.lock().unwrap();
            for block in contents.blocks {
                blocks.insert(block.cid(), block.into_bytes());
            }
        }
        self.published.lock().unwrap().push(car.to_vec());
        Ok(contents.roots.iter().map(|r| format!("{}/", r.to_url())).collect())
    }
}
