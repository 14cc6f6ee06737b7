use crate::error::{Error, Result};
use crate::store::{ElementStore, ExtractionQuery};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub type Connector = dyn Fn(&str) -> Result<Box<dyn ElementStore>> + Send + Sync;

struct CollectionPool {
    idle: Mutex<Vec<Box<dyn ElementStore>>>,
    available: Condvar,
    size: usize,
    closed: AtomicBool,
}

/// Fixed-size sets of store clients, one set per collection.
pub struct ElementStorePool {
    pools: HashMap<String, CollectionPool>,
    acquire_timeout: Duration,
}

impl ElementStorePool {
    pub fn new<I, S>(collections: I, clients_per_collection: usize, acquire_timeout: Duration, connect: &Connector) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if clients_per_collection == 0 {
            return Err(Error::Configuration("pool size must be at least 1".into()));
        }
        let mut pools = HashMap::new();
        for collection in collections {
            let collection = collection.into();
            let mut idle = Vec::with_capacity(clients_per_collection);
            for _ in 0..clients_per_collection {
                idle.push(connect(&collection)?);
            }
            pools.insert(
                collection,
                CollectionPool {
                    idle: Mutex::new(idle),
                    available: Condvar::new(),
                    size: clients_per_collection,
                    closed: AtomicBool::new(false),
                },
            );
        }
        info!(collections = pools.len(), clients_per_collection, "element store pool ready");
        Ok(Self { pools, acquire_timeout })
    }

    /// Waits for a free client of `collection`, at most the acquire timeout.
    pub fn acquire(&self, collection: &str) -> Result<PooledClient<'_>> {
        let pool = self
            .pools
            .get(collection)
            .ok_or_else(|| Error::Configuration(format!("unknown collection {collection}")))?;
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        let mut idle = pool.idle.lock();
        loop {
            if pool.closed.load(Ordering::Acquire) {
                return Err(Error::Configuration(format!("pool for {collection} is closed")));
            }
            if let Some(client) = idle.pop() {
                return Ok(PooledClient { client: Some(client), home: pool });
            }
            if pool.available.wait_until(&mut idle, deadline).timed_out() && idle.is_empty() {
                debug!(collection, "no free store client");
                return Err(Error::Timeout {
                    operation: format!("acquire store client for {collection}"),
                    elapsed: started.elapsed(),
                });
            }
        }
    }

    pub fn collections(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.pools.contains_key(collection)
    }

    pub fn size(&self, collection: &str) -> Option<usize> {
        self.pools.get(collection).map(|p| p.size)
    }

    pub fn idle(&self, collection: &str) -> Option<usize> {
        self.pools.get(collection).map(|p| p.idle.lock().len())
    }

    /// Drops every idle client. Clients still checked out are dropped on
    /// release and later acquires fail.
    pub fn close(&self) {
        for pool in self.pools.values() {
            pool.closed.store(true, Ordering::Release);
            pool.idle.lock().clear();
            pool.available.notify_all();
        }
        info!("element store pool closed");
    }
}

/// Exclusive use of one client; returned to its pool when dropped.
pub struct PooledClient<'a> {
    client: Option<Box<dyn ElementStore>>,
    home: &'a CollectionPool,
}

impl PooledClient<'_> {
    pub fn execute(&mut self, query: &ExtractionQuery) -> Result<String> {
        match self.client.as_mut() {
            Some(client) => client.execute(query),
            None => Err(Error::Configuration("store client already released".into())),
        }
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else { return };
        if self.home.closed.load(Ordering::Acquire) {
            return;
        }
        self.home.idle.lock().push(client);
        self.home.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryElementStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn memory(_: &str) -> Result<Box<dyn ElementStore>> {
        Ok(Box::new(MemoryElementStore::new()))
    }

    #[test]
    fn acquire_and_release() {
        let pool = ElementStorePool::new(["a", "b"], 2, Duration::from_millis(50), &memory).unwrap();
        assert_eq!(pool.collections(), vec!["a", "b"]);
        let first = pool.acquire("a").unwrap();
        let _second = pool.acquire("a").unwrap();
        assert_eq!(pool.idle("a"), Some(0));
        assert_eq!(pool.idle("b"), Some(2));
        drop(first);
        assert_eq!(pool.idle("a"), Some(1));
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = ElementStorePool::new(["a"], 1, Duration::from_millis(30), &memory).unwrap();
        let _held = pool.acquire("a").unwrap();
        let err = pool.acquire("a").err().unwrap();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn unknown_collection_and_closed_pool() {
        let pool = ElementStorePool::new(["a"], 1, Duration::from_millis(30), &memory).unwrap();
        assert!(matches!(pool.acquire("zz").err().unwrap(), Error::Configuration(_)));
        pool.close();
        assert_eq!(pool.idle("a"), Some(0));
        assert!(pool.acquire("a").is_err());
    }

    #[test]
    fn clients_are_never_shared() {
        let pool = Arc::new(ElementStorePool::new(["a"], 2, Duration::from_secs(5), &memory).unwrap());
        let in_use = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (pool, in_use, max_seen) = (pool.clone(), in_use.clone(), max_seen.clone());
                thread::spawn(move || {
                    for _ in 0..20 {
                        let mut client = pool.acquire("a").unwrap();
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        client.execute(&ExtractionQuery::document("a", "d", 1)).unwrap();
                        in_use.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.idle("a"), Some(2));
    }

    #[test]
    fn connector_failure_is_reported() {
        let failing = |c: &str| -> Result<Box<dyn ElementStore>> { Err(Error::Configuration(format!("no store for {c}"))) };
        assert!(ElementStorePool::new(["a"], 1, Duration::from_millis(10), &failing).is_err());
    }
}
