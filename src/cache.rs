//! Generic reference-counted resource cache.
//!
//! Every long-lived on-disk resource in this crate (pages, framed records)
//! is loaded through one of these caches. The cache guarantees that a given
//! key is loaded by at most one thread at a time: concurrent callers for the
//! same key block on a condition variable instead of racing the loader.
//!
//! The loader/releaser are injected as plain function values rather than
//! through a trait the cache implements — PC and RS each hold their own
//! instance, specialized by the closures they pass in.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

struct Inner<K, V> {
    cache: HashMap<K, V>,
    refs: HashMap<K, u64>,
    loading: HashMap<K, bool>,
    max_resource: usize,
}

type Loader<K, V> = Box<dyn Fn(&K) -> Result<V> + Send + Sync>;
type Releaser<K, V> = Box<dyn Fn(&K, &V) -> Result<()> + Send + Sync>;

/// A reference-counted cache of values of type `V` keyed by `K`.
///
/// `max_resource == 0` means unbounded.
pub struct ResourceCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    inner: Mutex<Inner<K, V>>,
    not_loading: Condvar,
    loader: Loader<K, V>,
    releaser: Releaser<K, V>,
}

impl<K, V> ResourceCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(
        max_resource: usize,
        loader: impl Fn(&K) -> Result<V> + Send + Sync + 'static,
        releaser: impl Fn(&K, &V) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        ResourceCache {
            inner: Mutex::new(Inner {
                cache: HashMap::new(),
                refs: HashMap::new(),
                loading: HashMap::new(),
                max_resource,
            }),
            not_loading: Condvar::new(),
            loader: Box::new(loader),
            releaser: Box::new(releaser),
        }
    }

    fn addable(inner: &Inner<K, V>, key: &K) -> bool {
        !inner.cache.contains_key(key) && !inner.loading.contains_key(key)
    }

    /// Obtain a reference to the resource named by `key`, loading it if
    /// necessary. Bumps the reference count by one.
    pub fn get(&self, key: K) -> Result<V> {
        let mut guard = self.inner.lock();
        loop {
            if let Some(v) = guard.cache.get(&key).cloned() {
                *guard.refs.entry(key.clone()).or_insert(0) += 1;
                return Ok(v);
            }
            if *guard.loading.get(&key).unwrap_or(&false) {
                self.not_loading.wait(&mut guard);
                continue;
            }
            if guard.max_resource != 0
                && Self::addable(&guard, &key)
                && guard.cache.len() >= guard.max_resource
            {
                return Err(Error::CacheFull);
            }
            guard.loading.insert(key.clone(), true);
            break;
        }
        drop(guard);

        let loaded = (self.loader)(&key);

        let mut guard = self.inner.lock();
        guard.loading.remove(&key);
        self.not_loading.notify_all();
        match loaded {
            Ok(v) => {
                guard.cache.insert(key.clone(), v.clone());
                guard.refs.insert(key, 1);
                Ok(v)
            }
            Err(e) => Err(e),
        }
    }

    /// Release one reference on `key`. Once the count reaches zero the
    /// resource is evicted and `releaser` is invoked.
    pub fn release(&self, key: &K) -> Result<()> {
        let mut guard = self.inner.lock();
        let evicted = match guard.refs.get_mut(key) {
            Some(r) if *r > 1 => {
                *r -= 1;
                None
            }
            Some(_) => {
                guard.refs.remove(key);
                guard.cache.remove(key)
            }
            None => None,
        };
        drop(guard);

        if let Some(v) = evicted {
            (self.releaser)(key, &v)?;
        }
        Ok(())
    }

    /// Apply `f` to every still-cached value, e.g. to flush dirty pages on
    /// shutdown. Does not touch reference counts.
    pub fn for_each<F: FnMut(&K, &V) -> Result<()>>(&self, mut f: F) -> Result<()> {
        let guard = self.inner.lock();
        for (k, v) in guard.cache.iter() {
            f(k, v)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn get_loads_once_and_caches() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads2 = loads.clone();
        let cache: ResourceCache<u32, u32> = ResourceCache::new(
            16,
            move |k: &u32| {
                loads2.fetch_add(1, Ordering::SeqCst);
                Ok(*k * 10)
            },
            |_k: &u32, _v: &u32| Ok(()),
        );

        assert_eq!(cache.get(1).unwrap(), 10);
        assert_eq!(cache.get(1).unwrap(), 10);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn release_to_zero_evicts_and_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let released2 = released.clone();
        let cache: ResourceCache<u32, u32> = ResourceCache::new(
            16,
            |k: &u32| Ok(*k),
            move |_k: &u32, _v: &u32| {
                released2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        cache.get(5).unwrap();
        cache.get(5).unwrap();
        assert_eq!(cache.len(), 1);
        cache.release(&5).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        cache.release(&5).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn full_cache_rejects_new_keys_but_allows_hits() {
        let cache: ResourceCache<u32, u32> =
            ResourceCache::new(1, |k: &u32| Ok(*k), |_k: &u32, _v: &u32| Ok(()));
        cache.get(1).unwrap();
        assert_eq!(cache.get(1).unwrap(), 1);
        assert!(cache.get(2).is_err());
    }

    #[test]
    fn zero_capacity_means_unbounded() {
        let cache: ResourceCache<u32, u32> =
            ResourceCache::new(0, |k: &u32| Ok(*k), |_k: &u32, _v: &u32| Ok(()));
        for i in 0..50 {
            cache.get(i).unwrap();
        }
        assert_eq!(cache.len(), 50);
    }

    #[test]
    fn concurrent_get_loads_exactly_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads2 = loads.clone();
        let cache = Arc::new(ResourceCache::<u32, u32>::new(
            16,
            move |_k: &u32| {
                loads2.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                Ok(42u32)
            },
            |_k: &u32, _v: &u32| Ok(()),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = cache.clone();
            handles.push(std::thread::spawn(move || c.get(1).unwrap()));
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
