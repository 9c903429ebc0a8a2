//! Shared page caches, one per device group
//!
//! Every descriptor opened on the same device group shares one
//! [`MemoryCache`]. The registry maps the first device address of a group to
//! its cache and tears the cache down when its last owner releases it.

use crate::core::cache::{MemoryCache, OwnerId};
use crate::core::config::WireFsConfig;
use crate::core::error::{Result, WireFsError};
use crate::core::provider::{Adapter, Device, DeviceAddress};
use ahash::AHashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One owner's reference to a shared cache
pub struct CacheHandle {
    key: DeviceAddress,
    owner: OwnerId,
    cache: Arc<Mutex<MemoryCache>>,
}

impl CacheHandle {
    /// Serialize on the cache. Every bus operation of the group runs under
    /// this lock.
    pub fn lock(&self) -> MutexGuard<'_, MemoryCache> {
        self.cache.lock()
    }

    pub fn key(&self) -> DeviceAddress {
        self.key
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Both handles refer to the same cache instance
    pub fn same_cache(&self, other: &CacheHandle) -> bool {
        Arc::ptr_eq(&self.cache, &other.cache)
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Registry of shared caches keyed by the first device of each group
pub struct CacheRegistry {
    adapter: Arc<dyn Adapter>,
    config: WireFsConfig,
    caches: Mutex<AHashMap<DeviceAddress, Arc<Mutex<MemoryCache>>>>,
    next_owner: AtomicU64,
}

impl CacheRegistry {
    pub fn new(adapter: Arc<dyn Adapter>, config: WireFsConfig) -> Arc<Self> {
        Arc::new(CacheRegistry {
            adapter,
            config,
            caches: Mutex::new(AHashMap::new()),
            next_owner: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &WireFsConfig {
        &self.config
    }

    pub fn new_owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of live caches
    pub fn cache_count(&self) -> usize {
        self.caches.lock().len()
    }

    fn build(&self, addresses: &[DeviceAddress]) -> Result<MemoryCache> {
        let devices = addresses
            .iter()
            .map(|&address| self.adapter.device(address))
            .collect::<std::result::Result<Vec<Box<dyn Device>>, _>>()?;
        MemoryCache::new(devices, self.config.clone())
    }

    /// Join the cache of the group led by `addresses[0]`, creating it when
    /// none exists.
    pub fn acquire(&self, addresses: &[DeviceAddress], owner: OwnerId) -> Result<CacheHandle> {
        self.acquire_inner(addresses, owner, false)
    }

    /// Like [`CacheRegistry::acquire`], but a cache built over a different
    /// device list is replaced by one over exactly `addresses`.
    pub fn acquire_exact(&self, addresses: &[DeviceAddress], owner: OwnerId) -> Result<CacheHandle> {
        self.acquire_inner(addresses, owner, true)
    }

    fn acquire_inner(&self, addresses: &[DeviceAddress], owner: OwnerId, exact: bool) -> Result<CacheHandle> {
        let key = *addresses.first().ok_or_else(|| {
            WireFsError::InvalidFilesystem("empty device list".to_string())
        })?;
        let mut caches = self.caches.lock();

        if let Some(existing) = caches.get(&key) {
            let mut cache = existing.lock();
            if !exact || cache.addresses() == addresses {
                cache.add_owner(owner);
                return Ok(CacheHandle {
                    key,
                    owner,
                    cache: Arc::clone(existing),
                });
            }
            warn!(
                "Replacing cache of {} ({} devices) with {} devices",
                key,
                cache.addresses().len(),
                addresses.len()
            );
        }

        let mut cache = self.build(addresses)?;
        cache.add_owner(owner);
        let cache = Arc::new(Mutex::new(cache));
        caches.insert(key, Arc::clone(&cache));
        debug!("Created page cache for {} ({} devices)", key, addresses.len());
        Ok(CacheHandle { key, owner, cache })
    }

    /// Give up `handle`; the cache is dropped once no owner is left
    pub fn release(&self, handle: &CacheHandle) {
        let mut caches = self.caches.lock();
        let empty = handle.cache.lock().remove_owner(handle.owner);
        if !empty {
            return;
        }
        let registered = caches
            .get(&handle.key)
            .map(|c| Arc::ptr_eq(c, &handle.cache))
            .unwrap_or(false);
        if registered {
            caches.remove(&handle.key);
            debug!("Released page cache for {}", handle.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBus, SimDevice};

    fn registry() -> Arc<CacheRegistry> {
        let bus = SimBus::new(vec![
            SimDevice::rewritable(DeviceAddress(1), 8, 32),
            SimDevice::rewritable(DeviceAddress(2), 8, 32),
        ]);
        CacheRegistry::new(Arc::new(bus), WireFsConfig::default())
    }

    #[test]
    fn test_owners_share_one_cache() {
        let registry = registry();
        let a = registry
            .acquire(&[DeviceAddress(1)], registry.new_owner())
            .unwrap();
        let b = registry
            .acquire(&[DeviceAddress(1)], registry.new_owner())
            .unwrap();
        assert!(a.same_cache(&b));
        assert_eq!(a.lock().owner_count(), 2);
        assert_eq!(registry.cache_count(), 1);

        registry.release(&a);
        assert_eq!(registry.cache_count(), 1);
        registry.release(&b);
        assert_eq!(registry.cache_count(), 0);
    }

    #[test]
    fn test_exact_replaces_different_device_list() {
        let registry = registry();
        let a = registry
            .acquire(&[DeviceAddress(1)], registry.new_owner())
            .unwrap();
        let b = registry
            .acquire_exact(&[DeviceAddress(1), DeviceAddress(2)], registry.new_owner())
            .unwrap();
        assert!(!a.same_cache(&b));
        assert_eq!(b.lock().total_pages(), 16);

        // The stale handle no longer owns the registered cache.
        registry.release(&a);
        assert_eq!(registry.cache_count(), 1);
        registry.release(&b);
        assert_eq!(registry.cache_count(), 0);
    }

    #[test]
    fn test_missing_device_fails() {
        let registry = registry();
        let err = registry
            .acquire(&[DeviceAddress(9)], registry.new_owner())
            .unwrap_err();
        assert!(matches!(err, WireFsError::Transport(_)));
        assert_eq!(registry.cache_count(), 0);
    }
}
