//! Write-back object cache.
//!
//! The cache holds either raw bytes or typed objects for a storage key. A
//! typed object lives behind a [`Shared`] handle: whoever obtains the handle
//! mutates the one canonical instance, and `flush` serializes it back. Keys
//! of commit-scoped structures embed the commit id, so objects belonging to
//! different commits never alias.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::traits::StorageProvider;

/// Shared handle to a cached object.
pub type Shared<T> = Arc<RwLock<T>>;

/// An object that can live in the [`ObjectCache`].
pub trait CacheObject: Send + Sync + Sized + 'static {
    fn to_bytes(&self) -> StoreResult<Vec<u8>>;

    fn from_bytes(bytes: &[u8]) -> StoreResult<Self>;

    /// Lower values are flushed first. Payloads use 0 so that the indexes
    /// referencing them (default 1) are never persisted ahead of the data.
    fn flush_priority(&self) -> u8 {
        1
    }
}

trait Persist: Send + Sync {
    fn encode(&self) -> StoreResult<Vec<u8>>;
    fn priority(&self) -> u8;
}

impl<T: CacheObject> Persist for RwLock<T> {
    fn encode(&self) -> StoreResult<Vec<u8>> {
        self.read().expect("lock poisoned").to_bytes()
    }

    fn priority(&self) -> u8 {
        self.read().expect("lock poisoned").flush_priority()
    }
}

/// Deletions are applied after every write of the same flush.
const DELETE_PRIORITY: u8 = u8::MAX;

enum Entry {
    Bytes(Vec<u8>),
    Object {
        any: Arc<dyn Any + Send + Sync>,
        persist: Arc<dyn Persist>,
    },
    /// Deleted in memory, still present in the provider until flushed.
    Deleted,
}

impl Entry {
    fn object<T: CacheObject>(shared: &Shared<T>) -> Self {
        Entry::Object {
            any: shared.clone(),
            persist: shared.clone(),
        }
    }
}

struct Slot {
    entry: Entry,
    /// Generation of the last unflushed change; 0 when clean.
    dirty: u64,
}

enum Pending {
    Bytes(Vec<u8>),
    Object(Arc<dyn Persist>),
    Delete,
}

/// Write-back cache over a [`StorageProvider`].
///
/// Lock order: an object's own lock may be held while calling into the
/// cache, never the other way round. The slots lock is released before any
/// object is encoded.
pub struct ObjectCache {
    provider: Arc<dyn StorageProvider>,
    slots: RwLock<HashMap<String, Slot>>,
    generation: AtomicU64,
    read_only: AtomicBool,
}

impl ObjectCache {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            provider,
            slots: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            read_only: AtomicBool::new(false),
        }
    }

    /// A cache that refuses every write.
    pub fn read_only(provider: Arc<dyn StorageProvider>) -> Self {
        let cache = Self::new(provider);
        cache.set_read_only(true);
        cache
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Fail with [`StoreError::ReadOnly`] if writes are not allowed.
    pub fn check_writable(&self) -> StoreResult<()> {
        if self.is_read_only() {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn dirty_slot(&self, entry: Entry) -> Slot {
        Slot {
            entry,
            dirty: self.next_generation(),
        }
    }

    /// Typed object at `key`, loading and decoding it from the provider on a miss.
    pub fn get_object<T: CacheObject>(&self, key: &str) -> StoreResult<Option<Shared<T>>> {
        let mut slots = self.slots.write().expect("lock poisoned");
        if let Some(slot) = slots.get_mut(key) {
            let upgraded = match &slot.entry {
                Entry::Object { any, .. } => {
                    let shared = any
                        .clone()
                        .downcast::<RwLock<T>>()
                        .map_err(|_| StoreError::TypeMismatch(key.to_string()))?;
                    return Ok(Some(shared));
                }
                Entry::Deleted => return Ok(None),
                Entry::Bytes(data) => Arc::new(RwLock::new(T::from_bytes(data)?)),
            };
            slot.entry = Entry::object(&upgraded);
            return Ok(Some(upgraded));
        }

        let Some(data) = self.provider.get(key)? else {
            return Ok(None);
        };
        let shared = Arc::new(RwLock::new(T::from_bytes(&data)?));
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::object(&shared),
                dirty: 0,
            },
        );
        Ok(Some(shared))
    }

    /// Insert a new object as the canonical instance for `key`.
    pub fn put_object<T: CacheObject>(&self, key: &str, value: T) -> StoreResult<Shared<T>> {
        let shared = Arc::new(RwLock::new(value));
        self.register_object(key, &shared)?;
        Ok(shared)
    }

    /// Make an existing handle the canonical instance for `key` and mark it dirty.
    pub fn register_object<T: CacheObject>(&self, key: &str, shared: &Shared<T>) -> StoreResult<()> {
        self.check_writable()?;
        let slot = self.dirty_slot(Entry::object(shared));
        self.slots
            .write()
            .expect("lock poisoned")
            .insert(key.to_string(), slot);
        Ok(())
    }

    /// Record that the object at `key` was mutated in place.
    pub fn mark_dirty(&self, key: &str) -> StoreResult<()> {
        self.check_writable()?;
        let mut slots = self.slots.write().expect("lock poisoned");
        match slots.get_mut(key) {
            Some(slot) if !matches!(slot.entry, Entry::Deleted) => {
                slot.dirty = self.next_generation();
                Ok(())
            }
            _ => Err(StoreError::NotFound(key.to_string())),
        }
    }

    pub fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let persist = {
            let slots = self.slots.read().expect("lock poisoned");
            match slots.get(key).map(|slot| &slot.entry) {
                Some(Entry::Bytes(data)) => return Ok(Some(data.clone())),
                Some(Entry::Deleted) => return Ok(None),
                Some(Entry::Object { persist, .. }) => persist.clone(),
                None => return self.provider.get(key),
            }
        };
        persist.encode().map(Some)
    }

    pub fn put_bytes(&self, key: &str, data: Vec<u8>) -> StoreResult<()> {
        self.check_writable()?;
        let slot = self.dirty_slot(Entry::Bytes(data));
        self.slots
            .write()
            .expect("lock poisoned")
            .insert(key.to_string(), slot);
        Ok(())
    }

    /// Whether `key` is cached or present in the provider.
    pub fn contains(&self, key: &str) -> StoreResult<bool> {
        if let Some(slot) = self.slots.read().expect("lock poisoned").get(key) {
            return Ok(!matches!(slot.entry, Entry::Deleted));
        }
        self.provider.exists(key)
    }

    /// Remove `key`. The provider copy survives until the next flush, which
    /// deletes it after writing everything else.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_writable()?;
        let slot = self.dirty_slot(Entry::Deleted);
        self.slots
            .write()
            .expect("lock poisoned")
            .insert(key.to_string(), slot);
        Ok(())
    }

    /// Drop the in-memory entry for `key`, discarding unflushed changes.
    pub fn invalidate(&self, key: &str) {
        self.slots.write().expect("lock poisoned").remove(key);
    }

    /// Write every dirty entry to the provider, then apply pending deletes.
    /// Returns the number of keys written or deleted.
    pub fn flush(&self) -> StoreResult<usize> {
        let snapshot: Vec<(String, u64, Pending)> = {
            let slots = self.slots.read().expect("lock poisoned");
            slots
                .iter()
                .filter(|(_, slot)| slot.dirty != 0)
                .map(|(key, slot)| {
                    let pending = match &slot.entry {
                        Entry::Bytes(data) => Pending::Bytes(data.clone()),
                        Entry::Object { persist, .. } => Pending::Object(persist.clone()),
                        Entry::Deleted => Pending::Delete,
                    };
                    (key.clone(), slot.dirty, pending)
                })
                .collect()
        };
        if snapshot.is_empty() {
            return Ok(0);
        }
        self.check_writable()?;

        let mut ops: Vec<(u8, String, u64, Option<Vec<u8>>)> = Vec::with_capacity(snapshot.len());
        for (key, generation, pending) in snapshot {
            let (priority, data) = match pending {
                Pending::Bytes(data) => (1, Some(data)),
                Pending::Object(persist) => (persist.priority(), Some(persist.encode()?)),
                Pending::Delete => (DELETE_PRIORITY, None),
            };
            ops.push((priority, key, generation, data));
        }
        ops.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (_, key, generation, data) in &ops {
            match data {
                Some(data) => {
                    self.provider.set(key, data)?;
                    debug!(key = %key, bytes = data.len(), "flushed");
                }
                None => {
                    self.provider.delete(key)?;
                    debug!(key = %key, "deleted");
                }
            }
            self.settle(key, *generation);
        }
        info!(keys = ops.len(), "cache flushed");
        Ok(ops.len())
    }

    /// Mark `key` clean unless it changed again after generation `generation`
    /// was snapshotted.
    fn settle(&self, key: &str, generation: u64) {
        let mut slots = self.slots.write().expect("lock poisoned");
        let remove = match slots.get_mut(key) {
            Some(slot) if slot.dirty == generation => {
                if matches!(slot.entry, Entry::Deleted) {
                    true
                } else {
                    slot.dirty = 0;
                    false
                }
            }
            _ => false,
        };
        if remove {
            slots.remove(key);
        }
    }

    /// Flush, then forget everything held in memory.
    pub fn clear(&self) -> StoreResult<()> {
        if !self.is_read_only() {
            self.flush()?;
        }
        self.slots.write().expect("lock poisoned").clear();
        Ok(())
    }

    /// Number of in-memory entries.
    pub fn len(&self) -> usize {
        self.slots.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("entries", &self.len())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    #[derive(Debug, PartialEq)]
    struct Counter(u32);

    impl CacheObject for Counter {
        fn to_bytes(&self) -> StoreResult<Vec<u8>> {
            Ok(self.0.to_be_bytes().to_vec())
        }

        fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
            let arr: [u8; 4] = bytes.try_into().map_err(|_| StoreError::Corrupt {
                key: "counter".into(),
                reason: "expected 4 bytes".into(),
            })?;
            Ok(Counter(u32::from_be_bytes(arr)))
        }
    }

    struct Payload(Vec<u8>);

    impl CacheObject for Payload {
        fn to_bytes(&self) -> StoreResult<Vec<u8>> {
            Ok(self.0.clone())
        }

        fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
            Ok(Payload(bytes.to_vec()))
        }

        fn flush_priority(&self) -> u8 {
            0
        }
    }

    /// Records the order of `set` and `delete` calls; deletes are prefixed with `-`.
    #[derive(Default)]
    struct Recording {
        inner: MemoryProvider,
        order: RwLock<Vec<String>>,
    }

    impl StorageProvider for Recording {
        fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
            self.order.write().unwrap().push(key.to_string());
            self.inner.set(key, value)
        }
        fn delete(&self, key: &str) -> StoreResult<bool> {
            self.order.write().unwrap().push(format!("-{key}"));
            self.inner.delete(key)
        }
        fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
            self.inner.keys(prefix)
        }
    }

    /// Calls back into the cache while being encoded.
    struct Reentrant {
        cache: std::sync::Weak<ObjectCache>,
        key: &'static str,
    }

    impl CacheObject for Reentrant {
        fn to_bytes(&self) -> StoreResult<Vec<u8>> {
            if let Some(cache) = self.cache.upgrade() {
                cache.mark_dirty(self.key)?;
            }
            Ok(b"r".to_vec())
        }

        fn from_bytes(_: &[u8]) -> StoreResult<Self> {
            Err(StoreError::InvalidKey("not loadable".into()))
        }
    }

    fn cache() -> (Arc<MemoryProvider>, ObjectCache) {
        let provider = Arc::new(MemoryProvider::new());
        let cache = ObjectCache::new(provider.clone());
        (provider, cache)
    }

    #[test]
    fn put_is_not_durable_until_flush() {
        let (provider, cache) = cache();
        cache.put_object("c", Counter(7)).unwrap();
        assert!(provider.get("c").unwrap().is_none());
        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(provider.get("c").unwrap().unwrap(), 7u32.to_be_bytes());
        assert_eq!(cache.flush().unwrap(), 0);
    }

    #[test]
    fn handles_alias_the_canonical_instance() {
        let (provider, cache) = cache();
        let a = cache.put_object("c", Counter(1)).unwrap();
        let b = cache.get_object::<Counter>("c").unwrap().unwrap();
        b.write().unwrap().0 = 5;
        assert_eq!(a.read().unwrap().0, 5);
        cache.flush().unwrap();
        assert_eq!(provider.get("c").unwrap().unwrap(), 5u32.to_be_bytes());
    }

    #[test]
    fn miss_loads_from_provider() {
        let (provider, cache) = cache();
        provider.set("c", &9u32.to_be_bytes()).unwrap();
        let c = cache.get_object::<Counter>("c").unwrap().unwrap();
        assert_eq!(*c.read().unwrap(), Counter(9));
        assert!(cache.get_object::<Counter>("missing").unwrap().is_none());
    }

    #[test]
    fn mark_dirty_rewrites_mutated_object() {
        let (provider, cache) = cache();
        provider.set("c", &1u32.to_be_bytes()).unwrap();
        let c = cache.get_object::<Counter>("c").unwrap().unwrap();
        c.write().unwrap().0 = 2;
        assert_eq!(cache.flush().unwrap(), 0);
        cache.mark_dirty("c").unwrap();
        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(provider.get("c").unwrap().unwrap(), 2u32.to_be_bytes());
    }

    #[test]
    fn wrong_type_is_reported() {
        let (_, cache) = cache();
        cache.put_object("c", Counter(1)).unwrap();
        assert!(matches!(
            cache.get_object::<Payload>("c"),
            Err(StoreError::TypeMismatch(_))
        ));
    }

    #[test]
    fn bytes_upgrade_to_objects() {
        let (_, cache) = cache();
        cache.put_bytes("c", 3u32.to_be_bytes().to_vec()).unwrap();
        let c = cache.get_object::<Counter>("c").unwrap().unwrap();
        assert_eq!(c.read().unwrap().0, 3);
        assert_eq!(cache.get_bytes("c").unwrap().unwrap(), 3u32.to_be_bytes());
    }

    #[test]
    fn read_only_refuses_writes() {
        let provider = Arc::new(MemoryProvider::new());
        provider.set("c", &1u32.to_be_bytes()).unwrap();
        let cache = ObjectCache::read_only(provider);
        assert!(cache.put_object("d", Counter(1)).unwrap_err().is_read_only());
        assert!(cache.put_bytes("d", vec![]).unwrap_err().is_read_only());
        assert!(cache.mark_dirty("c").unwrap_err().is_read_only());
        // Reads still work.
        assert!(cache.get_object::<Counter>("c").unwrap().is_some());
    }

    #[test]
    fn payloads_flush_before_indexes() {
        let provider = Arc::new(Recording::default());
        let cache = ObjectCache::new(provider.clone());
        cache.put_object("a-index", Counter(1)).unwrap();
        cache.put_object("z-chunk", Payload(vec![1, 2])).unwrap();
        cache.flush().unwrap();
        assert_eq!(*provider.order.read().unwrap(), vec!["z-chunk", "a-index"]);
    }

    #[test]
    fn clear_flushes_then_forgets() {
        let (provider, cache) = cache();
        cache.put_object("c", Counter(4)).unwrap();
        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert!(provider.exists("c").unwrap());
        assert!(cache.contains("c").unwrap());
    }

    #[test]
    fn invalidate_discards_changes() {
        let (provider, cache) = cache();
        cache.put_object("c", Counter(4)).unwrap();
        cache.invalidate("c");
        cache.flush().unwrap();
        assert!(!provider.exists("c").unwrap());
    }

    #[test]
    fn delete_is_not_durable_until_flush() {
        let (provider, cache) = cache();
        cache.put_object("c", Counter(1)).unwrap();
        cache.flush().unwrap();

        cache.delete("c").unwrap();
        assert!(provider.exists("c").unwrap());
        assert!(!cache.contains("c").unwrap());
        assert!(cache.get_bytes("c").unwrap().is_none());
        assert!(cache.get_object::<Counter>("c").unwrap().is_none());
        assert!(matches!(cache.mark_dirty("c"), Err(StoreError::NotFound(_))));

        assert_eq!(cache.flush().unwrap(), 1);
        assert!(!provider.exists("c").unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn dropping_a_cache_with_a_pending_delete_keeps_the_key() {
        let (provider, cache) = cache();
        provider.set("c", &1u32.to_be_bytes()).unwrap();
        cache.delete("c").unwrap();
        drop(cache);
        let reopened = ObjectCache::new(provider);
        assert_eq!(*reopened.get_object::<Counter>("c").unwrap().unwrap().read().unwrap(), Counter(1));
    }

    #[test]
    fn put_after_delete_revives_the_key() {
        let (provider, cache) = cache();
        provider.set("c", &1u32.to_be_bytes()).unwrap();
        cache.delete("c").unwrap();
        cache.put_object("c", Counter(2)).unwrap();
        cache.flush().unwrap();
        assert_eq!(provider.get("c").unwrap().unwrap(), 2u32.to_be_bytes());
    }

    #[test]
    fn deletes_apply_after_writes() {
        let provider = Arc::new(Recording::default());
        provider.inner.set("a-chunk", b"x").unwrap();
        let cache = ObjectCache::new(provider.clone());
        cache.delete("a-chunk").unwrap();
        cache.put_object("z-index", Counter(1)).unwrap();
        cache.put_object("m-chunk", Payload(vec![3])).unwrap();
        cache.flush().unwrap();
        assert_eq!(
            *provider.order.read().unwrap(),
            vec!["m-chunk", "z-index", "-a-chunk"]
        );
    }

    #[test]
    fn flush_encodes_without_holding_the_slot_lock() {
        let provider = Arc::new(MemoryProvider::new());
        let cache = Arc::new(ObjectCache::new(provider.clone()));
        let object = Reentrant {
            cache: Arc::downgrade(&cache),
            key: "r",
        };
        cache.put_object("r", object).unwrap();
        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(provider.get("r").unwrap().unwrap(), b"r");
        // The change recorded while encoding is still pending.
        assert_eq!(cache.flush().unwrap(), 1);
    }
}
