use crate::error::StoreResult;

/// Durable `key -> bytes` store.
///
/// Implementations must satisfy these invariants:
/// - `set` followed by `get` of the same key returns the written bytes.
/// - A single `set` is atomic: readers see the old value or the new one.
/// - All I/O errors are propagated, never silently ignored.
pub trait StorageProvider: Send + Sync {
    /// Read the value stored at `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write (create or overwrite) the value at `key`.
    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Delete `key`. Returns `true` if it existed.
    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// List all keys starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Check whether `key` exists.
    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Read several keys. Backends may override to batch round-trips.
    fn get_batch(&self, keys: &[&str]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }
}
