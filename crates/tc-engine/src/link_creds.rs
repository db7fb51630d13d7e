//! Dataset-level registry of credential keys used by linked samples.
//!
//! Keys are interned to small integer ids that the per-tensor
//! [`CredsEncoder`](tc_index::CredsEncoder) stores per sample. Id `0` always
//! means "no credential". Secrets are held in memory only; the persisted
//! registry records key names, the managed set, interned ids, and which keys
//! stored data actually references.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tc_store::{keys, ObjectCache};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// A populated secret: provider-specific settings such as access keys.
pub type Creds = BTreeMap<String, String>;

/// Credential key resolved from the process environment. Never missing.
pub const ENV_CREDS_KEY: &str = "ENV";

/// Kind of storage client a linked path needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    S3,
    Gcs,
    Http,
}

impl ProviderKind {
    /// Provider for a path, or `None` for local files.
    pub fn for_path(path: &str) -> Option<Self> {
        if path.starts_with("s3://") {
            Some(Self::S3)
        } else if path.starts_with("gcs://") || path.starts_with("gcp://") || path.starts_with("gs://") {
            Some(Self::Gcs)
        } else if path.starts_with("http://") || path.starts_with("https://") {
            Some(Self::Http)
        } else {
            None
        }
    }

    /// Object stores issue presigned URLs; plain HTTP paths are already public.
    pub fn is_object_store(&self) -> bool {
        matches!(self, Self::S3 | Self::Gcs)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::S3 => "s3",
            Self::Gcs => "gcs",
            Self::Http => "http",
        })
    }
}

/// An authenticated client for externally hosted data.
pub trait LinkedStorage: Send + Sync {
    /// Fetch the whole object at `path`.
    fn get_bytes(&self, path: &str) -> EngineResult<Vec<u8>>;

    /// A time-limited URL for direct access to `path`.
    fn presigned_url(&self, path: &str, full: bool) -> EngineResult<String>;
}

/// Builds storage clients from populated credentials.
pub trait ProviderFactory: Send + Sync {
    /// `creds_key` is `None` for public data and `Some("ENV")` when the
    /// client should read its settings from the environment.
    fn build(
        &self,
        kind: ProviderKind,
        creds_key: Option<&str>,
        creds: &Creds,
    ) -> EngineResult<Arc<dyn LinkedStorage>>;
}

/// Factory with no network clients. Only local paths can be resolved.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineFactory;

impl ProviderFactory for OfflineFactory {
    fn build(&self, kind: ProviderKind, _: Option<&str>, _: &Creds) -> EngineResult<Arc<dyn LinkedStorage>> {
        Err(EngineError::UnsupportedProvider(kind.to_string()))
    }
}

/// Persisted part of the registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Registry {
    /// Declared keys, in declaration order.
    creds_keys: Vec<String>,
    managed_creds_keys: BTreeSet<String>,
    /// Interned keys; the key at position `i` has id `i + 1`.
    interned: Vec<String>,
    used_creds_keys: BTreeSet<String>,
}

impl Registry {
    fn is_declared(&self, key: &str) -> bool {
        self.creds_keys.iter().any(|k| k == key)
    }
}

type ClientKey = (Option<String>, ProviderKind);

/// Credential registry shared by every linked tensor of a dataset.
pub struct LinkCreds {
    registry: RwLock<Registry>,
    creds: RwLock<HashMap<String, Creds>>,
    clients: RwLock<HashMap<ClientKey, Arc<dyn LinkedStorage>>>,
    factory: Arc<dyn ProviderFactory>,
}

impl fmt::Debug for LinkCreds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkCreds")
            .field("registry", &*self.registry.read().expect("lock poisoned"))
            .finish_non_exhaustive()
    }
}

/// Treat an empty key like no key.
fn normalize(key: Option<&str>) -> Option<&str> {
    key.filter(|k| !k.is_empty())
}

impl LinkCreds {
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self::with_registry(Registry::default(), factory)
    }

    /// Registry without network clients.
    pub fn offline() -> Self {
        Self::new(Arc::new(OfflineFactory))
    }

    fn with_registry(registry: Registry, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            registry: RwLock::new(registry),
            creds: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Declare a credential key. Managed keys are expected to be populated
    /// by the dataset owner.
    pub fn add_creds_key(&self, key: &str, managed: bool) -> EngineResult<()> {
        if key.is_empty() || key == ENV_CREDS_KEY {
            return Err(EngineError::Config(format!("{key:?} is not a valid creds key")));
        }
        let mut registry = self.registry.write().expect("lock poisoned");
        if registry.is_declared(key) {
            return Err(EngineError::DuplicateCredsKey(key.to_string()));
        }
        registry.creds_keys.push(key.to_string());
        if managed {
            registry.managed_creds_keys.insert(key.to_string());
        }
        debug!(creds_key = key, managed, "creds key added");
        Ok(())
    }

    /// Supply the secret for a declared key.
    pub fn populate_creds(&self, key: &str, creds: Creds) -> EngineResult<()> {
        if !self.registry.read().expect("lock poisoned").is_declared(key) {
            return Err(EngineError::UnknownCredsKey(key.to_string()));
        }
        self.creds
            .write()
            .expect("lock poisoned")
            .insert(key.to_string(), creds);
        self.clients
            .write()
            .expect("lock poisoned")
            .retain(|(k, _), _| k.as_deref() != Some(key));
        Ok(())
    }

    /// Declared keys, in declaration order.
    pub fn creds_keys(&self) -> Vec<String> {
        self.registry.read().expect("lock poisoned").creds_keys.clone()
    }

    /// Whether samples may reference `key`.
    pub fn contains(&self, key: Option<&str>) -> bool {
        match normalize(key) {
            None | Some(ENV_CREDS_KEY) => true,
            Some(k) => self.registry.read().expect("lock poisoned").is_declared(k),
        }
    }

    pub fn is_managed(&self, key: &str) -> bool {
        self.registry
            .read()
            .expect("lock poisoned")
            .managed_creds_keys
            .contains(key)
    }

    /// Stable id of `key`, interning it on first sight.
    pub fn get_encoding(&self, key: Option<&str>) -> EngineResult<u32> {
        let Some(key) = normalize(key) else {
            return Ok(0);
        };
        if !self.contains(Some(key)) {
            return Err(EngineError::UnknownCredsKey(key.to_string()));
        }
        let mut registry = self.registry.write().expect("lock poisoned");
        if let Some(pos) = registry.interned.iter().position(|k| k == key) {
            return Ok(pos as u32 + 1);
        }
        registry.interned.push(key.to_string());
        Ok(registry.interned.len() as u32)
    }

    /// Key interned as `id`.
    pub fn get_creds_key(&self, id: u32) -> EngineResult<Option<String>> {
        if id == 0 {
            return Ok(None);
        }
        self.registry
            .read()
            .expect("lock poisoned")
            .interned
            .get(id as usize - 1)
            .cloned()
            .map(Some)
            .ok_or(EngineError::UnknownCredsId(id))
    }

    /// Record that stored data references `key`. True on first use.
    pub fn add_to_used_creds(&self, key: Option<&str>) -> bool {
        match normalize(key) {
            None => false,
            Some(k) => self
                .registry
                .write()
                .expect("lock poisoned")
                .used_creds_keys
                .insert(k.to_string()),
        }
    }

    pub fn used_creds_keys(&self) -> BTreeSet<String> {
        self.registry.read().expect("lock poisoned").used_creds_keys.clone()
    }

    /// Declared keys without a populated secret.
    pub fn missing_keys(&self) -> BTreeSet<String> {
        let creds = self.creds.read().expect("lock poisoned");
        self.registry
            .read()
            .expect("lock poisoned")
            .creds_keys
            .iter()
            .filter(|k| !creds.contains_key(*k))
            .cloned()
            .collect()
    }

    /// Memoized client for `(key, kind)`.
    pub fn get_storage_provider(
        &self,
        key: Option<&str>,
        kind: ProviderKind,
    ) -> EngineResult<Arc<dyn LinkedStorage>> {
        let key = normalize(key);
        let memo = (key.map(str::to_string), kind);
        if let Some(client) = self.clients.read().expect("lock poisoned").get(&memo) {
            return Ok(Arc::clone(client));
        }

        let creds = match key {
            None | Some(ENV_CREDS_KEY) => Creds::new(),
            Some(k) => {
                if !self.contains(Some(k)) {
                    return Err(EngineError::UnknownCredsKey(k.to_string()));
                }
                self.creds
                    .read()
                    .expect("lock poisoned")
                    .get(k)
                    .cloned()
                    .ok_or_else(|| EngineError::MissingCreds(k.to_string()))?
            }
        };
        let client = self.factory.build(kind, key, &creds)?;
        debug!(creds_key = ?key, provider = %kind, "storage client built");
        self.clients
            .write()
            .expect("lock poisoned")
            .insert(memo, Arc::clone(&client));
        Ok(client)
    }

    /// Presigned URL for an object-store path.
    pub fn get_presigned_url(&self, path: &str, key: Option<&str>, full: bool) -> EngineResult<String> {
        let kind = ProviderKind::for_path(path)
            .filter(ProviderKind::is_object_store)
            .ok_or_else(|| EngineError::UnsupportedProvider(format!("presigning {path}")))?;
        self.get_storage_provider(key, kind)?.presigned_url(path, full)
    }

    /// Fetch a linked resource. Local paths are read from the filesystem.
    pub fn read_bytes(&self, path: &str, key: Option<&str>) -> EngineResult<Vec<u8>> {
        match ProviderKind::for_path(path) {
            Some(ProviderKind::Http) => self.get_storage_provider(None, ProviderKind::Http)?.get_bytes(path),
            Some(kind) => self.get_storage_provider(key, kind)?.get_bytes(path),
            None => {
                let local = path.strip_prefix("file://").unwrap_or(path);
                std::fs::read(local).map_err(|e| EngineError::LinkVerification {
                    path: path.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn to_json(&self) -> EngineResult<Vec<u8>> {
        let registry = self.registry.read().expect("lock poisoned");
        serde_json::to_vec(&*registry).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn from_json(bytes: &[u8], factory: Arc<dyn ProviderFactory>) -> EngineResult<Self> {
        let registry: Registry = serde_json::from_slice(bytes).map_err(|e| EngineError::Corrupt {
            key: keys::LINKED_CREDS_KEY.into(),
            reason: e.to_string(),
        })?;
        Ok(Self::with_registry(registry, factory))
    }

    /// Persist the registry (never the secrets).
    pub fn save(&self, cache: &ObjectCache) -> EngineResult<()> {
        cache.put_bytes(keys::LINKED_CREDS_KEY, self.to_json()?)?;
        Ok(())
    }

    /// Load the persisted registry, or start an empty one.
    pub fn load(cache: &ObjectCache, factory: Arc<dyn ProviderFactory>) -> EngineResult<Self> {
        match cache.get_bytes(keys::LINKED_CREDS_KEY)? {
            Some(bytes) => Self::from_json(&bytes, factory),
            None => Ok(Self::new(factory)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tc_store::MemoryProvider;

    struct Fake;

    impl LinkedStorage for Fake {
        fn get_bytes(&self, path: &str) -> EngineResult<Vec<u8>> {
            Ok(path.as_bytes().to_vec())
        }

        fn presigned_url(&self, path: &str, _: bool) -> EngineResult<String> {
            Ok(format!("{path}?signed"))
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl ProviderFactory for Counting {
        fn build(&self, _: ProviderKind, _: Option<&str>, _: &Creds) -> EngineResult<Arc<dyn LinkedStorage>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Fake))
        }
    }

    #[test]
    fn encodings_are_stable_and_reversible() {
        let creds = LinkCreds::offline();
        creds.add_creds_key("a", true).unwrap();
        creds.add_creds_key("b", false).unwrap();
        assert_eq!(creds.get_encoding(None).unwrap(), 0);
        assert_eq!(creds.get_encoding(Some("")).unwrap(), 0);
        let b = creds.get_encoding(Some("b")).unwrap();
        let a = creds.get_encoding(Some("a")).unwrap();
        assert_eq!(creds.get_encoding(Some("b")).unwrap(), b);
        assert_ne!(a, b);
        assert_eq!(creds.get_creds_key(a).unwrap().as_deref(), Some("a"));
        assert_eq!(creds.get_creds_key(0).unwrap(), None);
        assert!(matches!(creds.get_creds_key(99), Err(EngineError::UnknownCredsId(99))));
        assert!(matches!(
            creds.get_encoding(Some("nope")),
            Err(EngineError::UnknownCredsKey(_))
        ));
    }

    #[test]
    fn duplicate_keys_rejected() {
        let creds = LinkCreds::offline();
        creds.add_creds_key("a", false).unwrap();
        assert!(matches!(
            creds.add_creds_key("a", true),
            Err(EngineError::DuplicateCredsKey(_))
        ));
        assert!(creds.add_creds_key(ENV_CREDS_KEY, false).is_err());
    }

    #[test]
    fn missing_until_populated() {
        let factory = Arc::new(Counting::default());
        let creds = LinkCreds::new(factory.clone());
        creds.add_creds_key("k", true).unwrap();
        assert_eq!(creds.missing_keys(), BTreeSet::from(["k".to_string()]));
        assert!(matches!(
            creds.get_storage_provider(Some("k"), ProviderKind::S3),
            Err(EngineError::MissingCreds(_))
        ));

        creds.populate_creds("k", Creds::new()).unwrap();
        assert!(creds.missing_keys().is_empty());
        creds.get_storage_provider(Some("k"), ProviderKind::S3).unwrap();
        creds.get_storage_provider(Some("k"), ProviderKind::S3).unwrap();
        assert_eq!(factory.0.load(Ordering::SeqCst), 1);
        creds.get_storage_provider(Some("k"), ProviderKind::Gcs).unwrap();
        assert_eq!(factory.0.load(Ordering::SeqCst), 2);

        assert_eq!(
            creds.get_presigned_url("s3://bucket/v.mp4", Some("k"), true).unwrap(),
            "s3://bucket/v.mp4?signed"
        );
        assert!(matches!(
            creds.populate_creds("other", Creds::new()),
            Err(EngineError::UnknownCredsKey(_))
        ));
    }

    #[test]
    fn env_is_never_missing() {
        let creds = LinkCreds::new(Arc::new(Counting::default()));
        assert!(creds.contains(Some(ENV_CREDS_KEY)));
        assert!(creds.missing_keys().is_empty());
        creds.get_storage_provider(Some(ENV_CREDS_KEY), ProviderKind::S3).unwrap();
    }

    #[test]
    fn first_use_reported_once() {
        let creds = LinkCreds::offline();
        creds.add_creds_key("a", false).unwrap();
        assert!(creds.add_to_used_creds(Some("a")));
        assert!(!creds.add_to_used_creds(Some("a")));
        assert!(!creds.add_to_used_creds(None));
        assert_eq!(creds.used_creds_keys().len(), 1);
    }

    #[test]
    fn registry_persists_without_secrets() {
        let cache = ObjectCache::new(Arc::new(MemoryProvider::new()));
        let creds = LinkCreds::offline();
        creds.add_creds_key("a", true).unwrap();
        creds.populate_creds("a", Creds::from([("secret".into(), "xyz".into())])).unwrap();
        let id = creds.get_encoding(Some("a")).unwrap();
        creds.add_to_used_creds(Some("a"));
        creds.save(&cache).unwrap();

        let json = String::from_utf8(cache.get_bytes(keys::LINKED_CREDS_KEY).unwrap().unwrap()).unwrap();
        assert!(!json.contains("xyz"));

        let back = LinkCreds::load(&cache, Arc::new(OfflineFactory)).unwrap();
        assert_eq!(back.get_creds_key(id).unwrap().as_deref(), Some("a"));
        assert!(back.is_managed("a"));
        assert_eq!(back.missing_keys(), BTreeSet::from(["a".to_string()]));
        assert_eq!(back.used_creds_keys(), creds.used_creds_keys());
    }

    #[test]
    fn offline_factory_reads_local_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"abc").unwrap();
        let creds = LinkCreds::offline();
        let local = path.to_str().unwrap();
        assert_eq!(creds.read_bytes(local, None).unwrap(), b"abc");
        assert_eq!(creds.read_bytes(&format!("file://{local}"), None).unwrap(), b"abc");
        assert!(matches!(
            creds.read_bytes("https://example.com/x.png", None),
            Err(EngineError::UnsupportedProvider(_))
        ));
        assert!(matches!(
            creds.read_bytes("/definitely/missing.png", None),
            Err(EngineError::LinkVerification { .. })
        ));
    }

    #[test]
    fn path_schemes() {
        assert_eq!(ProviderKind::for_path("s3://b/k"), Some(ProviderKind::S3));
        assert_eq!(ProviderKind::for_path("gcp://b/k"), Some(ProviderKind::Gcs));
        assert_eq!(ProviderKind::for_path("https://h/k"), Some(ProviderKind::Http));
        assert_eq!(ProviderKind::for_path("/tmp/k"), None);
    }
}
