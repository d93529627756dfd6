use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::auth::{AllowAll, Authorizer};
use crate::cache::{CacheHandle, CacheRefresher, KvCache};
use crate::config::{CacheConfig, DatasourceConfig};
use crate::counter::RevisionCounter;
use crate::file::FileStore;
use crate::history::LocalHistoryDao;
use crate::kv::LocalKvDao;
use crate::locks::LockTable;
use crate::track::LocalTrackDao;
use crate::traits::{Broker, HistoryDao, KvDao, RevisionDao, TrackDao};

/// Builds a broker from the resolved configuration.
pub type BrokerFactory = fn(&DatasourceConfig, Arc<dyn Authorizer>) -> Result<Arc<dyn Broker>>;

/// Names the local backend is registered under. The two etcd-flavoured
/// names select the same file store.
pub const LOCAL_BACKENDS: [&str; 3] = [
    "local",
    "etcd_with_localstorage",
    "embedded_etcd_with_localstorage",
];

/// File-backed broker. All DAOs share one `FileStore` root and one
/// `LockTable`.
pub struct LocalBroker {
    kv: Arc<LocalKvDao>,
    history: Arc<LocalHistoryDao>,
    revision: Arc<RevisionCounter>,
    track: Arc<LocalTrackDao>,
    cache: Option<Arc<KvCache>>,
    cache_config: CacheConfig,
}

impl LocalBroker {
    pub fn new(config: &DatasourceConfig) -> Result<Self> {
        Self::with_authorizer(config, Arc::new(AllowAll))
    }

    pub fn with_authorizer(
        config: &DatasourceConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self> {
        let files = FileStore::new(&config.root);
        files.ensure_dir(files.root())?;
        let locks = Arc::new(LockTable::new());

        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(KvCache::new(config.cache.ttl())));

        let mut kv = LocalKvDao::new(files.clone(), Arc::clone(&locks), authorizer)
            .with_max_history(config.max_history);
        if let Some(cache) = &cache {
            kv = kv.with_cache(Arc::clone(cache));
        }
        let kv = Arc::new(kv);

        let history = Arc::new(
            LocalHistoryDao::new(files.clone(), kv.clone()).with_max_history(config.max_history),
        );
        let revision = Arc::new(RevisionCounter::new(files.clone(), locks));
        let track = Arc::new(LocalTrackDao::new(files));

        info!(
            "local datasource ready at {} (cache {})",
            config.root.display(),
            if cache.is_some() { "enabled" } else { "disabled" }
        );
        Ok(Self {
            kv,
            history,
            revision,
            track,
            cache,
            cache_config: config.cache.clone(),
        })
    }

    pub fn cache(&self) -> Option<&Arc<KvCache>> {
        self.cache.as_ref()
    }
}

impl Broker for LocalBroker {
    fn kv_dao(&self) -> Arc<dyn KvDao> {
        self.kv.clone()
    }

    fn history_dao(&self) -> Arc<dyn HistoryDao> {
        self.history.clone()
    }

    fn revision_dao(&self) -> Arc<dyn RevisionDao> {
        self.revision.clone()
    }

    fn track_dao(&self) -> Arc<dyn TrackDao> {
        self.track.clone()
    }

    fn start_cache_refresh(&self) -> Option<CacheHandle> {
        let cache = self.cache.as_ref()?;
        Some(CacheRefresher::new(Arc::clone(cache), &self.cache_config).spawn())
    }
}

fn open_local(config: &DatasourceConfig, authorizer: Arc<dyn Authorizer>) -> Result<Arc<dyn Broker>> {
    Ok(Arc::new(LocalBroker::with_authorizer(config, authorizer)?))
}

/// Backend name to factory. Built once at startup and consulted once per
/// `open`.
#[derive(Default)]
pub struct BrokerRegistry {
    factories: HashMap<String, BrokerFactory>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the local backend under each of its names.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for name in LOCAL_BACKENDS {
            registry.register(name, open_local);
        }
        registry
    }

    /// Register `factory` under `name`, replacing any earlier registration.
    pub fn register(&mut self, name: impl Into<String>, factory: BrokerFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn open(&self, config: &DatasourceConfig) -> Result<Arc<dyn Broker>> {
        self.open_with_authorizer(config, Arc::new(AllowAll))
    }

    pub fn open_with_authorizer(
        &self,
        config: &DatasourceConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Arc<dyn Broker>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            anyhow!(
                "unknown datasource {:?}, expected one of {:?}",
                config.kind,
                self.names()
            )
        })?;
        info!("opening datasource {}", config.kind);
        factory(config, authorizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RequestContext;
    use crate::options::FindOptions;
    use shared_types::KvDoc;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_names() {
        let registry = BrokerRegistry::with_builtin();
        assert_eq!(
            registry.names(),
            vec![
                "embedded_etcd_with_localstorage",
                "etcd_with_localstorage",
                "local"
            ]
        );
    }

    #[test]
    fn test_unknown_kind_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config = DatasourceConfig::local(temp_dir.path()).with_kind("mongo");

        let err = BrokerRegistry::with_builtin().open(&config).err().unwrap();
        assert!(err.to_string().contains("mongo"));
    }

    #[test]
    fn test_etcd_names_open_local_store() {
        let temp_dir = TempDir::new().unwrap();
        let config =
            DatasourceConfig::local(temp_dir.path()).with_kind("embedded_etcd_with_localstorage");
        let broker = BrokerRegistry::with_builtin().open(&config).unwrap();

        let ctx = RequestContext::anonymous();
        let revision = broker.revision_dao().advance("default").unwrap();
        let doc = broker
            .kv_dao()
            .create(&ctx, KvDoc::new("default", "app", "timeout", "30").with_revision(revision))
            .unwrap();

        let resp = broker
            .kv_dao()
            .list(&ctx, "default", "app", &FindOptions::new())
            .unwrap();
        assert_eq!(resp.data, vec![doc]);
        assert!(temp_dir.path().join("default/revision").exists());
    }

    #[test]
    fn test_cache_follows_config() {
        let temp_dir = TempDir::new().unwrap();
        let broker = LocalBroker::new(&DatasourceConfig::local(temp_dir.path())).unwrap();
        assert!(broker.cache().is_some());

        let config = DatasourceConfig::local(temp_dir.path()).with_cache(CacheConfig::disabled());
        let broker = LocalBroker::new(&config).unwrap();
        assert!(broker.cache().is_none());
        assert!(broker.start_cache_refresh().is_none());
    }

    #[tokio::test]
    async fn test_start_cache_refresh() {
        let temp_dir = TempDir::new().unwrap();
        let broker = BrokerRegistry::with_builtin()
            .open(&DatasourceConfig::local(temp_dir.path()))
            .unwrap();

        let handle = broker.start_cache_refresh().unwrap();
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }
}
