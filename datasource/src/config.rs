use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ROOT: &str = "/data/kvs";
pub const DEFAULT_KIND: &str = "local";
pub const MAX_HISTORY_NUM: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Lifetime of a cached document after it was last stored.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Tick of the refresh loop while no change feed is attached.
    pub refresh_backoff_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 10 * 60,
            sweep_interval_secs: 11 * 60,
            refresh_backoff_secs: 5,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn refresh_backoff(&self) -> Duration {
        Duration::from_secs(self.refresh_backoff_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasourceConfig {
    /// Registered backend name, resolved once by `BrokerRegistry::open`.
    pub kind: String,
    pub root: PathBuf,
    pub max_history: usize,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            kind: DEFAULT_KIND.to_string(),
            root: PathBuf::from(DEFAULT_ROOT),
            max_history: MAX_HISTORY_NUM,
            cache: CacheConfig::default(),
        }
    }
}

impl DatasourceConfig {
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(kind) = std::env::var("KIE_DATASOURCE") {
            config.kind = kind;
        }
        if let Ok(path) = std::env::var("KIE_STORAGE_PATH") {
            config.root = PathBuf::from(path);
        }
        if let Ok(max) = std::env::var("KIE_MAX_HISTORY") {
            config.max_history = max
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("KIE_MAX_HISTORY must be a number: {e}"))?;
        }
        if let Ok(enabled) = std::env::var("KIE_CACHE_ENABLED") {
            config.cache.enabled = enabled
                .parse::<bool>()
                .map_err(|e| anyhow::anyhow!("KIE_CACHE_ENABLED must be true or false: {e}"))?;
        }

        Ok(config)
    }
}
