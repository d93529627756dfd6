//! Read-through cache for the document scan.
//!
//! Two structures are kept side by side: an ID-set per `"/domain/project"`
//! (never expires, only changed by `put`/`backfill`/`evict`) and a TTL map
//! from `"/domain/project/id"` to document. They are updated one after the
//! other, so a reader can see an id in the ID-set whose body is gone or not
//! yet stored. `search` reports such ids as `missing_ids` for the caller to
//! backfill.
//!
//! Writers holding the id's lock call `put`/`evict`. Scans call `backfill`,
//! which never replaces a newer cached revision and never brings back a
//! document evicted within the last TTL.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared_types::KvDoc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::options::DocFilter;

#[derive(Debug)]
struct CachedDoc {
    doc: KvDoc,
    expires_at: Instant,
}

/// Revision a deleted document had, kept for one TTL.
#[derive(Debug)]
struct Tombstone {
    revision: i64,
    expires_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSearch {
    /// Cached documents matching the filter, as copies.
    pub docs: Vec<KvDoc>,
    pub used_cache: bool,
    /// Indexed ids whose body was found, matching or not.
    pub cached_ids: Vec<String>,
    /// Indexed ids whose body has expired or was never stored.
    pub missing_ids: Vec<String>,
}

#[derive(Debug)]
pub struct KvCache {
    ttl: Duration,
    ids: DashMap<String, HashSet<String>>,
    docs: DashMap<String, CachedDoc>,
    evicted: DashMap<String, Tombstone>,
}

impl KvCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ids: DashMap::new(),
            docs: DashMap::new(),
            evicted: DashMap::new(),
        }
    }

    pub fn cache_key(domain: &str, project: &str) -> String {
        format!("/{domain}/{project}")
    }

    fn doc_key(domain: &str, project: &str, id: &str) -> String {
        format!("/{domain}/{project}/{id}")
    }

    fn entry_for(&self, doc: &KvDoc) -> CachedDoc {
        CachedDoc {
            doc: doc.clone(),
            expires_at: Instant::now() + self.ttl,
        }
    }

    fn index(&self, doc: &KvDoc) {
        self.ids
            .entry(Self::cache_key(&doc.domain, &doc.project))
            .or_default()
            .insert(doc.id.clone());
    }

    /// Store documents just written. Replaces whatever is cached.
    pub fn put(&self, docs: &[KvDoc]) {
        for doc in docs {
            let key = Self::doc_key(&doc.domain, &doc.project, &doc.id);
            self.evicted.remove(&key);
            self.docs.insert(key, self.entry_for(doc));
            self.index(doc);
        }
    }

    /// Store documents read by a scan, returning how many were kept. A copy
    /// older than the cached one, or not newer than a recent deletion, is
    /// dropped.
    pub fn backfill(&self, docs: &[KvDoc]) -> usize {
        let mut kept = 0;
        for doc in docs {
            let key = Self::doc_key(&doc.domain, &doc.project, &doc.id);
            let stored = match self.docs.entry(key.clone()) {
                Entry::Occupied(mut cached) => {
                    if cached.get().doc.update_revision > doc.update_revision {
                        false
                    } else {
                        cached.insert(self.entry_for(doc));
                        true
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(self.entry_for(doc));
                    true
                }
            };
            if !stored {
                debug!("kept newer cached copy of {doc}");
                continue;
            }

            // checked after storing: `evict` leaves its tombstone before
            // removing the body, so one of the two sides sees the other
            let deleted = self
                .evicted
                .get(&key)
                .is_some_and(|tombstone| tombstone.revision >= doc.update_revision);
            if deleted {
                self.docs
                    .remove_if(&key, |_, cached| cached.doc.update_revision == doc.update_revision);
                debug!("{doc} was deleted, not caching it");
                continue;
            }
            self.index(doc);
            kept += 1;
        }
        kept
    }

    pub fn evict(&self, docs: &[KvDoc]) {
        for doc in docs {
            let key = Self::doc_key(&doc.domain, &doc.project, &doc.id);
            self.evicted.insert(
                key.clone(),
                Tombstone {
                    revision: doc.update_revision,
                    expires_at: Instant::now() + self.ttl,
                },
            );
            self.docs.remove(&key);
            let cache_key = Self::cache_key(&doc.domain, &doc.project);
            match self.ids.get_mut(&cache_key) {
                Some(mut ids) => {
                    ids.remove(&doc.id);
                }
                None => debug!("cache key {cache_key} not indexed"),
            }
        }
    }

    /// A copy of the cached document, if present and not expired.
    pub fn get(&self, domain: &str, project: &str, id: &str) -> Option<KvDoc> {
        let key = Self::doc_key(domain, project, id);
        let now = Instant::now();
        let hit = self
            .docs
            .get(&key)
            .and_then(|entry| (entry.expires_at > now).then(|| entry.doc.clone()));
        if hit.is_none() {
            self.docs.remove_if(&key, |_, entry| entry.expires_at <= now);
        }
        hit
    }

    pub fn search(&self, domain: &str, project: &str, filter: &DocFilter) -> CacheSearch {
        let cache_key = Self::cache_key(domain, project);
        debug!("using cache to search kv under {cache_key}");

        let indexed = self
            .ids
            .get(&cache_key)
            .map(|ids| ids.iter().cloned().collect::<Vec<_>>());
        let Some(mut indexed) = indexed else {
            self.ids.entry(cache_key).or_default();
            return CacheSearch {
                used_cache: true,
                ..CacheSearch::default()
            };
        };
        indexed.sort();

        let mut result = CacheSearch {
            used_cache: true,
            ..CacheSearch::default()
        };
        for id in indexed {
            match self.get(domain, project, &id) {
                Some(doc) => {
                    if filter.matches(&doc) {
                        result.docs.push(doc);
                    }
                    result.cached_ids.push(id);
                }
                None => result.missing_ids.push(id),
            }
        }
        result
    }

    /// Drop expired documents and deletion markers, returning how many
    /// documents were removed. ID-sets are left alone, their stale ids read
    /// as misses.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        self.evicted.retain(|_, tombstone| tombstone.expires_at > now);
        let before = self.docs.len();
        self.docs.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.docs.len())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Background loop that keeps the cache fresh. Today it only sweeps expired
/// documents; the refresh tick is where a change-feed subscription will
/// list and watch once a feed exists.
pub struct CacheRefresher {
    cache: Arc<KvCache>,
    backoff: Duration,
    sweep_interval: Duration,
}

impl CacheRefresher {
    pub fn new(cache: Arc<KvCache>, config: &CacheConfig) -> Self {
        Self {
            cache,
            backoff: config.refresh_backoff(),
            sweep_interval: config.sweep_interval(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("start to list and watch");

        let mut refresh = interval(self.backoff);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("cache refresh lost its shutdown sender, stopping");
                        break;
                    }
                }
                _ = refresh.tick() => {}
                _ = sweep.tick() => {
                    let removed = self.cache.sweep();
                    if removed > 0 {
                        debug!("swept {removed} expired kv docs from cache");
                    }
                }
            }
        }

        info!("stop to list and watch");
    }

    pub fn spawn(self) -> CacheHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(self.run(receiver));
        CacheHandle { shutdown, task }
    }
}

/// Owner of a spawned refresher.
pub struct CacheHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CacheHandle {
    /// Signal the refresher and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("cache refresh task ended abnormally: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
