use anyhow::Result;
use shared_types::{KvDoc, KvResponse, PollingDetail};
use std::sync::Arc;

use crate::auth::RequestContext;
use crate::cache::CacheHandle;
use crate::options::FindOptions;

/// Document access. Create, update and list are usually for the admin console.
pub trait KvDao: Send + Sync {
    fn create(&self, ctx: &RequestContext, doc: KvDoc) -> Result<KvDoc>;

    /// Apply the mutable fields of `doc` onto the stored document with the
    /// same id. Fails with `StorageError::KeyNotFound` if there is none.
    fn update(&self, ctx: &RequestContext, doc: KvDoc) -> Result<KvDoc>;

    fn get(&self, ctx: &RequestContext, domain: &str, project: &str, id: &str) -> Result<KvDoc>;

    fn list(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        opts: &FindOptions,
    ) -> Result<KvResponse>;

    fn exists(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        key: &str,
        opts: &FindOptions,
    ) -> Result<bool>;

    fn get_by_key(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        key: &str,
        opts: &FindOptions,
    ) -> Result<Vec<KvDoc>>;

    /// Delete one document and return it as it was before deletion.
    fn delete_one(&self, ctx: &RequestContext, domain: &str, project: &str, id: &str)
        -> Result<KvDoc>;

    /// Delete several documents, all or none, returning them as they were
    /// before deletion together with their count.
    fn delete_many(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        ids: &[String],
    ) -> Result<(Vec<KvDoc>, usize)>;

    /// Number of documents in a project.
    fn total(&self, domain: &str, project: &str) -> Result<usize>;
}

pub trait HistoryDao: Send + Sync {
    /// Post-write hook. Trims the document's history to the retention bound.
    fn add_history(&self, ctx: &RequestContext, doc: &KvDoc) -> Result<()>;

    fn get_history(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<KvResponse>;

    fn delay_deletion_time(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        ids: &[String],
    ) -> Result<()>;
}

pub trait TrackDao: Send + Sync {
    /// Insert a record, or replace the one with the same revision and session.
    fn create_or_update(&self, detail: PollingDetail) -> Result<PollingDetail>;

    /// Records matching every non-empty filter field of `filter`.
    fn get_polling_detail(&self, filter: &PollingDetail) -> Result<Vec<PollingDetail>>;
}

/// Global revision number management.
pub trait RevisionDao: Send + Sync {
    fn current(&self, domain: &str) -> Result<i64>;
    fn advance(&self, domain: &str) -> Result<i64>;
}

/// Hands out the accessors of one storage backend.
pub trait Broker: Send + Sync {
    fn kv_dao(&self) -> Arc<dyn KvDao>;
    fn history_dao(&self) -> Arc<dyn HistoryDao>;
    fn revision_dao(&self) -> Arc<dyn RevisionDao>;
    fn track_dao(&self) -> Arc<dyn TrackDao>;

    /// Spawn the backend's background cache maintenance, if it has any.
    /// Must be called from within a tokio runtime.
    fn start_cache_refresh(&self) -> Option<CacheHandle> {
        None
    }
}
