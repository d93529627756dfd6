use anyhow::{bail, ensure, Context, Result};
use shared_types::{KvDoc, KvResponse};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{self, Authorizer, RequestContext, Verb};
use crate::cache::{CacheSearch, KvCache};
use crate::config::MAX_HISTORY_NUM;
use crate::error::StorageError;
use crate::file::{self, FileStore, UndoLog, NEWEST_KV_FILE, TMP_DIR, TRACK_DIR};
use crate::history;
use crate::locks::LockTable;
use crate::options::{DocFilter, FindOptions};
use crate::sort;
use crate::traits::KvDao;

/// Documents stored as one directory per id:
///
/// ```text
/// <root>/<domain>/<project>/<id>/newest_version.json
/// <root>/<domain>/<project>/<id>/<update_revision>.json
/// ```
///
/// Writes and deletes of one id are serialized through `LockTable`, keyed
/// by the id's directory. Reads take no lock.
pub struct LocalKvDao {
    files: FileStore,
    locks: Arc<LockTable>,
    cache: Option<Arc<KvCache>>,
    authorizer: Arc<dyn Authorizer>,
    max_history: usize,
}

/// Reject names that would escape their directory or land on one of the
/// store's own top-level entries.
fn check_segment(what: &str, name: &str) -> Result<()> {
    ensure!(!name.is_empty(), "{what} must not be empty");
    ensure!(
        name != "." && name != ".." && !name.contains(['/', '\\']),
        "invalid {what}: {name:?}"
    );
    Ok(())
}

fn check_scope(domain: &str, project: &str) -> Result<()> {
    check_segment("domain", domain)?;
    if domain == TMP_DIR || domain == TRACK_DIR {
        bail!("domain {domain:?} is reserved");
    }
    check_segment("project", project)
}

fn check_doc(doc: &KvDoc) -> Result<()> {
    check_scope(&doc.domain, &doc.project)?;
    check_segment("kv id", &doc.id)
}

impl LocalKvDao {
    pub fn new(files: FileStore, locks: Arc<LockTable>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            files,
            locks,
            cache: None,
            authorizer,
            max_history: MAX_HISTORY_NUM,
        }
    }

    pub fn with_cache(mut self, cache: Arc<KvCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// History snapshots kept per document. Zero keeps all of them.
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn cache(&self) -> Option<&Arc<KvCache>> {
        self.cache.as_ref()
    }

    fn lock_key(&self, domain: &str, project: &str, id: &str) -> String {
        self.files.kv_dir(domain, project, id).display().to_string()
    }

    fn read_doc(&self, domain: &str, project: &str, id: &str) -> Result<KvDoc> {
        let path = self.files.newest_path(domain, project, id);
        let Some(content) = self.files.read_opt(&path)? else {
            return Err(StorageError::KeyNotFound(format!("{domain}/{project}/{id}")).into());
        };
        serde_json::from_slice(&content)
            .with_context(|| format!("failed to decode kv {}", path.display()))
    }

    /// Write the snapshot for the doc's revision, then the newest copy.
    /// Either both land or neither does.
    fn persist(&self, doc: &KvDoc) -> Result<()> {
        let content = serde_json::to_vec(doc).context("failed to encode kv")?;
        let snapshot = self
            .files
            .history_path(&doc.domain, &doc.project, &doc.id, doc.update_revision);
        let newest = self.files.newest_path(&doc.domain, &doc.project, &doc.id);

        let mut undo = UndoLog::new();
        let written = self
            .files
            .write(&snapshot, &content, &mut undo)
            .and_then(|()| self.files.write(&newest, &content, &mut undo));
        if let Err(e) = written {
            error!("failed to write kv {doc}, rolling back: {e:#}");
            undo.replay();
            return Err(e);
        }
        Ok(())
    }

    fn after_write(&self, doc: &KvDoc) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.put(std::slice::from_ref(doc));
        }
        let removed = history::rotate(
            &self.files,
            &doc.domain,
            &doc.project,
            &doc.id,
            self.max_history,
        )?;
        if removed > 0 {
            debug!("dropped {removed} old revisions of {doc}");
        }
        Ok(())
    }

    /// Move the id's directory into the tmp area and decode the document
    /// from there. Any failure moves it back.
    fn stage_delete(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        id: &str,
    ) -> Result<KvDoc> {
        if self
            .files
            .read_opt(&self.files.newest_path(domain, project, id))?
            .is_none()
        {
            return Err(StorageError::KeyNotFound(format!("{domain}/{project}/{id}")).into());
        }

        let kv_dir = self.files.kv_dir(domain, project, id);
        let tmp_dir = self.files.tmp_kv_dir(domain, project, id);
        self.files.move_dir(&kv_dir, &tmp_dir)?;

        let staged = self
            .files
            .read(&tmp_dir.join(NEWEST_KV_FILE))
            .and_then(|content| {
                serde_json::from_slice::<KvDoc>(&content)
                    .with_context(|| format!("failed to decode kv {domain}/{project}/{id}"))
            })
            .and_then(|doc| {
                auth::authorize(self.authorizer.as_ref(), ctx, Verb::Delete, &doc.labels)?;
                Ok(doc)
            });
        if let Err(e) = &staged {
            error!("delete of {domain}/{project}/{id} aborted, restoring: {e:#}");
            self.unstage_delete(domain, project, id);
        }
        staged
    }

    fn unstage_delete(&self, domain: &str, project: &str, id: &str) {
        let kv_dir = self.files.kv_dir(domain, project, id);
        let tmp_dir = self.files.tmp_kv_dir(domain, project, id);
        if let Err(e) = self.files.move_dir(&tmp_dir, &kv_dir) {
            error!("rollback error when delete kv {domain}/{project}/{id}: {e:#}");
            return;
        }
        if let Err(e) = self.files.clean(&tmp_dir) {
            warn!("clean tmp dir error when delete kv: {e:#}");
        }
    }

    fn commit_delete(&self, domain: &str, project: &str, id: &str) {
        let dirs: [PathBuf; 2] = [
            self.files.tmp_kv_dir(domain, project, id),
            self.files.kv_dir(domain, project, id),
        ];
        for dir in dirs {
            if let Err(e) = self.files.clean(&dir) {
                warn!("clean dir error when delete kv: {e:#}");
            }
        }
    }

    fn forget_deleted(&self, docs: &[KvDoc]) {
        if let Some(cache) = &self.cache {
            cache.evict(docs);
        }
        for doc in docs {
            self.locks
                .forget(&self.lock_key(&doc.domain, &doc.project, &doc.id));
        }
    }

    /// Matching documents, unsorted and unpaged, without the authorization
    /// filter.
    fn list_data(&self, domain: &str, project: &str, opts: &FindOptions) -> Result<Vec<KvDoc>> {
        check_scope(domain, project)?;
        let filter = DocFilter::new(opts)?;

        let mut from_cache = CacheSearch::default();
        if let Some(cache) = &self.cache {
            from_cache = cache.search(domain, project, &filter);
            debug!(
                "cache search under {domain}/{project}: {} hits, {} missing",
                from_cache.docs.len(),
                from_cache.missing_ids.len()
            );
        }
        let mut docs = from_cache.docs;
        if opts.is_unique_find() && !docs.is_empty() {
            return Ok(docs);
        }

        let skip: HashSet<&str> = from_cache.cached_ids.iter().map(String::as_str).collect();
        let scanned = self.scan_project(domain, project, &filter, &skip)?;
        if let Some(cache) = &self.cache {
            cache.backfill(&scanned);
        }
        docs.extend(scanned);
        Ok(docs)
    }

    fn scan_project(
        &self,
        domain: &str,
        project: &str,
        filter: &DocFilter,
        skip: &HashSet<&str>,
    ) -> Result<Vec<KvDoc>> {
        let dir = self.files.project_dir(domain, project);
        let kv_dirs = match self.files.list_subdirs(&dir) {
            Ok(dirs) => dirs,
            Err(e) if file::is_io_not_found(&e) => return Ok(Vec::new()),
            Err(e) => {
                error!("failed to list {}: {e:#}", dir.display());
                return Err(e);
            }
        };

        let mut docs = Vec::new();
        for kv_dir in kv_dirs {
            let id = kv_dir.file_name().and_then(|name| name.to_str());
            if id.is_some_and(|id| skip.contains(id)) {
                continue;
            }

            let path = kv_dir.join(NEWEST_KV_FILE);
            let Some(content) = self.files.read_opt(&path)? else {
                warn!("{} has no newest version, skipping", kv_dir.display());
                continue;
            };
            let doc: KvDoc = match serde_json::from_slice(&content) {
                Ok(doc) => doc,
                Err(e) => {
                    error!("decode to kv list error {}: {e}", path.display());
                    continue;
                }
            };
            if !filter.matches(&doc) {
                continue;
            }
            docs.push(doc);
            if filter.options().is_unique_find() {
                break;
            }
        }
        Ok(docs)
    }

    fn to_response(mut docs: Vec<KvDoc>, opts: &FindOptions) -> KvResponse {
        sort::by_priority_and_revision(&mut docs);
        let total = docs.len();
        KvResponse {
            total,
            data: sort::page(docs, opts.offset, opts.limit),
        }
    }

    /// Exact-label, case-sensitive lookup used by `exists` and `get_by_key`.
    fn find_by_key(
        &self,
        domain: &str,
        project: &str,
        key: &str,
        opts: &FindOptions,
    ) -> Result<(FindOptions, Vec<KvDoc>)> {
        let query = FindOptions {
            key: key.to_string(),
            labels: opts.labels.clone(),
            label_format: opts.label_format.clone(),
            exact_labels: true,
            case_sensitive: true,
            ..FindOptions::default()
        };
        let docs = self.list_data(domain, project, &query)?;
        Ok((query, docs))
    }
}

impl KvDao for LocalKvDao {
    #[instrument(skip(self, ctx, doc), fields(kv = %doc))]
    fn create(&self, ctx: &RequestContext, doc: KvDoc) -> Result<KvDoc> {
        check_doc(&doc)?;
        auth::authorize(self.authorizer.as_ref(), ctx, Verb::Create, &doc.labels)?;

        let lock_key = self.lock_key(&doc.domain, &doc.project, &doc.id);
        self.locks.with_lock(&lock_key, || {
            self.persist(&doc)?;
            self.after_write(&doc)
        })?;
        info!("created kv {doc} at revision {}", doc.update_revision);
        Ok(doc)
    }

    #[instrument(skip(self, ctx, doc), fields(kv = %doc))]
    fn update(&self, ctx: &RequestContext, doc: KvDoc) -> Result<KvDoc> {
        check_doc(&doc)?;

        let lock_key = self.lock_key(&doc.domain, &doc.project, &doc.id);
        let updated = self.locks.with_lock(&lock_key, || -> Result<KvDoc> {
            let mut stored = self.read_doc(&doc.domain, &doc.project, &doc.id)?;
            auth::authorize(self.authorizer.as_ref(), ctx, Verb::Update, &stored.labels)?;
            ensure!(
                doc.update_revision > stored.update_revision,
                "update revision {} of {doc} is not newer than stored revision {}",
                doc.update_revision,
                stored.update_revision
            );

            stored.value = doc.value;
            if !doc.value_type.is_empty() {
                stored.value_type = doc.value_type;
            }
            if !doc.label_format.is_empty() {
                stored.label_format = doc.label_format;
            }
            stored.status = doc.status;
            stored.checker = doc.checker;
            stored.update_time = doc.update_time;
            stored.update_revision = doc.update_revision;

            self.persist(&stored)?;
            self.after_write(&stored)?;
            Ok(stored)
        })?;
        info!("updated kv {updated} to revision {}", updated.update_revision);
        Ok(updated)
    }

    #[instrument(skip(self, ctx))]
    fn get(&self, ctx: &RequestContext, domain: &str, project: &str, id: &str) -> Result<KvDoc> {
        check_scope(domain, project)?;
        check_segment("kv id", id)?;
        let doc = self.read_doc(domain, project, id)?;
        auth::authorize(self.authorizer.as_ref(), ctx, Verb::Get, &doc.labels)?;
        Ok(doc)
    }

    #[instrument(skip(self, ctx, opts))]
    fn list(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        opts: &FindOptions,
    ) -> Result<KvResponse> {
        let docs = self.list_data(domain, project, opts)?;
        let docs = auth::filter_list(self.authorizer.as_ref(), ctx, docs);
        Ok(Self::to_response(docs, opts))
    }

    #[instrument(skip(self, _ctx, opts))]
    fn exists(
        &self,
        _ctx: &RequestContext,
        domain: &str,
        project: &str,
        key: &str,
        opts: &FindOptions,
    ) -> Result<bool> {
        let (query, docs) = self.find_by_key(domain, project, key, opts)?;
        if query.is_unique_find() && docs.is_empty() {
            return Ok(false);
        }
        if docs.len() != 1 {
            return Err(StorageError::TooMany(docs.len()).into());
        }
        Ok(true)
    }

    #[instrument(skip(self, _ctx, opts))]
    fn get_by_key(
        &self,
        _ctx: &RequestContext,
        domain: &str,
        project: &str,
        key: &str,
        opts: &FindOptions,
    ) -> Result<Vec<KvDoc>> {
        let (query, docs) = self.find_by_key(domain, project, key, opts)?;
        if query.is_unique_find() && docs.is_empty() {
            return Err(StorageError::KeyNotFound(key.to_string()).into());
        }
        if docs.len() != 1 {
            return Err(StorageError::TooMany(docs.len()).into());
        }
        Ok(docs)
    }

    #[instrument(skip(self, ctx))]
    fn delete_one(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        id: &str,
    ) -> Result<KvDoc> {
        check_scope(domain, project)?;
        check_segment("kv id", id)?;

        let lock_key = self.lock_key(domain, project, id);
        let doc = self.locks.with_lock(&lock_key, || -> Result<KvDoc> {
            let doc = self.stage_delete(ctx, domain, project, id)?;
            self.commit_delete(domain, project, id);
            Ok(doc)
        })?;
        self.forget_deleted(std::slice::from_ref(&doc));
        info!("deleted kv {doc}");
        Ok(doc)
    }

    #[instrument(skip(self, ctx))]
    fn delete_many(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        ids: &[String],
    ) -> Result<(Vec<KvDoc>, usize)> {
        check_scope(domain, project)?;
        let mut seen = HashSet::new();
        let ids: Vec<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|id| seen.insert(*id))
            .collect();
        for id in &ids {
            check_segment("kv id", id)?;
        }
        if ids.is_empty() {
            return Err(StorageError::KeyNotFound("no kv id given".to_string()).into());
        }

        let lock_keys = ids
            .iter()
            .map(|id| self.lock_key(domain, project, id))
            .collect();
        let docs = self.locks.with_locks(lock_keys, || -> Result<Vec<KvDoc>> {
            let mut staged: Vec<(&str, KvDoc)> = Vec::with_capacity(ids.len());
            for &id in &ids {
                match self.stage_delete(ctx, domain, project, id) {
                    Ok(doc) => staged.push((id, doc)),
                    Err(e) => {
                        warn!("batch delete aborted, restoring {} kvs", staged.len());
                        for (id, _) in &staged {
                            self.unstage_delete(domain, project, id);
                        }
                        return Err(e);
                    }
                }
            }
            for (id, _) in &staged {
                self.commit_delete(domain, project, id);
            }
            Ok(staged.into_iter().map(|(_, doc)| doc).collect())
        })?;

        self.forget_deleted(&docs);
        info!("deleted {} kvs under {domain}/{project}", docs.len());
        let count = docs.len();
        Ok((docs, count))
    }

    #[instrument(skip(self))]
    fn total(&self, domain: &str, project: &str) -> Result<usize> {
        check_scope(domain, project)?;
        match self.files.count_subdirs(&self.files.project_dir(domain, project)) {
            Ok(count) => Ok(count),
            Err(e) if file::is_io_not_found(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }
}
