use anyhow::Result;
use shared_types::{KvDoc, KvResponse};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

use crate::auth::RequestContext;
use crate::config::MAX_HISTORY_NUM;
use crate::file::{self, FileStore, UndoLog, NEWEST_KV_FILE};
use crate::sort;
use crate::traits::{HistoryDao, KvDao};

/// Decoded revision snapshots of one document. Files that fail to decode
/// are logged and left out.
fn read_snapshots(files: &FileStore, domain: &str, project: &str, id: &str) -> Result<Vec<KvDoc>> {
    let kv_dir = files.kv_dir(domain, project, id);
    let mut snapshots = Vec::new();
    for (path, content) in files.read_files_recursive(&kv_dir, Some(NEWEST_KV_FILE))? {
        match serde_json::from_slice::<KvDoc>(&content) {
            Ok(doc) => snapshots.push(doc),
            Err(e) => warn!("skipping undecodable revision {}: {e}", path.display()),
        }
    }
    Ok(snapshots)
}

/// Delete the oldest snapshots of a document until at most `max` remain,
/// returning how many were deleted. `max == 0` keeps everything.
pub(crate) fn rotate(
    files: &FileStore,
    domain: &str,
    project: &str,
    id: &str,
    max: usize,
) -> Result<usize> {
    if max == 0 {
        return Ok(0);
    }
    let mut snapshots = match read_snapshots(files, domain, project, id) {
        Ok(snapshots) => snapshots,
        Err(e) if file::is_io_not_found(&e) => return Ok(0),
        Err(e) => return Err(e),
    };
    if snapshots.len() <= max {
        return Ok(0);
    }

    sort::by_priority_and_revision(&mut snapshots);
    let expired = snapshots.split_off(max);
    for doc in &expired {
        let path = files.history_path(domain, project, id, doc.update_revision);
        if let Err(e) = files.delete(&path, &mut UndoLog::new()) {
            error!("failed to delete history {}: {e:#}", path.display());
            return Err(e);
        }
    }
    debug!(
        "{domain}/{project}/{id} keeps {max} revisions, deleted {}",
        expired.len()
    );
    Ok(expired.len())
}

/// Revision snapshots next to each document's newest copy.
pub struct LocalHistoryDao {
    files: FileStore,
    kv: Arc<dyn KvDao>,
    max_history: usize,
}

impl LocalHistoryDao {
    pub fn new(files: FileStore, kv: Arc<dyn KvDao>) -> Self {
        Self {
            files,
            kv,
            max_history: MAX_HISTORY_NUM,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }
}

impl HistoryDao for LocalHistoryDao {
    #[instrument(skip(self, _ctx, doc), fields(kv = %doc))]
    fn add_history(&self, _ctx: &RequestContext, doc: &KvDoc) -> Result<()> {
        rotate(
            &self.files,
            &doc.domain,
            &doc.project,
            &doc.id,
            self.max_history,
        )?;
        Ok(())
    }

    /// Most recent revision first. `total` counts every snapshot found.
    #[instrument(skip(self, ctx))]
    fn get_history(
        &self,
        ctx: &RequestContext,
        domain: &str,
        project: &str,
        id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<KvResponse> {
        // existence and read permission come from the newest copy
        self.kv.get(ctx, domain, project, id)?;

        let mut snapshots = read_snapshots(&self.files, domain, project, id)?;
        sort::by_priority_and_revision(&mut snapshots);
        let total = snapshots.len();
        Ok(KvResponse {
            total,
            data: sort::page(snapshots, offset, limit),
        })
    }

    fn delay_deletion_time(
        &self,
        _ctx: &RequestContext,
        domain: &str,
        project: &str,
        ids: &[String],
    ) -> Result<()> {
        debug!(
            "history of {} kvs under {domain}/{project} is retained by count, not time",
            ids.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::error::StorageError;
    use crate::kv::LocalKvDao;
    use crate::locks::LockTable;
    use tempfile::TempDir;

    fn setup(max_history: usize) -> (Arc<LocalKvDao>, LocalHistoryDao, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let files = FileStore::new(temp_dir.path());
        let kv = Arc::new(
            LocalKvDao::new(files.clone(), Arc::new(LockTable::new()), Arc::new(AllowAll))
                .with_max_history(max_history),
        );
        let history = LocalHistoryDao::new(files, kv.clone()).with_max_history(max_history);
        (kv, history, temp_dir)
    }

    fn write_revisions(kv: &LocalKvDao, revisions: std::ops::RangeInclusive<i64>) -> KvDoc {
        let ctx = RequestContext::anonymous();
        let mut revisions = revisions;
        let first = revisions.next().unwrap();
        let mut doc = kv
            .create(&ctx, KvDoc::new("default", "app", "timeout", "0").with_revision(first))
            .unwrap();
        for revision in revisions {
            doc.value = revision.to_string();
            doc.update_revision = revision;
            doc = kv.update(&ctx, doc).unwrap();
        }
        doc
    }

    #[test]
    fn test_history_newest_first() {
        let (kv, history, _temp_dir) = setup(10);
        let doc = write_revisions(&kv, 1..=3);

        let resp = history
            .get_history(&RequestContext::anonymous(), "default", "app", &doc.id, 0, 0)
            .unwrap();

        assert_eq!(resp.total, 3);
        let revisions: Vec<i64> = resp.data.iter().map(|d| d.update_revision).collect();
        assert_eq!(revisions, vec![3, 2, 1]);
        assert_eq!(resp.data[0].value, "3");
    }

    #[test]
    fn test_history_is_bounded() {
        let (kv, history, temp_dir) = setup(3);
        let doc = write_revisions(&kv, 1..=5);

        let resp = history
            .get_history(&RequestContext::anonymous(), "default", "app", &doc.id, 0, 0)
            .unwrap();

        assert_eq!(resp.total, 3);
        let revisions: Vec<i64> = resp.data.iter().map(|d| d.update_revision).collect();
        assert_eq!(revisions, vec![5, 4, 3]);
        let kv_dir = temp_dir.path().join("default/app").join(&doc.id);
        assert!(!kv_dir.join("1.json").exists());
        assert!(kv_dir.join(NEWEST_KV_FILE).exists());
    }

    #[test]
    fn test_history_paging() {
        let (kv, history, _temp_dir) = setup(10);
        let doc = write_revisions(&kv, 1..=4);

        let resp = history
            .get_history(&RequestContext::anonymous(), "default", "app", &doc.id, 1, 2)
            .unwrap();

        assert_eq!(resp.total, 4);
        let revisions: Vec<i64> = resp.data.iter().map(|d| d.update_revision).collect();
        assert_eq!(revisions, vec![3, 2]);
    }

    #[test]
    fn test_add_history_rotates() {
        let (kv, history, temp_dir) = setup(0);
        let doc = write_revisions(&kv, 1..=4);

        let bounded = LocalHistoryDao::new(FileStore::new(temp_dir.path()), kv.clone())
            .with_max_history(2);
        bounded
            .add_history(&RequestContext::anonymous(), &doc)
            .unwrap();

        let resp = history
            .get_history(&RequestContext::anonymous(), "default", "app", &doc.id, 0, 0)
            .unwrap();
        assert_eq!(resp.total, 2);
    }

    #[test]
    fn test_history_of_missing_kv() {
        let (_kv, history, _temp_dir) = setup(10);
        let err = history
            .get_history(&RequestContext::anonymous(), "default", "app", "nope", 0, 0)
            .unwrap_err();
        assert!(StorageError::is_not_found(&err));
    }
}
