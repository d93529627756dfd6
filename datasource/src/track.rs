use anyhow::{ensure, Context, Result};
use shared_types::PollingDetail;
use tracing::{debug, error, instrument, warn};

use crate::error::StorageError;
use crate::file::{self, FileStore, UndoLog};
use crate::traits::TrackDao;

const DEFAULT_REVISION: &str = "default";

/// Polling audit records, one file per (revision, session):
/// `<root>/track/<domain>/<project>/<revision>/<session>.json`.
pub struct LocalTrackDao {
    files: FileStore,
}

impl LocalTrackDao {
    pub fn new(files: FileStore) -> Self {
        Self { files }
    }

    fn matches(filter: &PollingDetail, record: &PollingDetail) -> bool {
        let field = |want: &str, got: &str| want.is_empty() || want == got;
        field(&filter.session_id, &record.session_id)
            && field(&filter.ip, &record.ip)
            && field(&filter.user_agent, &record.user_agent)
            && field(&filter.url_path, &record.url_path)
            && field(&filter.revision, &record.revision)
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

impl TrackDao for LocalTrackDao {
    #[instrument(skip(self, detail), fields(session = %detail.session_id))]
    fn create_or_update(&self, detail: PollingDetail) -> Result<PollingDetail> {
        let revision = if detail.revision.is_empty() {
            DEFAULT_REVISION
        } else {
            detail.revision.as_str()
        };
        for (what, name) in [
            ("domain", detail.domain.as_str()),
            ("project", detail.project.as_str()),
            ("revision", revision),
            ("session id", detail.session_id.as_str()),
        ] {
            ensure!(is_plain_name(name), "invalid polling {what}: {name:?}");
        }

        let content = serde_json::to_vec(&detail).context("failed to encode polling detail")?;
        let path = self
            .files
            .track_path(&detail.domain, &detail.project, revision, &detail.session_id);
        if let Err(e) = self.files.write(&path, &content, &mut UndoLog::new()) {
            error!("failed to record polling detail: {e:#}");
            return Err(e);
        }
        debug!("recorded polling detail at {}", path.display());
        Ok(detail)
    }

    #[instrument(skip(self, filter), fields(domain = %filter.domain, project = %filter.project))]
    fn get_polling_detail(&self, filter: &PollingDetail) -> Result<Vec<PollingDetail>> {
        for (what, name) in [("domain", &filter.domain), ("project", &filter.project)] {
            ensure!(is_plain_name(name), "invalid polling {what}: {name:?}");
        }
        let dir = self.files.track_dir(&filter.domain, &filter.project);
        let entries = match self.files.read_files_recursive(&dir, None) {
            Ok(entries) => entries,
            Err(e) if file::is_io_not_found(&e) => {
                return Err(StorageError::RecordNotFound.into());
            }
            Err(e) => {
                error!("failed to read polling details: {e:#}");
                return Err(e);
            }
        };

        let mut records = Vec::new();
        for (path, content) in entries {
            let record: PollingDetail = match serde_json::from_slice(&content) {
                Ok(record) => record,
                Err(e) => {
                    warn!("decode polling detail error {}: {e}", path.display());
                    continue;
                }
            };
            if Self::matches(filter, &record) {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Err(StorageError::RecordNotFound.into());
        }
        Ok(records)
    }
}
