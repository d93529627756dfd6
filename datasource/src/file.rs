//! Directory-oriented byte I/O with a replayable undo log.
//!
//! Every mutating helper appends the prior state of the path it touches to a
//! caller-owned [`UndoLog`] and never rolls back on its own. A caller running
//! a multi-step mutation replays the log when a later step fails.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

pub const NEWEST_KV_FILE: &str = "newest_version.json";

const REVISION_FILE: &str = "revision";
pub(crate) const TRACK_DIR: &str = "track";
pub(crate) const TMP_DIR: &str = "tmp";

/// Prior state of one path. `prior == None` means the path did not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub path: PathBuf,
    pub prior: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct UndoLog {
    records: Vec<UndoRecord>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Into<PathBuf>, prior: Option<Vec<u8>>) {
        self.records.push(UndoRecord {
            path: path.into(),
            prior,
        });
    }

    pub fn records(&self) -> &[UndoRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Restore every recorded path in recording order. Best effort: failures
    /// are logged and the remaining records are still applied.
    pub fn replay(self) {
        for record in self.records {
            let result = match &record.prior {
                None => remove_if_present(&record.path),
                Some(content) => write_creating_parent(&record.path, content),
            };
            if let Err(e) = result {
                warn!(
                    "rollback of {} failed, continuing: {e:#}",
                    record.path.display()
                );
            }
        }
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
    }
}

fn write_creating_parent(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to make dir {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

/// True when `err` wraps an I/O not-found error.
pub fn is_io_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == ErrorKind::NotFound)
    })
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, domain: &str, project: &str) -> PathBuf {
        self.root.join(domain).join(project)
    }

    pub fn kv_dir(&self, domain: &str, project: &str, id: &str) -> PathBuf {
        self.project_dir(domain, project).join(id)
    }

    pub fn newest_path(&self, domain: &str, project: &str, id: &str) -> PathBuf {
        self.kv_dir(domain, project, id).join(NEWEST_KV_FILE)
    }

    pub fn history_path(&self, domain: &str, project: &str, id: &str, revision: i64) -> PathBuf {
        self.kv_dir(domain, project, id)
            .join(format!("{revision}.json"))
    }

    pub fn counter_path(&self, domain: &str) -> PathBuf {
        self.root.join(domain).join(REVISION_FILE)
    }

    pub fn tmp_project_dir(&self, domain: &str, project: &str) -> PathBuf {
        self.root.join(TMP_DIR).join(domain).join(project)
    }

    pub fn tmp_kv_dir(&self, domain: &str, project: &str, id: &str) -> PathBuf {
        self.tmp_project_dir(domain, project).join(id)
    }

    pub fn track_dir(&self, domain: &str, project: &str) -> PathBuf {
        self.root.join(TRACK_DIR).join(domain).join(project)
    }

    pub fn track_path(&self, domain: &str, project: &str, revision: &str, session: &str) -> PathBuf {
        self.track_dir(domain, project)
            .join(revision)
            .join(format!("{session}.json"))
    }

    /// Create `path` and any missing parents. Segments created before a
    /// failure are left in place.
    pub fn ensure_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("failed to make dir {}", path.display()))
    }

    pub fn write(&self, path: &Path, content: &[u8], undo: &mut UndoLog) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent)?;
        }

        let prior = self.read_opt(path)?;
        undo.push(path, prior);

        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Remove `path`. Deleting a path that does not exist succeeds.
    pub fn delete(&self, path: &Path, undo: &mut UndoLog) -> Result<()> {
        let Some(prior) = self.read_opt(path)? else {
            debug!("{} does not exist, nothing to delete", path.display());
            return Ok(());
        };
        undo.push(path, Some(prior));

        fs::remove_file(path).with_context(|| format!("failed to delete {}", path.display()))
    }

    /// Move every direct child of `src` into `dst`, one rename at a time.
    ///
    /// On failure the children already moved are renamed back. If one of
    /// those reverse renames fails too, the move stays partially applied and
    /// the failure is logged; the original error is returned either way.
    pub fn move_dir(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut names = Vec::new();
        for entry in fs::read_dir(src).with_context(|| format!("failed to read dir {}", src.display()))? {
            let entry = entry.with_context(|| format!("failed to read dir {}", src.display()))?;
            names.push(entry.file_name());
        }
        self.ensure_dir(dst)?;

        let mut moved: Vec<OsString> = Vec::with_capacity(names.len());
        for name in names {
            let from = src.join(&name);
            let to = dst.join(&name);
            if let Err(e) = fs::rename(&from, &to) {
                error!(
                    "failed to move {} to {}, moving back {} files: {e}",
                    from.display(),
                    to.display(),
                    moved.len()
                );
                for name in &moved {
                    if let Err(back) = fs::rename(dst.join(name), src.join(name)) {
                        warn!(
                            "failed to move {} back to {}, move left partially applied: {back}",
                            dst.join(name).display(),
                            src.display()
                        );
                    }
                }
                return Err(e).with_context(|| {
                    format!("failed to move {} to {}", from.display(), to.display())
                });
            }
            moved.push(name);
        }
        Ok(())
    }

    /// Delete every direct child file of `dir`, then `dir` itself.
    /// Subdirectories are skipped, so a dir holding one is never removed.
    /// A missing `dir` is already clean.
    pub fn clean(&self, dir: &Path) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read dir {}", dir.display()))
            }
        };

        let mut undo = UndoLog::new();
        if let Err(e) = self.clean_entries(dir, entries, &mut undo) {
            error!("failed to clean {}, rolling back: {e:#}", dir.display());
            undo.replay();
            return Err(e);
        }
        Ok(())
    }

    fn clean_entries(&self, dir: &Path, entries: fs::ReadDir, undo: &mut UndoLog) -> Result<()> {
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read dir {}", dir.display()))?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            self.delete(&entry.path(), undo)?;
        }
        fs::remove_dir(dir).with_context(|| format!("failed to remove dir {}", dir.display()))
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))
    }

    /// Like [`FileStore::read`], with a missing file reported as `None`.
    pub fn read_opt(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Direct child directories of `dir`, sorted by name.
    pub fn list_subdirs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("failed to read dir {}", dir.display()))? {
            let entry = entry.with_context(|| format!("failed to read dir {}", dir.display()))?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    pub fn count_subdirs(&self, dir: &Path) -> Result<usize> {
        Ok(self.list_subdirs(dir)?.len())
    }

    /// Read every file below `dir`, recursively, skipping files named
    /// `exclude`. Results are sorted by path.
    pub fn read_files_recursive(
        &self,
        dir: &Path,
        exclude: Option<&str>,
    ) -> Result<Vec<(PathBuf, Vec<u8>)>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in fs::read_dir(&current)
                .with_context(|| format!("failed to read dir {}", current.display()))?
            {
                let entry =
                    entry.with_context(|| format!("failed to read dir {}", current.display()))?;
                if entry.file_type()?.is_dir() {
                    pending.push(entry.path());
                } else if exclude.map_or(true, |name| entry.file_name() != name) {
                    files.push(entry.path());
                }
            }
        }
        files.sort();

        files
            .into_iter()
            .map(|path| {
                let content = self.read(&path)?;
                Ok((path, content))
            })
            .collect()
    }
}
