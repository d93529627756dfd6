use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::file::{FileStore, UndoLog};
use crate::locks::LockTable;
use crate::traits::RevisionDao;

/// Per-domain revision sequence persisted as decimal text at
/// `<root>/<domain>/revision`.
///
/// `advance` holds the domain's lock from `LockTable`, so increments from
/// this process are never lost. Nothing serializes separate processes
/// sharing one root.
pub struct RevisionCounter {
    files: FileStore,
    locks: Arc<LockTable>,
}

impl RevisionCounter {
    pub fn new(files: FileStore, locks: Arc<LockTable>) -> Self {
        Self { files, locks }
    }

    fn read_current(&self, domain: &str) -> Result<i64> {
        let path = self.files.counter_path(domain);
        let Some(content) = self.files.read_opt(&path)? else {
            return Ok(0);
        };
        let text = String::from_utf8_lossy(&content);
        let text = text.trim();
        if text.is_empty() {
            return Ok(0);
        }
        text.parse::<i64>()
            .with_context(|| format!("malformed revision counter {}", path.display()))
    }
}

impl RevisionDao for RevisionCounter {
    #[instrument(skip(self))]
    fn current(&self, domain: &str) -> Result<i64> {
        self.read_current(domain)
    }

    #[instrument(skip(self))]
    fn advance(&self, domain: &str) -> Result<i64> {
        self.locks.with_lock(&format!("revision:{domain}"), || {
            let next = self.read_current(domain)? + 1;
            let path = self.files.counter_path(domain);
            self.files
                .write(&path, next.to_string().as_bytes(), &mut UndoLog::new())?;
            debug!("domain {domain} advanced to revision {next}");
            Ok(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn setup() -> (Arc<RevisionCounter>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let counter = RevisionCounter::new(
            FileStore::new(temp_dir.path()),
            Arc::new(LockTable::new()),
        );
        (Arc::new(counter), temp_dir)
    }

    #[test]
    fn test_fresh_domain_is_zero() {
        let (counter, _dir) = setup();
        assert_eq!(counter.current("default").unwrap(), 0);
    }

    #[test]
    fn test_empty_file_is_zero() {
        let (counter, dir) = setup();
        std::fs::create_dir_all(dir.path().join("default")).unwrap();
        std::fs::write(dir.path().join("default/revision"), b"").unwrap();

        assert_eq!(counter.current("default").unwrap(), 0);
        assert_eq!(counter.advance("default").unwrap(), 1);
    }

    #[test]
    fn test_malformed_counter_is_an_error() {
        let (counter, dir) = setup();
        std::fs::create_dir_all(dir.path().join("default")).unwrap();
        std::fs::write(dir.path().join("default/revision"), b"seven").unwrap();

        assert!(counter.current("default").is_err());
    }

    #[test]
    fn test_advance_is_strictly_increasing() {
        let (counter, _dir) = setup();
        let start = counter.current("default").unwrap();

        let mut last = start;
        for _ in 0..5 {
            let next = counter.advance("default").unwrap();
            assert!(next > last);
            last = next;
        }
        assert_eq!(last, start + 5);
        assert_eq!(counter.current("default").unwrap(), last);
    }

    #[test]
    fn test_domains_are_independent() {
        let (counter, _dir) = setup();
        counter.advance("a").unwrap();
        counter.advance("a").unwrap();

        assert_eq!(counter.current("a").unwrap(), 2);
        assert_eq!(counter.current("b").unwrap(), 0);
    }

    #[test]
    fn test_concurrent_advance_loses_nothing() {
        let (counter, _dir) = setup();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..25 {
                        counter.advance("default").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.current("default").unwrap(), 100);
    }
}
