use thiserror::Error;

/// Sentinel outcomes surfaced to callers. I/O and decode failures travel as
/// plain `anyhow` errors; these are the ones callers are expected to match on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("can not find any key value: {0}")]
    KeyNotFound(String),

    #[error("key with labels should be only one, found {0}")]
    TooMany(usize),

    #[error("can not find any polling data")]
    RecordNotFound,

    #[error("kv already exists: {0}")]
    KeyAlreadyExists(String),

    #[error("revision does not exist: {0}")]
    RevisionNotFound(i64),

    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl StorageError {
    /// Returns the sentinel carried by `err`, if any.
    pub fn of(err: &anyhow::Error) -> Option<&Self> {
        err.downcast_ref::<Self>()
    }

    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(
            Self::of(err),
            Some(Self::KeyNotFound(_) | Self::RecordNotFound)
        )
    }
}
