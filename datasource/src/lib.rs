//! Local, file-backed datasource for a labeled key/value configuration
//! service: documents with revision history, a per-domain revision counter,
//! a polling audit log and an optional in-memory read cache, handed out
//! through a `Broker`.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod counter;
pub mod error;
pub mod file;
pub mod history;
pub mod kv;
pub mod labels;
pub mod locks;
pub mod options;
pub mod sort;
pub mod track;
pub mod traits;

#[cfg(test)]
mod tests;

pub use auth::{AllowAll, Authorizer, Permission, RequestContext, Verb};
pub use broker::{BrokerFactory, BrokerRegistry, LocalBroker};
pub use cache::{CacheHandle, KvCache};
pub use config::{CacheConfig, DatasourceConfig};
pub use error::StorageError;
pub use options::FindOptions;
pub use traits::{Broker, HistoryDao, KvDao, RevisionDao, TrackDao};
