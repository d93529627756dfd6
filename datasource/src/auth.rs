use anyhow::Result;
use shared_types::{KvDoc, Labels};
use std::fmt;
use tracing::debug;

use crate::error::StorageError;
use crate::labels;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Update,
    Delete,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an allowed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    Unrestricted,
    /// Allowed only for documents matching one of these label sets.
    Scoped(Vec<Labels>),
}

/// Caller identity as handed over by the transport layer. The core never
/// interprets it, it only passes it to the `Authorizer`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub account: Option<String>,
    pub roles: Vec<String>,
    pub auth_enabled: bool,
}

impl RequestContext {
    /// Context with authorization switched off.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_account(account: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            account: Some(account.into()),
            roles,
            auth_enabled: true,
        }
    }
}

/// The role/policy decision, owned by the caller. An `Err` means denied.
pub trait Authorizer: Send + Sync {
    fn check(&self, ctx: &RequestContext, verb: Verb, labels: Option<&Labels>)
        -> Result<Permission>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check(&self, _: &RequestContext, _: Verb, _: Option<&Labels>) -> Result<Permission> {
        Ok(Permission::Unrestricted)
    }
}

/// Check a single-document operation. Denials carry `StorageError::Forbidden`.
pub(crate) fn authorize(
    authorizer: &dyn Authorizer,
    ctx: &RequestContext,
    verb: Verb,
    labels: &Labels,
) -> Result<()> {
    if !ctx.auth_enabled {
        return Ok(());
    }
    authorizer
        .check(ctx, verb, Some(labels))
        .map(|_| ())
        .map_err(|e| e.context(StorageError::Forbidden(verb.to_string())))
}

/// Down-filter a listing to what the caller may see. A denied check hides
/// everything rather than failing the listing.
pub(crate) fn filter_list(
    authorizer: &dyn Authorizer,
    ctx: &RequestContext,
    docs: Vec<KvDoc>,
) -> Vec<KvDoc> {
    if !ctx.auth_enabled {
        return docs;
    }
    match authorizer.check(ctx, Verb::Get, None) {
        Err(e) => {
            debug!("listing not permitted: {e:#}");
            Vec::new()
        }
        Ok(Permission::Unrestricted) => docs,
        Ok(Permission::Scoped(permitted)) if permitted.is_empty() => docs,
        Ok(Permission::Scoped(permitted)) => labels::filter_kvs(docs, &permitted),
    }
}
