use anyhow::{Context, Result};
use regex::Regex;
use shared_types::{KvDoc, Labels};

use crate::labels::{contains, is_equivalent};

/// Query criteria for listing documents in one domain/project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Literal key, `beginWith(prefix)` or `wildcard(pattern)`. Empty matches any key.
    pub key: String,
    pub labels: Labels,
    /// Require label sets to be equal instead of containing the query labels.
    /// Empty query labels then match only unlabeled documents.
    pub exact_labels: bool,
    pub label_format: String,
    pub status: String,
    /// Substring the value must contain.
    pub value: String,
    pub case_sensitive: bool,
    /// Offset of the first returned document, starting at 0.
    pub offset: usize,
    /// Page size, 0 returns everything from `offset` on.
    pub limit: usize,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_exact_labels(mut self) -> Self {
        self.exact_labels = true;
        self
    }

    pub fn with_label_format(mut self, label_format: impl Into<String>) -> Self {
        self.label_format = label_format.into();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Key and label format together identify at most one document.
    pub fn is_unique_find(&self) -> bool {
        !self.key.is_empty() && !self.label_format.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    Exact(String),
    BeginWith(String),
    Wildcard(String),
}

impl KeyPattern {
    pub fn parse(key: &str) -> Self {
        let inner = |prefix: &str| {
            key.strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(')'))
                .map(str::to_string)
        };
        if let Some(prefix) = inner("beginWith(") {
            KeyPattern::BeginWith(prefix)
        } else if let Some(pattern) = inner("wildcard(") {
            KeyPattern::Wildcard(pattern)
        } else {
            KeyPattern::Exact(key.to_string())
        }
    }

    /// Compile to one anchored regex. The user value is escaped first so a
    /// `.` only ever matches a literal dot.
    pub fn to_regex(&self, case_sensitive: bool) -> Result<Regex> {
        let body = match self {
            KeyPattern::Exact(key) => regex::escape(key),
            KeyPattern::BeginWith(prefix) => format!("{}.*", regex::escape(prefix)),
            KeyPattern::Wildcard(pattern) => regex::escape(pattern).replace(r"\*", ".*"),
        };
        let pattern = if case_sensitive {
            format!("^{body}$")
        } else {
            format!("(?i)^{body}$")
        };
        Regex::new(&pattern).with_context(|| format!("invalid key expression: {pattern}"))
    }
}

/// `FindOptions` with the key pattern compiled, shared by the file scan and
/// the cache so both apply the same predicate.
#[derive(Debug, Clone)]
pub struct DocFilter {
    opts: FindOptions,
    key: Option<Regex>,
}

impl DocFilter {
    pub fn new(opts: &FindOptions) -> Result<Self> {
        let key = if opts.key.is_empty() {
            None
        } else {
            Some(KeyPattern::parse(&opts.key).to_regex(opts.case_sensitive)?)
        };
        Ok(Self {
            opts: opts.clone(),
            key,
        })
    }

    pub fn options(&self) -> &FindOptions {
        &self.opts
    }

    pub fn matches(&self, doc: &KvDoc) -> bool {
        if !self.opts.status.is_empty() && doc.status != self.opts.status {
            return false;
        }
        if let Some(key) = &self.key {
            if !key.is_match(&doc.key) {
                return false;
            }
        }
        let labels_match = if self.opts.exact_labels {
            is_equivalent(&self.opts.labels, &doc.labels)
        } else {
            contains(&doc.labels, &self.opts.labels)
        };
        if !labels_match {
            return false;
        }
        if !self.opts.label_format.is_empty() && doc.label_format != self.opts.label_format {
            return false;
        }
        self.opts.value.is_empty() || doc.value.contains(&self.opts.value)
    }
}
