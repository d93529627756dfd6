#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Key/value tags attached to a document. A missing or `null` label set
/// deserializes to the empty map.
pub type Labels = BTreeMap<String, String>;

fn is_zero(n: &i64) -> bool {
    *n == 0
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Labels, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Labels>::deserialize(deserializer)?.unwrap_or_default())
}

/// A labeled, versioned configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvDoc {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label_format: String,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value_type: String,
    #[serde(rename = "check", default, skip_serializing_if = "String::is_empty")]
    pub checker: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub create_revision: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub update_revision: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub create_time: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub update_time: i64,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
}

impl KvDoc {
    /// Build a fresh document with a random id and both timestamps set to now.
    pub fn new(
        domain: impl Into<String>,
        project: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            domain: domain.into(),
            project: project.into(),
            key: key.into(),
            value: value.into(),
            create_time: now,
            update_time: now,
            ..Self::default()
        }
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Set both revisions, as the service layer does for a first write.
    pub fn with_revision(mut self, revision: i64) -> Self {
        self.create_revision = revision;
        self.update_revision = revision;
        self
    }

    /// Generate a path-like string representation
    pub fn to_path(&self) -> String {
        format!("{}/{}/{}", self.domain, self.project, self.id)
    }
}

impl fmt::Display for KvDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path())
    }
}

/// A page of documents plus the number of matches before paging
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvResponse {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub data: Vec<KvDoc>,
}

impl KvResponse {
    pub fn new(data: Vec<KvDoc>) -> Self {
        Self {
            total: data.len(),
            data,
        }
    }
}

/// One audited polling request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PollingDetail {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub polling_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url_path: String,
    #[serde(rename = "kv", default, skip_serializing_if = "Vec::is_empty")]
    pub response_body: Vec<KvDoc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_header: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub response_code: u16,
}
