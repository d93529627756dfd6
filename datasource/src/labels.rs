//! Label-set comparisons used for query filtering and for applying the
//! permitted label sets returned by the authorization collaborator.

use shared_types::{KvDoc, Labels};

/// Both empty, or identical key for key.
pub fn is_equivalent(x: &Labels, y: &Labels) -> bool {
    if x.is_empty() && y.is_empty() {
        return true;
    }
    x == y
}

/// Every pair of `y` is present in `x`. An empty `y` is contained in anything.
pub fn contains(x: &Labels, y: &Labels) -> bool {
    if x.len() < y.len() {
        return false;
    }
    y.iter().all(|(k, v)| x.get(k) == Some(v))
}

/// Permissive match: only keys present in both sets are compared. A permitted
/// key the document does not carry never causes a mismatch.
pub fn match_one(doc_labels: &Labels, permitted: &Labels) -> bool {
    permitted
        .iter()
        .all(|(k, v)| doc_labels.get(k).map_or(true, |doc_value| doc_value == v))
}

pub fn match_labels_list(doc: &KvDoc, permitted: &[Labels]) -> bool {
    permitted.iter().any(|labels| match_one(&doc.labels, labels))
}

/// Keep the documents matching at least one permitted label set.
pub fn filter_kvs(docs: Vec<KvDoc>, permitted: &[Labels]) -> Vec<KvDoc> {
    docs.into_iter()
        .filter(|doc| match_labels_list(doc, permitted))
        .collect()
}
