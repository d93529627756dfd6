use shared_types::KvDoc;

/// Most relevant first: documents with more labels (more specific scope)
/// lead, then the most recently updated. Id breaks remaining ties.
pub fn by_priority_and_revision(docs: &mut [KvDoc]) {
    docs.sort_by(|a, b| {
        b.labels
            .len()
            .cmp(&a.labels.len())
            .then_with(|| b.update_revision.cmp(&a.update_revision))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// `offset` past the end gives an empty page, `limit == 0` takes the rest.
pub fn page<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    if offset >= items.len() {
        return Vec::new();
    }
    let rest = items.into_iter().skip(offset);
    if limit == 0 {
        rest.collect()
    } else {
        rest.take(limit).collect()
    }
}
