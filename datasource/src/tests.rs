#[cfg(test)]
mod tests {
    use crate::auth::{Authorizer, Permission, RequestContext, Verb};
    use crate::broker::LocalBroker;
    use crate::config::{CacheConfig, DatasourceConfig};
    use crate::error::StorageError;
    use crate::file::NEWEST_KV_FILE;
    use crate::options::FindOptions;
    use crate::traits::Broker;
    use anyhow::{bail, Result};
    use shared_types::{KvDoc, Labels};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup_test_broker(config: impl FnOnce(DatasourceConfig) -> DatasourceConfig) -> (LocalBroker, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let broker = LocalBroker::new(&config(DatasourceConfig::local(temp_dir.path()))).unwrap();
        (broker, temp_dir)
    }

    fn ctx() -> RequestContext {
        RequestContext::anonymous()
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Create a document at the domain's next revision.
    fn create_test_doc(broker: &LocalBroker, key: &str, pairs: &[(&str, &str)]) -> KvDoc {
        let revision = broker.revision_dao().advance("default").unwrap();
        let doc = KvDoc::new("default", "app", key, format!("{key}-value"))
            .with_labels(pairs.iter().copied())
            .with_revision(revision);
        broker.kv_dao().create(&ctx(), doc).unwrap()
    }

    #[test]
    fn test_write_then_read_back() {
        let (broker, _temp) = setup_test_broker(|c| c);
        let created = create_test_doc(&broker, "timeout", &[("env", "prod"), ("app", "web")]);

        let loaded = broker
            .kv_dao()
            .get(&ctx(), "default", "app", &created.id)
            .unwrap();

        assert_eq!(loaded, created);
        assert_eq!(loaded.update_revision, 1);
    }

    #[test]
    fn test_writes_raise_revision() {
        let (broker, _temp) = setup_test_broker(|c| c);
        let kv = broker.kv_dao();
        let revisions = broker.revision_dao();
        let mut doc = create_test_doc(&broker, "timeout", &[]);

        let mut seen = vec![doc.update_revision];
        for value in ["31", "32", "33"] {
            doc.value = value.to_string();
            doc.update_revision = revisions.advance("default").unwrap();
            doc = kv.update(&ctx(), doc).unwrap();
            seen.push(doc.update_revision);
        }

        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        let head = kv.get(&ctx(), "default", "app", &doc.id).unwrap();
        assert_eq!(head.value, "33");
        assert_eq!(revisions.current("default").unwrap(), 4);
    }

    #[test]
    fn test_retention_keeps_most_recent() {
        let max_history = 4;
        let (broker, temp) = setup_test_broker(|c| c.with_max_history(max_history));
        let kv = broker.kv_dao();
        let mut doc = create_test_doc(&broker, "timeout", &[]);

        // max_history + 3 writes in total
        for _ in 0..max_history + 2 {
            doc.update_revision = broker.revision_dao().advance("default").unwrap();
            doc = kv.update(&ctx(), doc).unwrap();
        }

        let history = broker
            .history_dao()
            .get_history(&ctx(), "default", "app", &doc.id, 0, 0)
            .unwrap();
        let revisions: Vec<i64> = history.data.iter().map(|d| d.update_revision).collect();
        assert_eq!(revisions, vec![7, 6, 5, 4]);

        let kv_dir = temp.path().join("default/app").join(&doc.id);
        let snapshots = std::fs::read_dir(&kv_dir)
            .unwrap()
            .filter(|entry| entry.as_ref().unwrap().file_name() != NEWEST_KV_FILE)
            .count();
        assert_eq!(snapshots, max_history);
    }

    #[test]
    fn test_batch_delete_is_all_or_nothing() {
        let (broker, temp) = setup_test_broker(|c| c.with_cache(CacheConfig::disabled()));
        let kv = broker.kv_dao();
        let good = create_test_doc(&broker, "timeout", &[]);

        // a document whose newest copy no longer decodes
        let broken_dir = temp.path().join("default/app/broken");
        std::fs::create_dir_all(&broken_dir).unwrap();
        std::fs::write(broken_dir.join(NEWEST_KV_FILE), b"{not json").unwrap();
        std::fs::write(broken_dir.join("1.json"), b"{not json").unwrap();

        let ids = vec![good.id.clone(), "broken".to_string()];
        assert!(kv.delete_many(&ctx(), "default", "app", &ids).is_err());

        // both documents are back where they were
        assert_eq!(kv.get(&ctx(), "default", "app", &good.id).unwrap(), good);
        assert_eq!(
            std::fs::read(broken_dir.join(NEWEST_KV_FILE)).unwrap(),
            b"{not json"
        );
        assert!(broken_dir.join("1.json").exists());
        assert_eq!(kv.total("default", "app").unwrap(), 2);

        let (deleted, count) = kv
            .delete_many(&ctx(), "default", "app", &[good.id.clone()])
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(deleted, vec![good]);
        assert_eq!(kv.total("default", "app").unwrap(), 1);
    }

    #[test]
    fn test_delete_of_undecodable_doc_restores_it() {
        let (broker, temp) = setup_test_broker(|c| c);
        let broken_dir = temp.path().join("default/app/broken");
        std::fs::create_dir_all(&broken_dir).unwrap();
        std::fs::write(broken_dir.join(NEWEST_KV_FILE), b"garbage").unwrap();

        let result = broker.kv_dao().delete_one(&ctx(), "default", "app", "broken");

        assert!(result.is_err());
        assert_eq!(
            std::fs::read(broken_dir.join(NEWEST_KV_FILE)).unwrap(),
            b"garbage"
        );
        assert!(!temp.path().join("tmp/default/app/broken").exists());
    }

    #[test]
    fn test_pagination() {
        let (broker, _temp) = setup_test_broker(|c| c);
        for i in 0..10 {
            create_test_doc(&broker, &format!("key-{i}"), &[]);
        }
        let kv = broker.kv_dao();

        let all = kv
            .list(&ctx(), "default", "app", &FindOptions::new())
            .unwrap();
        assert_eq!(all.total, 10);

        let page = kv
            .list(
                &ctx(),
                "default",
                "app",
                &FindOptions::new().with_offset(5).with_limit(3),
            )
            .unwrap();
        assert_eq!(page.total, 10);
        assert_eq!(page.data, all.data[5..8].to_vec());

        let past_end = kv
            .list(&ctx(), "default", "app", &FindOptions::new().with_offset(20))
            .unwrap();
        assert_eq!(past_end.total, 10);
        assert!(past_end.data.is_empty());
    }

    #[test]
    fn test_ordering_prefers_specific_then_recent() {
        let (broker, _temp) = setup_test_broker(|c| c);
        let generic = create_test_doc(&broker, "timeout", &[("app", "web")]);
        let specific = create_test_doc(&broker, "timeout", &[("app", "web"), ("env", "prod")]);
        let recent = create_test_doc(&broker, "retries", &[("app", "web")]);

        let resp = broker
            .kv_dao()
            .list(&ctx(), "default", "app", &FindOptions::new())
            .unwrap();

        assert_eq!(resp.data, vec![specific, recent, generic]);
    }

    #[test]
    fn test_key_patterns() {
        let (broker, _temp) = setup_test_broker(|c| c);
        for key in ["foo.bar", "foo.baz", "foobar", "other"] {
            create_test_doc(&broker, key, &[]);
        }
        let keys = |pattern: &str| {
            let mut keys: Vec<String> = broker
                .kv_dao()
                .list(&ctx(), "default", "app", &FindOptions::new().with_key(pattern))
                .unwrap()
                .data
                .into_iter()
                .map(|doc| doc.key)
                .collect();
            keys.sort();
            keys
        };

        assert_eq!(keys("wildcard(foo.*)"), vec!["foo.bar", "foo.baz"]);
        assert_eq!(keys("beginWith(foo)"), vec!["foo.bar", "foo.baz", "foobar"]);
        assert_eq!(keys("FOOBAR"), vec!["foobar"]);
        assert!(keys("foo").is_empty());
    }

    #[test]
    fn test_label_filters() {
        let (broker, _temp) = setup_test_broker(|c| c);
        let web = create_test_doc(&broker, "timeout", &[("app", "web")]);
        let web_prod = create_test_doc(&broker, "timeout", &[("app", "web"), ("env", "prod")]);
        create_test_doc(&broker, "timeout", &[("app", "api")]);
        let kv = broker.kv_dao();

        let contains = kv
            .list(
                &ctx(),
                "default",
                "app",
                &FindOptions::new().with_labels(labels(&[("app", "web")])),
            )
            .unwrap();
        assert_eq!(contains.data, vec![web_prod, web.clone()]);

        let exact = kv
            .list(
                &ctx(),
                "default",
                "app",
                &FindOptions::new()
                    .with_labels(labels(&[("app", "web")]))
                    .with_exact_labels(),
            )
            .unwrap();
        assert_eq!(exact.data, vec![web]);
    }

    #[test]
    fn test_cache_serves_list_and_tracks_ids() {
        let (broker, temp) = setup_test_broker(|c| c);
        let doc = create_test_doc(&broker, "timeout", &[]);
        let cache = broker.cache().unwrap();

        let filter = crate::options::DocFilter::new(&FindOptions::new()).unwrap();
        let search = cache.search("default", "app", &filter);
        assert_eq!(search.cached_ids, vec![doc.id.clone()]);

        // the file is gone but the cached copy still answers
        std::fs::remove_dir_all(temp.path().join("default/app").join(&doc.id)).unwrap();
        let resp = broker
            .kv_dao()
            .list(&ctx(), "default", "app", &FindOptions::new())
            .unwrap();
        assert_eq!(resp.data, vec![doc]);
    }

    /// Denies every write and scopes reads to `env=test`.
    struct TestOnly;

    impl Authorizer for TestOnly {
        fn check(&self, _: &RequestContext, verb: Verb, labels: Option<&Labels>) -> Result<Permission> {
            match (verb, labels) {
                (Verb::Get, None) => Ok(Permission::Scoped(vec![
                    [("env".to_string(), "test".to_string())].into_iter().collect(),
                ])),
                (Verb::Get, Some(labels)) if labels.get("env").map(String::as_str) == Some("test") => {
                    Ok(Permission::Unrestricted)
                }
                _ => bail!("{verb} not allowed"),
            }
        }
    }

    #[test]
    fn test_authorization() {
        let temp_dir = TempDir::new().unwrap();
        let config = DatasourceConfig::local(temp_dir.path());
        let open = LocalBroker::new(&config).unwrap();
        let guarded = LocalBroker::with_authorizer(&config, Arc::new(TestOnly)).unwrap();
        let user = RequestContext::for_account("alice", vec!["developer".to_string()]);

        let in_test = create_test_doc(&open, "timeout", &[("env", "test")]);
        let in_prod = create_test_doc(&open, "timeout", &[("env", "prod")]);
        let kv = guarded.kv_dao();

        let listed = kv
            .list(&user, "default", "app", &FindOptions::new())
            .unwrap();
        assert_eq!(listed.data, vec![in_test.clone()]);

        assert!(kv.get(&user, "default", "app", &in_test.id).is_ok());
        let err = kv.get(&user, "default", "app", &in_prod.id).unwrap_err();
        assert_eq!(
            StorageError::of(&err),
            Some(&StorageError::Forbidden("get".to_string()))
        );

        // denied delete leaves the document in place
        let err = kv
            .delete_one(&user, "default", "app", &in_test.id)
            .unwrap_err();
        assert!(matches!(StorageError::of(&err), Some(StorageError::Forbidden(_))));
        assert!(kv.get(&user, "default", "app", &in_test.id).is_ok());

        // auth switched off skips the collaborator
        assert!(kv.get(&ctx(), "default", "app", &in_prod.id).is_ok());
    }
}
