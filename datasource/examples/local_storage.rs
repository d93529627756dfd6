use anyhow::Result;
use datasource::{BrokerRegistry, DatasourceConfig, FindOptions, RequestContext};
use shared_types::KvDoc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // KIE_STORAGE_PATH and friends override the defaults
    let mut config = DatasourceConfig::from_env()?;
    if std::env::var_os("KIE_STORAGE_PATH").is_none() {
        config.root = "./data".into();
    }
    println!("Using {} storage at {}", config.kind, config.root.display());

    let broker = BrokerRegistry::with_builtin().open(&config)?;
    let refresher = broker.start_cache_refresh();
    let kv = broker.kv_dao();
    let revisions = broker.revision_dao();
    let ctx = RequestContext::anonymous();

    // Create a document
    let mut doc = KvDoc::new("default", "shop", "db.pool_size", "20")
        .with_labels([("env", "prod"), ("service", "orders")])
        .with_revision(revisions.advance("default")?);
    doc.label_format = "env=prod::service=orders".to_string();
    doc.value_type = "text".to_string();
    let doc = kv.create(&ctx, doc)?;
    println!("\nCreated {doc} at revision {}", doc.update_revision);

    // Update it twice
    let mut current = doc;
    for value in ["30", "40"] {
        current.value = value.to_string();
        current.update_revision = revisions.advance("default")?;
        current = kv.update(&ctx, current)?;
        println!("Updated to {} at revision {}", current.value, current.update_revision);
    }

    // List what matches
    println!("\nDocuments with keys under db.:");
    let found = kv.list(
        &ctx,
        "default",
        "shop",
        &FindOptions::new().with_key("beginWith(db.)"),
    )?;
    for doc in &found.data {
        println!("  - {} = {} {:?}", doc.key, doc.value, doc.labels);
    }

    // Walk the history
    println!("\nHistory of {}:", current.key);
    let history = broker
        .history_dao()
        .get_history(&ctx, "default", "shop", &current.id, 0, 0)?;
    for snapshot in &history.data {
        println!("  - revision {}: {}", snapshot.update_revision, snapshot.value);
    }

    println!(
        "\n{} documents in default/shop, domain revision {}",
        kv.total("default", "shop")?,
        revisions.current("default")?
    );

    if let Some(refresher) = refresher {
        refresher.shutdown().await;
    }
    Ok(())
}
