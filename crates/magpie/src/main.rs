mod cli;
mod config;

use std::sync::Arc;

use clap::Parser;
use eyre::WrapErr;
use mongodb::bson::doc;

use magpie_core::store::{MongoDocuments, Store};
use magpie_core::Indexer;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();
    let cfg = config::load(&args.config)
        .wrap_err_with(|| format!("load configuration from {}", args.config.display()))?;

    let filter = config::tracing_filter(&cfg.logger.level)?;
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_file(cfg.logger.log_backtrace_enabled)
        .with_line_number(cfg.logger.log_backtrace_enabled)
        .with_level(true)
        .init();
    tracing::info!("logger setup complete");

    // Connect to MongoDB and verify the deployment answers before
    // starting the sync engine.
    let client = mongodb::Client::with_uri_str(&cfg.db.uri)
        .await
        .wrap_err("connect to MongoDB")?;
    let db = client.database(&cfg.db.database);
    db.run_command(doc! { "ping": 1 })
        .await
        .wrap_err("ping MongoDB deployment")?;
    tracing::info!(database = %cfg.db.database, "MongoDB setup complete");

    let documents = MongoDocuments::new(&db);
    documents
        .ensure_indexes()
        .await
        .wrap_err("create document indexes")?;

    let store = Arc::new(Store::new(Arc::new(documents)));
    let network = args.chain.network();
    tracing::info!(network = %network, headers_first = cfg.index.headers_first, "starting indexer");

    let indexer = Indexer::new(network, cfg.index.headers_first, store);
    indexer.run().await.wrap_err("run sync engine")?;
    Ok(())
}
