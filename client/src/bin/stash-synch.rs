//! stash-synch - run one synch of a set of tables against a server.
//!
//! Table definitions are read from the JSON file named by `STASH_TABLES`,
//! an object mapping table names to definitions. Everything else comes from
//! the `STASH_*` configuration variables.

use std::collections::BTreeMap;

use stash_client::{Database, DatabaseConfig};
use stash_engine::TableDef;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stash_client=debug,stash_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = DatabaseConfig::from_env()?
        .with_synch_enabled(true)
        .with_auto_synch(false);

    let path = std::env::var("STASH_TABLES")
        .map_err(|_| "STASH_TABLES must name a table definition file")?;
    let definitions: BTreeMap<String, TableDef> =
        serde_json::from_str(&std::fs::read_to_string(&path)?)?;

    tracing::info!("Synching {} tables with {}", definitions.len(), config.synch_url);

    let db = Database::new("stash-synch", config)?;
    for (name, def) in definitions {
        db.create_table(name, def)?;
    }

    let outcome = db.synch(true).await?;
    for name in db.table_names() {
        db.with_table(&name, |table| {
            tracing::info!(
                table = %name,
                records = table.len(),
                stale = table.stale().len(),
                failed = table.failed().len(),
                "table synched"
            );
        })?;
    }
    tracing::info!(changed = outcome.changed, "synch done");

    Ok(())
}
