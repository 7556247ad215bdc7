use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

use stateset_procurement as procurement;

/// Boots the procurement core against the configured database: prepares the schema,
/// wires the services and drains domain events until interrupted.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = procurement::config::load_config().context("failed to load configuration")?;
    procurement::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = procurement::db::establish_connection_from_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    procurement::db::create_schema(&db_pool)
        .await
        .context("failed to prepare the procurement schema")?;

    let (event_sender, event_rx) =
        procurement::events::EventSender::channel(cfg.event_channel_capacity);
    let events = tokio::spawn(procurement::events::process_events(event_rx));

    if cfg.is_production() {
        warn!("Running with in-memory master data and stock ledger; embed the library to plug in real collaborators");
    }
    let services = procurement::ProcurementServices::new(
        procurement::ServiceDependencies {
            db: Arc::new(db_pool),
            event_sender,
            audit: Arc::new(procurement::audit::TracingAuditSink),
            master_data: Arc::new(procurement::integrations::InMemoryMasterData::new()),
            stock_ledger: Arc::new(procurement::integrations::InMemoryStockLedger::new()),
        },
        &cfg,
    );
    info!(environment = %cfg.environment, "Procurement core ready");

    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    drop(services);
    if let Err(e) = events.await {
        warn!(error = %e, "Event processor ended abnormally");
    }
    Ok(())
}
