pub mod transaction;

use crate::config::ProcurementConfig;
use crate::errors::ServiceError;
use crate::models::{
    ledger_entry, purchase_order, purchase_order_line, purchase_order_snapshot, quotation,
    quotation_offer, receipt_event, required_product_line, requisition,
};
use metrics::gauge;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema};
use std::time::Duration;
use tracing::{info, instrument};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

impl DbConfig {
    /// A single long-lived connection to a private in-memory SQLite database.
    ///
    /// In-memory SQLite databases live and die with their connection, so the pool is pinned
    /// to exactly one connection that is never reaped.
    pub fn sqlite_in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            idle_timeout: Duration::from_secs(24 * 60 * 60),
            ..Default::default()
        }
    }
}

/// Establishes a connection pool using explicit settings
#[instrument(skip(config), fields(max_connections = config.max_connections))]
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    let mut options = ConnectOptions::new(config.url.clone());
    options
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .idle_timeout(config.idle_timeout)
        .acquire_timeout(config.acquire_timeout)
        .sqlx_logging(false);

    let pool = Database::connect(options).await.map_err(ServiceError::db_error)?;

    gauge!(
        "stateset_procurement_db.max_connections",
        config.max_connections as f64
    );
    info!(backend = ?pool.get_database_backend(), "Database connection established");
    Ok(pool)
}

/// Establishes a connection pool from the procurement configuration
pub async fn establish_connection_from_config(
    config: &ProcurementConfig,
) -> Result<DbPool, ServiceError> {
    let db_config = DbConfig {
        url: config.database_url.clone(),
        max_connections: config.db_max_connections,
        min_connections: config.db_min_connections,
        ..Default::default()
    };
    establish_connection_with_config(&db_config).await
}

async fn create_table<E>(db: &DbPool, schema: &Schema, entity: E) -> Result<(), ServiceError>
where
    E: EntityTrait,
{
    let backend = db.get_database_backend();
    let mut statement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(backend.build(&statement))
        .await
        .map_err(ServiceError::db_error)?;
    Ok(())
}

/// Creates every procurement table that does not exist yet, parents before children.
pub async fn create_schema(db: &DbPool) -> Result<(), ServiceError> {
    let schema = Schema::new(db.get_database_backend());

    create_table(db, &schema, requisition::Entity).await?;
    create_table(db, &schema, required_product_line::Entity).await?;
    create_table(db, &schema, quotation::Entity).await?;
    create_table(db, &schema, quotation_offer::Entity).await?;
    create_table(db, &schema, purchase_order::Entity).await?;
    create_table(db, &schema, purchase_order_line::Entity).await?;
    create_table(db, &schema, purchase_order_snapshot::Entity).await?;
    create_table(db, &schema, receipt_event::Entity).await?;
    create_table(db, &schema, ledger_entry::Entity).await?;

    info!("Procurement schema ready");
    Ok(())
}
