use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum StockCondition {
    Good,
    Damaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDeltaOutcome {
    pub quantity_before: i64,
    pub quantity_after: i64,
}

/// The physical stock ledger, written once per received ok or damaged quantity.
#[async_trait]
pub trait StockLedger: Send + Sync {
    async fn apply_stock_delta(
        &self,
        product_id: Uuid,
        warehouse_id: Uuid,
        quantity: i32,
        condition: StockCondition,
    ) -> Result<StockDeltaOutcome, ServiceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryStockLedger {
    balances: DashMap<(Uuid, Uuid, StockCondition), i64>,
}

impl InMemoryStockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, product_id: Uuid, warehouse_id: Uuid, condition: StockCondition) -> i64 {
        self.balances
            .get(&(product_id, warehouse_id, condition))
            .map(|b| *b)
            .unwrap_or(0)
    }
}

#[async_trait]
impl StockLedger for InMemoryStockLedger {
    async fn apply_stock_delta(
        &self,
        product_id: Uuid,
        warehouse_id: Uuid,
        quantity: i32,
        condition: StockCondition,
    ) -> Result<StockDeltaOutcome, ServiceError> {
        let mut balance = self
            .balances
            .entry((product_id, warehouse_id, condition))
            .or_insert(0);
        let quantity_before = *balance;
        *balance += i64::from(quantity);
        let outcome = StockDeltaOutcome {
            quantity_before,
            quantity_after: *balance,
        };
        debug!(%product_id, %warehouse_id, %condition, quantity, "Stock delta applied");
        Ok(outcome)
    }
}
