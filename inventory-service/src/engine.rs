//! The engine as the order workflow sees it.
//!
//! ```ignore
//! let engine = InventoryEngine::in_memory(EngineConfig::default());
//! engine.register_product(product_id).await?;
//! engine.stock_in(product_id, 100, "initial load", "ops").await?;
//!
//! let reservation_id = engine.reserve(product_id, order_id, 5).await?;
//! engine.confirm(order_id, product_id).await?;
//! ```

use shared::*;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, SweeperConfig};
use crate::ledger::StockLedger;
use crate::memory::MemoryStore;
use crate::reservation::ReservationManager;
use crate::store::InventoryStore;
use crate::sweeper::ExpirationSweeper;

#[derive(Clone)]
pub struct InventoryEngine {
    ledger: Arc<StockLedger>,
    reservations: Arc<ReservationManager>,
}

impl InventoryEngine {
    pub fn new(store: Arc<dyn InventoryStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let ledger = Arc::new(StockLedger::new(store, clock, config.retry));
        let reservations = Arc::new(ReservationManager::new(ledger.clone(), config.reservation_ttl));
        Self { ledger, reservations }
    }

    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock), config)
    }

    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    pub fn sweeper(&self, config: SweeperConfig) -> ExpirationSweeper {
        ExpirationSweeper::new(self.reservations.clone(), config)
    }

    pub async fn register_product(&self, product_id: Uuid) -> InventoryResult<StockStats> {
        Ok(self.ledger.register_product(product_id).await?.stats())
    }

    pub async fn reserve(&self, product_id: Uuid, order_id: Uuid, quantity: i32) -> InventoryResult<Uuid> {
        let result = self.reservations.reserve(product_id, order_id, quantity).await;
        audit("reserve", product_id, Some(order_id), result)
    }

    pub async fn confirm(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<()> {
        let result = self.reservations.confirm(order_id, product_id).await;
        audit("confirm", product_id, Some(order_id), result)
    }

    pub async fn release(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<()> {
        let result = self.reservations.release(order_id, product_id).await;
        audit("release", product_id, Some(order_id), result)
    }

    pub async fn reservation(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<Option<Reservation>> {
        self.reservations.reservation(order_id, product_id).await
    }

    pub async fn stock_in(&self, product_id: Uuid, quantity: i32, reason: &str, operator_id: &str) -> InventoryResult<()> {
        let result = self.ledger.stock_in(product_id, quantity, reason, operator_id).await;
        audit("stock_in", product_id, None, result).map(|_| ())
    }

    pub async fn stock_out(&self, product_id: Uuid, quantity: i32, reason: &str, operator_id: &str) -> InventoryResult<()> {
        let result = self.ledger.stock_out(product_id, quantity, reason, operator_id).await;
        audit("stock_out", product_id, None, result).map(|_| ())
    }

    pub async fn get_stock_stats(&self, product_id: Uuid) -> InventoryResult<StockStats> {
        self.ledger.stats(product_id).await
    }

    pub async fn query_history(&self, product_id: Uuid, limit: usize) -> InventoryResult<Vec<StockRecord>> {
        self.ledger.history(product_id, limit).await
    }
}

/// Failed calls leave no stock record, so they are logged here instead.
/// Invalid transitions and missing reservations mean the caller is out of
/// step with the engine and are logged as errors.
fn audit<T>(operation: &str, product_id: Uuid, order_id: Option<Uuid>, result: InventoryResult<T>) -> InventoryResult<T> {
    if let Err(err) = &result {
        let target = match order_id {
            Some(order_id) => format!("product {} for order {}", product_id, order_id),
            None => format!("product {}", product_id),
        };
        match err {
            InventoryError::InvalidStateTransition { .. } | InventoryError::ReservationNotFound { .. } => {
                error!("Rejected {} on {}: {}", operation, target, err)
            }
            InventoryError::InsufficientStock { .. } | InventoryError::DuplicateReservation { .. } => {
                debug!("Refused {} on {}: {}", operation, target, err)
            }
            _ => warn!("Failed {} on {}: {}", operation, target, err),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exposes_counters_and_history() {
        let engine = InventoryEngine::in_memory(EngineConfig::default());
        let product_id = Uuid::new_v4();

        let fresh = engine.register_product(product_id).await.unwrap();
        assert_eq!(fresh, StockStats { stock: 0, reserved_stock: 0, available_stock: 0, version: 0 });

        engine.stock_in(product_id, 12, "initial load", "ops").await.unwrap();
        let order_id = Uuid::new_v4();
        let reservation_id = engine.reserve(product_id, order_id, 2).await.unwrap();
        engine.stock_out(product_id, 1, "damaged", "ops").await.unwrap();

        let stats = engine.get_stock_stats(product_id).await.unwrap();
        assert_eq!(stats, StockStats { stock: 11, reserved_stock: 2, available_stock: 9, version: 3 });

        let reservation = engine.reservation(order_id, product_id).await.unwrap().unwrap();
        assert_eq!(reservation.id, reservation_id);

        let history = engine.query_history(product_id, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].record_type, StockRecordType::Out);
        assert_eq!(history[0].order_id, None);
        assert_eq!(history[1].record_type, StockRecordType::Reserve);
    }

    #[tokio::test]
    async fn stock_in_past_the_counter_range_is_refused() {
        let engine = InventoryEngine::in_memory(EngineConfig::default());
        let product_id = Uuid::new_v4();
        engine.register_product(product_id).await.unwrap();
        engine.stock_in(product_id, i32::MAX, "initial load", "ops").await.unwrap();

        let err = engine.stock_in(product_id, 1, "delivery", "ops").await.unwrap_err();

        assert!(matches!(err, InventoryError::StockOverflow { .. }));
        let stats = engine.get_stock_stats(product_id).await.unwrap();
        assert_eq!(stats, StockStats { stock: i32::MAX, reserved_stock: 0, available_stock: i32::MAX, version: 1 });
        assert_eq!(engine.query_history(product_id, 10).await.unwrap().len(), 1);
    }
}
