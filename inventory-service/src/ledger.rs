//! Stock Ledger: the per-product counters and the only code allowed to
//! change them.

use shared::*;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::store::{InventoryStore, ReservationWrite, StockMutation};

pub struct StockLedger {
    store: Arc<dyn InventoryStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl StockLedger {
    pub fn new(store: Arc<dyn InventoryStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { store, clock, retry }
    }

    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn register_product(&self, product_id: Uuid) -> InventoryResult<ProductStock> {
        let stock = self.store.insert_product(product_id, self.clock.now()).await?;
        info!("Product {} registered at version {}", product_id, stock.version);
        Ok(stock)
    }

    pub async fn current(&self, product_id: Uuid) -> InventoryResult<ProductStock> {
        self.store
            .fetch_stock(product_id)
            .await?
            .ok_or(InventoryError::ProductNotFound(product_id))
    }

    pub async fn stats(&self, product_id: Uuid) -> InventoryResult<StockStats> {
        Ok(self.current(product_id).await?.stats())
    }

    /// Conditional update against `expected_version`. Fails with
    /// `ConcurrentUpdate` if another writer got there first, and with
    /// `InsufficientStock` if the stored counters cannot absorb the delta.
    pub async fn apply_delta(
        &self,
        product_id: Uuid,
        delta: StockDelta,
        expected_version: i64,
        entry: AuditEntry,
    ) -> InventoryResult<ProductStock> {
        self.apply_with(product_id, delta, expected_version, entry, None).await
    }

    pub(crate) async fn apply_with(
        &self,
        product_id: Uuid,
        delta: StockDelta,
        expected_version: i64,
        entry: AuditEntry,
        reservation: Option<ReservationWrite>,
    ) -> InventoryResult<ProductStock> {
        if !delta.is_balanced() {
            return Err(InventoryError::UnbalancedDelta(delta));
        }

        self.store
            .apply(StockMutation {
                product_id,
                delta,
                expected_version,
                entry,
                reservation,
                at: self.clock.now(),
            })
            .await
    }

    /// Administrative restock.
    pub async fn stock_in(&self, product_id: Uuid, quantity: i32, reason: &str, operator_id: &str) -> InventoryResult<ProductStock> {
        ensure_positive(quantity)?;
        let entry = AuditEntry::new(StockRecordType::In, quantity, reason, operator_id);

        let after = self.adjust(product_id, StockDelta::stock_in(quantity), &entry, "stock_in").await?;
        info!("Stocked in {} units of product {} by {}: {}", quantity, product_id, operator_id, reason);
        Ok(after)
    }

    /// Administrative removal (damage, shrinkage, returns to vendor).
    /// Only available units can be removed.
    pub async fn stock_out(&self, product_id: Uuid, quantity: i32, reason: &str, operator_id: &str) -> InventoryResult<ProductStock> {
        ensure_positive(quantity)?;
        let entry = AuditEntry::new(StockRecordType::Out, quantity, reason, operator_id);

        let after = self.adjust(product_id, StockDelta::stock_out(quantity), &entry, "stock_out").await?;
        info!("Stocked out {} units of product {} by {}: {}", quantity, product_id, operator_id, reason);
        Ok(after)
    }

    async fn adjust(&self, product_id: Uuid, delta: StockDelta, entry: &AuditEntry, operation: &str) -> InventoryResult<ProductStock> {
        retry_on_conflict(&self.retry, operation, move || async move {
            let current = self.current(product_id).await?;
            self.apply_delta(product_id, delta, current.version, entry.clone()).await
        })
        .await
    }

    pub async fn history(&self, product_id: Uuid, limit: usize) -> InventoryResult<Vec<StockRecord>> {
        self.store.history(product_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::MemoryStore;

    fn ledger() -> StockLedger {
        StockLedger::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock), RetryPolicy::default())
    }

    fn entry(record_type: StockRecordType, quantity: i32) -> AuditEntry {
        AuditEntry::new(record_type, quantity, "test", "tester")
    }

    #[tokio::test]
    async fn stock_in_records_before_and_after() {
        let ledger = ledger();
        let product_id = Uuid::new_v4();
        ledger.register_product(product_id).await.unwrap();

        ledger.stock_in(product_id, 100, "initial load", "alice").await.unwrap();
        ledger.stock_in(product_id, 20, "delivery", "bob").await.unwrap();

        let stats = ledger.stats(product_id).await.unwrap();
        assert_eq!(stats.stock, 120);
        assert_eq!(stats.available_stock, 120);
        assert_eq!(stats.version, 2);

        let history = ledger.history(product_id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        let latest = &history[0];
        assert_eq!(latest.record_type, StockRecordType::In);
        assert_eq!(latest.before_stock, 100);
        assert_eq!(latest.after_stock, 120);
        assert_eq!(latest.operator_id, "bob");
        assert_eq!(latest.order_id, None);
    }

    #[tokio::test]
    async fn stale_version_is_a_concurrent_update() {
        let ledger = ledger();
        let product_id = Uuid::new_v4();
        ledger.register_product(product_id).await.unwrap();
        ledger.stock_in(product_id, 10, "load", "alice").await.unwrap();

        let err = ledger
            .apply_delta(product_id, StockDelta::reserve(1), 0, entry(StockRecordType::Reserve, 1))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::ConcurrentUpdate { expected_version: 0, .. }));
        assert_eq!(ledger.history(product_id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_stock_is_checked_against_stored_values() {
        let ledger = ledger();
        let product_id = Uuid::new_v4();
        ledger.register_product(product_id).await.unwrap();
        ledger.stock_in(product_id, 3, "load", "alice").await.unwrap();

        let current = ledger.current(product_id).await.unwrap();
        let err = ledger
            .apply_delta(product_id, StockDelta::reserve(4), current.version, entry(StockRecordType::Reserve, 4))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::InsufficientStock { available: 3, .. }));
        assert_eq!(ledger.current(product_id).await.unwrap(), current);
    }

    #[tokio::test]
    async fn unbalanced_deltas_are_refused() {
        let ledger = ledger();
        let product_id = Uuid::new_v4();
        ledger.register_product(product_id).await.unwrap();

        let err = ledger
            .apply_delta(product_id, StockDelta::new(5, 0, 0), 0, entry(StockRecordType::In, 5))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::UnbalancedDelta(_)));
    }

    #[tokio::test]
    async fn stock_out_cannot_take_reserved_units() {
        let ledger = ledger();
        let product_id = Uuid::new_v4();
        ledger.register_product(product_id).await.unwrap();
        ledger.stock_in(product_id, 10, "load", "alice").await.unwrap();
        let current = ledger.current(product_id).await.unwrap();
        ledger
            .apply_delta(product_id, StockDelta::reserve(8), current.version, entry(StockRecordType::Reserve, 8))
            .await
            .unwrap();

        let err = ledger.stock_out(product_id, 3, "damaged", "alice").await.unwrap_err();
        assert!(matches!(err, InventoryError::InsufficientStock { .. }));

        let after = ledger.stock_out(product_id, 2, "damaged", "alice").await.unwrap();
        assert_eq!(after.stock, 8);
        assert_eq!(after.available_stock, 0);
        assert!(after.is_balanced());
    }

    #[tokio::test]
    async fn unknown_products_and_bad_quantities() {
        let ledger = ledger();
        let product_id = Uuid::new_v4();

        assert!(matches!(
            ledger.stock_in(product_id, 1, "load", "alice").await,
            Err(InventoryError::ProductNotFound(_))
        ));
        assert!(matches!(
            ledger.stock_in(product_id, 0, "load", "alice").await,
            Err(InventoryError::InvalidQuantity(0))
        ));
    }
}
