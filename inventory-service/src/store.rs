//! Persistence seam for the engine.
//!
//! A store owns three tables: product counters, reservations and the
//! append-only stock record ledger. The only write path for counters is
//! [`InventoryStore::apply`], which performs a compare-and-swap on the
//! product `version` and, in the same atomic unit, appends the audit
//! record and writes the reservation row that goes with the change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::*;
use uuid::Uuid;

/// Reservation row change that must commit together with a counter update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationWrite {
    Insert(Reservation),
    /// Moves a `reserved` row into `to`. Fails the whole unit with
    /// `ConcurrentUpdate` if the row is no longer `reserved`.
    Transition {
        reservation_id: Uuid,
        order_id: Uuid,
        to: ReservationStatus,
    },
}

#[derive(Debug, Clone)]
pub struct StockMutation {
    pub product_id: Uuid,
    pub delta: StockDelta,
    pub expected_version: i64,
    pub entry: AuditEntry,
    pub reservation: Option<ReservationWrite>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Creates a zeroed counters row if none exists and returns the current row.
    async fn insert_product(&self, product_id: Uuid, now: DateTime<Utc>) -> InventoryResult<ProductStock>;

    async fn fetch_stock(&self, product_id: Uuid) -> InventoryResult<Option<ProductStock>>;

    /// Conditional update. Succeeds only when the stored version equals
    /// `expected_version` and the delta keeps every counter non-negative
    /// against the stored values. On success exactly one stock record is
    /// appended.
    async fn apply(&self, mutation: StockMutation) -> InventoryResult<ProductStock>;

    async fn find_reservation(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<Option<Reservation>>;

    /// Reservations still `reserved` whose `expires_at` is before `now`, oldest first.
    async fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> InventoryResult<Vec<Reservation>>;

    /// Most recent records first.
    async fn history(&self, product_id: Uuid, limit: usize) -> InventoryResult<Vec<StockRecord>>;
}
