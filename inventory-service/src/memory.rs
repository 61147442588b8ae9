use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use shared::*;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::store::{InventoryStore, ReservationWrite, StockMutation};

/// Everything owned by one product. A mutation locks exactly one shard,
/// so unrelated products never contend.
#[derive(Debug)]
struct ProductShard {
    stock: ProductStock,
    reservations: HashMap<Uuid, Reservation>,
    records: Vec<StockRecord>,
}

/// In-process store. Useful for tests and for embedding the engine
/// without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    products: DashMap<Uuid, Arc<Mutex<ProductShard>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, product_id: Uuid) -> Option<Arc<Mutex<ProductShard>>> {
        self.products.get(&product_id).map(|entry| Arc::clone(entry.value()))
    }

    fn shards(&self) -> Vec<Arc<Mutex<ProductShard>>> {
        self.products.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn insert_product(&self, product_id: Uuid, now: DateTime<Utc>) -> InventoryResult<ProductStock> {
        let shard = self
            .products
            .entry(product_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(ProductShard {
                    stock: ProductStock::new(product_id, now),
                    reservations: HashMap::new(),
                    records: Vec::new(),
                }))
            })
            .value()
            .clone();

        let stock = shard.lock().stock.clone();
        Ok(stock)
    }

    async fn fetch_stock(&self, product_id: Uuid) -> InventoryResult<Option<ProductStock>> {
        Ok(self.shard(product_id).map(|shard| shard.lock().stock.clone()))
    }

    async fn apply(&self, mutation: StockMutation) -> InventoryResult<ProductStock> {
        let shard = self
            .shard(mutation.product_id)
            .ok_or(InventoryError::ProductNotFound(mutation.product_id))?;
        let mut shard = shard.lock();

        if shard.stock.version != mutation.expected_version {
            return Err(InventoryError::ConcurrentUpdate {
                product_id: mutation.product_id,
                expected_version: mutation.expected_version,
            });
        }

        // The reservation write is checked before the counters: a racer
        // that already moved the reservation must surface as a conflict,
        // not as a shortfall in the counters it drained.
        let reservation = match mutation.reservation {
            Some(ReservationWrite::Insert(reservation)) => {
                if let Some(existing) = shard.reservations.get(&reservation.order_id) {
                    return Err(InventoryError::DuplicateReservation {
                        order_id: existing.order_id,
                        product_id: existing.product_id,
                        status: existing.status,
                    });
                }
                Some(reservation)
            }
            Some(ReservationWrite::Transition { reservation_id, order_id, to }) => {
                let current = shard
                    .reservations
                    .get(&order_id)
                    .filter(|r| r.id == reservation_id)
                    .ok_or(InventoryError::ReservationNotFound {
                        order_id,
                        product_id: mutation.product_id,
                    })?;
                if current.status != ReservationStatus::Reserved {
                    return Err(InventoryError::ConcurrentUpdate {
                        product_id: mutation.product_id,
                        expected_version: mutation.expected_version,
                    });
                }
                Some(current.transition(to, mutation.at)?)
            }
            None => None,
        };

        let next = shard.stock.apply(&mutation.delta, mutation.at)?;
        let record = StockRecord::capture(&mutation.entry, &shard.stock, &next);
        if let Some(reservation) = reservation {
            shard.reservations.insert(reservation.order_id, reservation);
        }
        shard.records.push(record);
        shard.stock = next.clone();

        Ok(next)
    }

    async fn find_reservation(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<Option<Reservation>> {
        Ok(self
            .shard(product_id)
            .and_then(|shard| shard.lock().reservations.get(&order_id).cloned()))
    }

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> InventoryResult<Vec<Reservation>> {
        let mut expired: Vec<Reservation> = self
            .shards()
            .into_iter()
            .flat_map(|shard| {
                let shard = shard.lock();
                shard
                    .reservations
                    .values()
                    .filter(|r| r.is_expired(now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn history(&self, product_id: Uuid, limit: usize) -> InventoryResult<Vec<StockRecord>> {
        Ok(self
            .shard(product_id)
            .map(|shard| shard.lock().records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
