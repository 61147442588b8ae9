use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use shared::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SweeperConfig;
use crate::reservation::{ReleaseCause, ReservationManager};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub released: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Outcome {
    Released,
    Skipped,
    Failed,
}

/// Periodically releases reservations that outlived their TTL.
///
/// Holds no lock beyond its own bookkeeping: release is idempotent, so two
/// sweepers racing on the same reservation end with one release and one
/// no-op.
///
/// Reservations whose release failed are retried only after fresh expired
/// reservations have taken their batch slots, so a stuck row never starves
/// newer ones.
pub struct ExpirationSweeper {
    manager: Arc<ReservationManager>,
    config: SweeperConfig,
    last_run: Mutex<Option<DateTime<Utc>>>,
    deferred: Mutex<HashSet<Uuid>>,
}

impl ExpirationSweeper {
    pub fn new(manager: Arc<ReservationManager>, config: SweeperConfig) -> Self {
        Self {
            manager,
            config,
            last_run: Mutex::new(None),
            deferred: Mutex::new(HashSet::new()),
        }
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Expiration sweeper started, interval {:?}", self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("Error sweeping expired reservations: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Expiration sweeper stopped");
    }

    /// One pass over at most `batch_size` expired reservations, fresh ones
    /// first. A failure on one reservation is logged and left for a later
    /// pass.
    pub async fn sweep_once(&self) -> InventoryResult<SweepReport> {
        let now = self.manager.clock().now();
        let batch_size = self.config.batch_size.max(1);
        let deferred = self.deferred.lock().clone();
        let expired = self
            .manager
            .store()
            .expired_reservations(now, batch_size + deferred.len())
            .await?;

        let (retries, fresh): (Vec<Reservation>, Vec<Reservation>) =
            expired.into_iter().partition(|r| deferred.contains(&r.id));
        let mut batch = fresh;
        batch.truncate(batch_size);
        let room = batch_size - batch.len();
        let mut retries = retries.into_iter();
        batch.extend(retries.by_ref().take(room));
        let mut still_deferred: HashSet<Uuid> = retries.map(|r| r.id).collect();

        let mut report = SweepReport {
            scanned: batch.len(),
            ..SweepReport::default()
        };

        let outcomes: Vec<(Uuid, Outcome)> = stream::iter(batch)
            .map(|reservation| async move { (reservation.id, self.expire(reservation).await) })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (id, outcome) in outcomes {
            match outcome {
                Outcome::Released => report.released += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => {
                    report.failed += 1;
                    still_deferred.insert(id);
                }
            }
        }

        if report.failed == batch_size {
            warn!("Every reservation in a sweep batch of {} failed to release", batch_size);
        }
        *self.deferred.lock() = still_deferred;
        *self.last_run.lock() = Some(now);
        if report.scanned > 0 {
            info!(
                "Sweep found {} expired reservations: {} released, {} skipped, {} failed",
                report.scanned, report.released, report.skipped, report.failed
            );
        }
        Ok(report)
    }

    async fn expire(&self, reservation: Reservation) -> Outcome {
        let released = self
            .manager
            .release_for(reservation.order_id, reservation.product_id, ReleaseCause::Expired)
            .await;

        match released {
            Ok(true) => Outcome::Released,
            Ok(false) => Outcome::Skipped,
            Err(InventoryError::InvalidStateTransition { .. }) => {
                debug!("Reservation {} was confirmed before it could expire", reservation.id);
                Outcome::Skipped
            }
            Err(e) => {
                error!("Failed to release expired reservation {}: {}", reservation.id, e);
                Outcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::ledger::StockLedger;
    use crate::memory::MemoryStore;
    use crate::retry::RetryPolicy;
    use crate::store::{InventoryStore, ReservationWrite, StockMutation};
    use async_trait::async_trait;
    use chrono::Duration;
    use uuid::Uuid;

    type Setup = (Arc<ReservationManager>, Arc<StockLedger>, Arc<ManualClock>, Uuid);

    async fn setup(stock: i32) -> Setup {
        setup_with(Arc::new(MemoryStore::new()), stock).await
    }

    async fn setup_with(store: Arc<dyn InventoryStore>, stock: i32) -> Setup {
        let clock = Arc::new(ManualClock::default());
        let ledger = Arc::new(StockLedger::new(store, clock.clone(), RetryPolicy::default()));
        let product_id = Uuid::new_v4();
        ledger.register_product(product_id).await.unwrap();
        ledger.stock_in(product_id, stock, "initial load", "tester").await.unwrap();
        let manager = Arc::new(ReservationManager::new(ledger.clone(), Duration::minutes(30)));
        (manager, ledger, clock, product_id)
    }

    #[tokio::test]
    async fn releases_only_expired_reservations() {
        let (manager, ledger, clock, product_id) = setup(20).await;
        let old = Uuid::new_v4();
        manager.reserve(product_id, old, 5).await.unwrap();
        clock.advance(Duration::minutes(20));
        let fresh = Uuid::new_v4();
        manager.reserve(product_id, fresh, 3).await.unwrap();
        clock.advance(Duration::minutes(11));

        let sweeper = ExpirationSweeper::new(manager.clone(), SweeperConfig::default());
        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(report, SweepReport { scanned: 1, released: 1, skipped: 0, failed: 0 });
        assert_eq!(sweeper.last_run(), Some(clock.now()));
        let old = manager.reservation(old, product_id).await.unwrap().unwrap();
        assert_eq!(old.status, ReservationStatus::Cancelled);
        let fresh = manager.reservation(fresh, product_id).await.unwrap().unwrap();
        assert_eq!(fresh.status, ReservationStatus::Reserved);

        let stats = ledger.stats(product_id).await.unwrap();
        assert_eq!((stats.stock, stats.reserved_stock, stats.available_stock), (20, 3, 17));
    }

    #[tokio::test]
    async fn confirmed_and_cancelled_reservations_are_left_alone() {
        let (manager, ledger, clock, product_id) = setup(20).await;
        let confirmed = Uuid::new_v4();
        let cancelled = Uuid::new_v4();
        manager.reserve(product_id, confirmed, 5).await.unwrap();
        manager.reserve(product_id, cancelled, 5).await.unwrap();
        manager.confirm(confirmed, product_id).await.unwrap();
        manager.release(cancelled, product_id).await.unwrap();
        clock.advance(Duration::hours(2));
        let before = ledger.stats(product_id).await.unwrap();

        let sweeper = ExpirationSweeper::new(manager, SweeperConfig::default());
        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(report.scanned, 0);
        assert_eq!(ledger.stats(product_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn concurrent_sweepers_release_once() {
        let (manager, ledger, clock, product_id) = setup(50).await;
        for _ in 0..10 {
            manager.reserve(product_id, Uuid::new_v4(), 2).await.unwrap();
        }
        clock.advance(Duration::minutes(31));

        let a = ExpirationSweeper::new(manager.clone(), SweeperConfig::default());
        let b = ExpirationSweeper::new(manager.clone(), SweeperConfig::default());
        let (ra, rb) = tokio::join!(a.sweep_once(), b.sweep_once());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.released + rb.released, 10);
        assert_eq!(ra.failed + rb.failed, 0);

        let stats = ledger.stats(product_id).await.unwrap();
        assert_eq!((stats.stock, stats.reserved_stock, stats.available_stock), (50, 0, 50));
        let releases = ledger
            .history(product_id, 100)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.record_type == StockRecordType::Release)
            .count();
        assert_eq!(releases, 10);
    }

    #[tokio::test]
    async fn run_sweeps_until_shutdown() {
        let (manager, ledger, clock, product_id) = setup(10).await;
        let order_id = Uuid::new_v4();
        manager.reserve(product_id, order_id, 4).await.unwrap();
        clock.advance(Duration::minutes(45));

        let sweeper = Arc::new(ExpirationSweeper::new(
            manager.clone(),
            SweeperConfig {
                interval: std::time::Duration::from_millis(10),
                ..SweeperConfig::default()
            },
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let sweeper = sweeper.clone();
            async move { sweeper.run(rx).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(sweeper.last_run().is_some());
        assert_eq!(ledger.stats(product_id).await.unwrap().available_stock, 10);
    }

    /// Refuses to move reservations of the listed orders.
    struct StuckStore {
        inner: MemoryStore,
        stuck: HashSet<Uuid>,
    }

    #[async_trait]
    impl InventoryStore for StuckStore {
        async fn insert_product(&self, product_id: Uuid, now: DateTime<Utc>) -> InventoryResult<ProductStock> {
            self.inner.insert_product(product_id, now).await
        }

        async fn fetch_stock(&self, product_id: Uuid) -> InventoryResult<Option<ProductStock>> {
            self.inner.fetch_stock(product_id).await
        }

        async fn apply(&self, mutation: StockMutation) -> InventoryResult<ProductStock> {
            if let Some(ReservationWrite::Transition { order_id, .. }) = &mutation.reservation {
                if self.stuck.contains(order_id) {
                    return Err(InventoryError::Storage(anyhow::anyhow!("row locked")));
                }
            }
            self.inner.apply(mutation).await
        }

        async fn find_reservation(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<Option<Reservation>> {
            self.inner.find_reservation(order_id, product_id).await
        }

        async fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> InventoryResult<Vec<Reservation>> {
            self.inner.expired_reservations(now, limit).await
        }

        async fn history(&self, product_id: Uuid, limit: usize) -> InventoryResult<Vec<StockRecord>> {
            self.inner.history(product_id, limit).await
        }
    }

    #[tokio::test]
    async fn failing_reservations_do_not_starve_newer_ones() {
        let stuck: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let store = StuckStore {
            inner: MemoryStore::new(),
            stuck: stuck.iter().copied().collect(),
        };
        let (manager, ledger, clock, product_id) = setup_with(Arc::new(store), 20).await;
        for order_id in &stuck {
            manager.reserve(product_id, *order_id, 2).await.unwrap();
        }
        clock.advance(Duration::minutes(1));
        let fresh = Uuid::new_v4();
        manager.reserve(product_id, fresh, 3).await.unwrap();
        clock.advance(Duration::minutes(31));

        let sweeper = ExpirationSweeper::new(
            manager.clone(),
            SweeperConfig {
                batch_size: 2,
                ..SweeperConfig::default()
            },
        );

        let first = sweeper.sweep_once().await.unwrap();
        assert_eq!(first, SweepReport { scanned: 2, released: 0, skipped: 0, failed: 2 });

        let second = sweeper.sweep_once().await.unwrap();
        assert_eq!(second, SweepReport { scanned: 2, released: 1, skipped: 0, failed: 1 });
        let fresh = manager.reservation(fresh, product_id).await.unwrap().unwrap();
        assert_eq!(fresh.status, ReservationStatus::Cancelled);

        let stats = ledger.stats(product_id).await.unwrap();
        assert_eq!((stats.stock, stats.reserved_stock, stats.available_stock), (20, 4, 16));

        // Stuck rows keep getting retried.
        let third = sweeper.sweep_once().await.unwrap();
        assert_eq!(third, SweepReport { scanned: 2, released: 0, skipped: 0, failed: 2 });
    }
}
