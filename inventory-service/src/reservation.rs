//! Reservation Manager.
//!
//! A reservation starts `reserved` and moves exactly once, to `confirmed`
//! (units leave the building) or `cancelled` (units go back on sale).
//! Every step re-reads the counters and the reservation row inside the
//! retry loop, so a lost version race is simply replayed from fresh state.

use chrono::Duration;
use shared::*;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::ledger::StockLedger;
use crate::retry::retry_on_conflict;
use crate::store::{InventoryStore, ReservationWrite};

const OPERATOR: &str = "reservation-manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseCause {
    Cancelled,
    Expired,
}

impl ReleaseCause {
    fn reason(&self) -> &'static str {
        match self {
            ReleaseCause::Cancelled => "order cancelled",
            ReleaseCause::Expired => "reservation expired",
        }
    }

    fn operator(&self) -> &'static str {
        match self {
            ReleaseCause::Cancelled => OPERATOR,
            ReleaseCause::Expired => "expiration-sweeper",
        }
    }
}

pub struct ReservationManager {
    ledger: Arc<StockLedger>,
    ttl: Duration,
}

impl ReservationManager {
    pub fn new(ledger: Arc<StockLedger>, ttl: Duration) -> Self {
        Self { ledger, ttl }
    }

    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        self.ledger.store()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.ledger.clock()
    }

    pub async fn reservation(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<Option<Reservation>> {
        self.store().find_reservation(order_id, product_id).await
    }

    /// Holds `quantity` units for the order. Calling it again while the
    /// reservation is still `reserved` returns the same id.
    pub async fn reserve(&self, product_id: Uuid, order_id: Uuid, quantity: i32) -> InventoryResult<Uuid> {
        ensure_positive(quantity)?;

        retry_on_conflict(self.ledger.retry_policy(), "reserve", move || {
            self.try_reserve(product_id, order_id, quantity)
        })
        .await
    }

    async fn try_reserve(&self, product_id: Uuid, order_id: Uuid, quantity: i32) -> InventoryResult<Uuid> {
        if let Some(existing) = self.reservation(order_id, product_id).await? {
            return existing_reservation(existing);
        }

        let current = self.ledger.current(product_id).await?;
        if current.available_stock < quantity {
            return Err(InventoryError::InsufficientStock {
                product_id,
                requested: quantity,
                available: current.available_stock,
            });
        }

        let reservation = Reservation::new(product_id, order_id, quantity, self.clock().now(), self.ttl);
        let reservation_id = reservation.id;
        let expires_at = reservation.expires_at;
        let entry = AuditEntry::new(StockRecordType::Reserve, quantity, "order checkout", OPERATOR).for_order(order_id);

        let applied = self
            .ledger
            .apply_with(
                product_id,
                StockDelta::reserve(quantity),
                current.version,
                entry,
                Some(ReservationWrite::Insert(reservation)),
            )
            .await;

        match applied {
            Ok(after) => {
                info!(
                    "Reserved {} units of product {} for order {} until {} (available now {})",
                    quantity, product_id, order_id, expires_at, after.available_stock
                );
                Ok(reservation_id)
            }
            // Another call for the same order won the insert; our counter
            // update was rolled back with it.
            Err(InventoryError::DuplicateReservation { .. }) => match self.reservation(order_id, product_id).await? {
                Some(existing) => existing_reservation(existing),
                None => Err(InventoryError::ConcurrentUpdate {
                    product_id,
                    expected_version: current.version,
                }),
            },
            Err(err) => Err(err),
        }
    }

    /// Turns the hold into a permanent deduction. Confirming twice is a no-op.
    pub async fn confirm(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<()> {
        retry_on_conflict(self.ledger.retry_policy(), "confirm", move || {
            self.try_confirm(order_id, product_id)
        })
        .await
    }

    async fn try_confirm(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<()> {
        let reservation = self.load(order_id, product_id).await?;
        match reservation.status {
            ReservationStatus::Reserved => {}
            ReservationStatus::Confirmed => {
                debug!("Reservation {} already confirmed", reservation.id);
                return Ok(());
            }
            ReservationStatus::Cancelled => {
                return Err(InventoryError::InvalidStateTransition {
                    reservation_id: reservation.id,
                    from: ReservationStatus::Cancelled,
                    to: ReservationStatus::Confirmed,
                });
            }
        }

        let current = self.ledger.current(product_id).await?;
        let entry = AuditEntry::new(StockRecordType::Out, reservation.quantity, "order confirmed", OPERATOR)
            .for_order(order_id);

        self.ledger
            .apply_with(
                product_id,
                StockDelta::confirm(reservation.quantity),
                current.version,
                entry,
                Some(ReservationWrite::Transition {
                    reservation_id: reservation.id,
                    order_id,
                    to: ReservationStatus::Confirmed,
                }),
            )
            .await?;

        info!(
            "Confirmed reservation {} ({} units of product {}) for order {}",
            reservation.id, reservation.quantity, product_id, order_id
        );
        Ok(())
    }

    /// Returns the held units to available stock. Releasing an already
    /// cancelled reservation is a no-op; a confirmed one cannot be released.
    pub async fn release(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<()> {
        self.release_for(order_id, product_id, ReleaseCause::Cancelled).await?;
        Ok(())
    }

    /// Like [`release`](Self::release), reporting whether this call did
    /// the release (`true`) or found it already cancelled (`false`).
    pub async fn release_for(&self, order_id: Uuid, product_id: Uuid, cause: ReleaseCause) -> InventoryResult<bool> {
        retry_on_conflict(self.ledger.retry_policy(), "release", move || {
            self.try_release(order_id, product_id, cause)
        })
        .await
    }

    async fn try_release(&self, order_id: Uuid, product_id: Uuid, cause: ReleaseCause) -> InventoryResult<bool> {
        let reservation = self.load(order_id, product_id).await?;
        match reservation.status {
            ReservationStatus::Reserved => {}
            ReservationStatus::Cancelled => {
                debug!("Reservation {} already cancelled", reservation.id);
                return Ok(false);
            }
            ReservationStatus::Confirmed => {
                return Err(InventoryError::InvalidStateTransition {
                    reservation_id: reservation.id,
                    from: ReservationStatus::Confirmed,
                    to: ReservationStatus::Cancelled,
                });
            }
        }

        let current = self.ledger.current(product_id).await?;
        let entry = AuditEntry::new(StockRecordType::Release, reservation.quantity, cause.reason(), cause.operator())
            .for_order(order_id);

        self.ledger
            .apply_with(
                product_id,
                StockDelta::release(reservation.quantity),
                current.version,
                entry,
                Some(ReservationWrite::Transition {
                    reservation_id: reservation.id,
                    order_id,
                    to: ReservationStatus::Cancelled,
                }),
            )
            .await?;

        info!(
            "Released reservation {} ({} units of product {}) for order {}: {}",
            reservation.id,
            reservation.quantity,
            product_id,
            order_id,
            cause.reason()
        );
        Ok(true)
    }

    async fn load(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<Reservation> {
        self.reservation(order_id, product_id)
            .await?
            .ok_or(InventoryError::ReservationNotFound { order_id, product_id })
    }
}

fn existing_reservation(existing: Reservation) -> InventoryResult<Uuid> {
    if existing.status == ReservationStatus::Reserved {
        debug!("Order {} already holds reservation {}", existing.order_id, existing.id);
        Ok(existing.id)
    } else {
        Err(InventoryError::DuplicateReservation {
            order_id: existing.order_id,
            product_id: existing.product_id,
            status: existing.status,
        })
    }
}
