use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("concurrent update on product {product_id}: expected version {expected_version}")]
    ConcurrentUpdate { product_id: Uuid, expected_version: i64 },

    #[error("no reservation for order {order_id} on product {product_id}")]
    ReservationNotFound { order_id: Uuid, product_id: Uuid },

    #[error("reservation {reservation_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        reservation_id: Uuid,
        from: ReservationStatus,
        to: ReservationStatus,
    },

    #[error("product {0} not found")]
    ProductNotFound(Uuid),

    #[error("order {order_id} already holds a {status} reservation on product {product_id}")]
    DuplicateReservation {
        order_id: Uuid,
        product_id: Uuid,
        status: ReservationStatus,
    },

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i32),

    #[error("stock counters of product {product_id} would overflow applying {delta:?}")]
    StockOverflow { product_id: Uuid, delta: StockDelta },

    #[error("unbalanced stock delta {0:?}")]
    UnbalancedDelta(StockDelta),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl InventoryError {
    /// Transient errors come from losing a race on the version token and
    /// are worth retrying after a re-read. Everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, InventoryError::ConcurrentUpdate { .. })
    }
}

impl From<diesel::result::Error> for InventoryError {
    fn from(err: diesel::result::Error) -> Self {
        InventoryError::Storage(err.into())
    }
}

pub type InventoryResult<T> = Result<T, InventoryError>;

pub fn ensure_positive(quantity: i32) -> InventoryResult<()> {
    if quantity > 0 {
        Ok(())
    } else {
        Err(InventoryError::InvalidQuantity(quantity))
    }
}

/// Signed change to a product's three counters. A delta is only accepted
/// when `stock == reserved + available` keeps holding after it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDelta {
    pub stock: i32,
    pub reserved: i32,
    pub available: i32,
}

impl StockDelta {
    pub fn new(stock: i32, reserved: i32, available: i32) -> Self {
        Self { stock, reserved, available }
    }

    pub fn reserve(quantity: i32) -> Self {
        Self::new(0, quantity, -quantity)
    }

    pub fn confirm(quantity: i32) -> Self {
        Self::new(-quantity, -quantity, 0)
    }

    pub fn release(quantity: i32) -> Self {
        Self::new(0, -quantity, quantity)
    }

    pub fn stock_in(quantity: i32) -> Self {
        Self::new(quantity, 0, quantity)
    }

    pub fn stock_out(quantity: i32) -> Self {
        Self::new(-quantity, 0, -quantity)
    }

    pub fn is_balanced(&self) -> bool {
        self.stock == self.reserved + self.available
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub product_id: Uuid,
    pub stock: i32,
    pub reserved_stock: i32,
    pub available_stock: i32,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl ProductStock {
    pub fn new(product_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            product_id,
            stock: 0,
            reserved_stock: 0,
            available_stock: 0,
            version: 0,
            updated_at: now,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.stock == self.reserved_stock + self.available_stock
    }

    pub fn stats(&self) -> StockStats {
        StockStats {
            stock: self.stock,
            reserved_stock: self.reserved_stock,
            available_stock: self.available_stock,
            version: self.version,
        }
    }

    /// Produces the next counters for `delta`, checked against these
    /// (current) values. The version is bumped by exactly one.
    pub fn apply(&self, delta: &StockDelta, now: DateTime<Utc>) -> InventoryResult<ProductStock> {
        let (stock, reserved_stock, available_stock) = match (
            self.stock.checked_add(delta.stock),
            self.reserved_stock.checked_add(delta.reserved),
            self.available_stock.checked_add(delta.available),
        ) {
            (Some(stock), Some(reserved), Some(available)) => (stock, reserved, available),
            _ => {
                return Err(InventoryError::StockOverflow {
                    product_id: self.product_id,
                    delta: *delta,
                })
            }
        };

        if available_stock < 0 || stock < 0 || reserved_stock < 0 {
            return Err(InventoryError::InsufficientStock {
                product_id: self.product_id,
                requested: -delta.available.min(delta.stock).min(delta.reserved),
                available: self.available_stock,
            });
        }

        Ok(ProductStock {
            product_id: self.product_id,
            stock,
            reserved_stock,
            available_stock,
            version: self.version + 1,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockStats {
    pub stock: i32,
    pub reserved_stock: i32,
    pub available_stock: i32,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Reserved,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Reserved)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ReservationStatus::Reserved),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown reservation status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub product_id: Uuid,
    pub order_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(product_id: Uuid, order_id: Uuid, quantity: i32, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id,
            order_id,
            quantity,
            status: ReservationStatus::Reserved,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Reserved && self.expires_at < now
    }

    /// Only `reserved` may move, and only to one of the terminal states.
    pub fn transition(&self, to: ReservationStatus, now: DateTime<Utc>) -> InventoryResult<Reservation> {
        if self.status.is_terminal() || to == ReservationStatus::Reserved {
            return Err(InventoryError::InvalidStateTransition {
                reservation_id: self.id,
                from: self.status,
                to,
            });
        }

        Ok(Reservation {
            status: to,
            updated_at: now,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockRecordType {
    In,
    Out,
    Reserve,
    Release,
}

impl StockRecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockRecordType::In => "in",
            StockRecordType::Out => "out",
            StockRecordType::Reserve => "reserve",
            StockRecordType::Release => "release",
        }
    }
}

impl fmt::Display for StockRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StockRecordType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(StockRecordType::In),
            "out" => Ok(StockRecordType::Out),
            "reserve" => Ok(StockRecordType::Reserve),
            "release" => Ok(StockRecordType::Release),
            other => Err(anyhow::anyhow!("unknown stock record type: {}", other)),
        }
    }
}

/// What a mutation is about, before the store knows the before/after values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub record_type: StockRecordType,
    pub order_id: Option<Uuid>,
    pub quantity: i32,
    pub reason: String,
    pub operator_id: String,
}

impl AuditEntry {
    pub fn new(record_type: StockRecordType, quantity: i32, reason: impl Into<String>, operator_id: impl Into<String>) -> Self {
        Self {
            record_type,
            order_id: None,
            quantity,
            reason: reason.into(),
            operator_id: operator_id.into(),
        }
    }

    pub fn for_order(mut self, order_id: Uuid) -> Self {
        self.order_id = Some(order_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub id: Uuid,
    pub product_id: Uuid,
    pub order_id: Option<Uuid>,
    pub record_type: StockRecordType,
    pub quantity: i32,
    pub before_stock: i32,
    pub after_stock: i32,
    pub before_available: i32,
    pub after_available: i32,
    pub version: i64,
    pub reason: String,
    pub operator_id: String,
    pub created_at: DateTime<Utc>,
}

impl StockRecord {
    pub fn capture(entry: &AuditEntry, before: &ProductStock, after: &ProductStock) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id: after.product_id,
            order_id: entry.order_id,
            record_type: entry.record_type,
            quantity: entry.quantity,
            before_stock: before.stock,
            after_stock: after.stock,
            before_available: before.available_stock,
            after_available: after.available_stock,
            version: after.version,
            reason: entry.reason.clone(),
            operator_id: entry.operator_id.clone(),
            created_at: after.updated_at,
        }
    }
}
