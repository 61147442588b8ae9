use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::*;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::products)]
pub struct ProductRow {
    pub product_id: Uuid,
    pub stock: i32,
    pub reserved_stock: i32,
    pub available_stock: i32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::products)]
pub struct NewProduct {
    pub product_id: Uuid,
    pub stock: i32,
    pub reserved_stock: i32,
    pub available_stock: i32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProductRow> for ProductStock {
    fn from(row: ProductRow) -> Self {
        ProductStock {
            product_id: row.product_id,
            stock: row.stock,
            reserved_stock: row.reserved_stock,
            available_stock: row.available_stock,
            version: row.version,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct ReservationRow {
    pub id: Uuid,
    pub product_id: Uuid,
    pub order_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Reservation> for ReservationRow {
    fn from(reservation: &Reservation) -> Self {
        ReservationRow {
            id: reservation.id,
            product_id: reservation.product_id,
            order_id: reservation.order_id,
            quantity: reservation.quantity,
            status: reservation.status.as_str().to_string(),
            expires_at: reservation.expires_at,
            created_at: reservation.created_at,
            updated_at: reservation.updated_at,
        }
    }
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = InventoryError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Reservation {
            id: row.id,
            product_id: row.product_id,
            order_id: row.order_id,
            quantity: row.quantity,
            status: row.status.parse()?,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::stock_records)]
pub struct StockRecordRow {
    pub id: Uuid,
    pub product_id: Uuid,
    pub order_id: Option<Uuid>,
    pub record_type: String,
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

impl From<&StockRecord> for StockRecordRow {
    fn from(record: &StockRecord) -> Self {
        StockRecordRow {
            id: record.id,
            product_id: record.product_id,
            order_id: record.order_id,
            record_type: record.record_type.as_str().to_string(),
            quantity: record.quantity,
            before_stock: record.before_stock,
            after_stock: record.after_stock,
            before_available: record.before_available,
            after_available: record.after_available,
            version: record.version,
            reason: record.reason.clone(),
            operator_id: record.operator_id.clone(),
            created_at: record.created_at,
        }
    }
}

impl TryFrom<StockRecordRow> for StockRecord {
    type Error = InventoryError;

    fn try_from(row: StockRecordRow) -> Result<Self, Self::Error> {
        Ok(StockRecord {
            id: row.id,
            product_id: row.product_id,
            order_id: row.order_id,
            record_type: row.record_type.parse()?,
            quantity: row.quantity,
            before_stock: row.before_stock,
            after_stock: row.after_stock,
            before_available: row.before_available,
            after_available: row.after_available,
            version: row.version,
            reason: row.reason,
            operator_id: row.operator_id,
            created_at: row.created_at,
        })
    }
}
