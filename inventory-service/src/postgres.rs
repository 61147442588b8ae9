use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::*;
use std::fmt::Display;
use tracing::debug;
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;
use crate::store::{InventoryStore, ReservationWrite, StockMutation};

pub type DbPool = Pool<AsyncPgConnection>;

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn pool_error(err: impl Display) -> InventoryError {
    InventoryError::Storage(anyhow::anyhow!("connection pool error: {}", err))
}

async fn load_product(conn: &mut AsyncPgConnection, product_id: Uuid) -> InventoryResult<Option<ProductRow>> {
    let row = products::table
        .find(product_id)
        .first::<ProductRow>(conn)
        .await
        .optional()?;
    Ok(row)
}

async fn load_reservation(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    product_id: Uuid,
) -> InventoryResult<Option<Reservation>> {
    reservations::table
        .filter(reservations::order_id.eq(order_id))
        .filter(reservations::product_id.eq(product_id))
        .first::<ReservationRow>(conn)
        .await
        .optional()?
        .map(Reservation::try_from)
        .transpose()
}

async fn apply_in_transaction(conn: &mut AsyncPgConnection, mutation: StockMutation) -> InventoryResult<ProductStock> {
    let StockMutation {
        product_id,
        delta,
        expected_version,
        entry,
        reservation,
        at,
    } = mutation;

    // Reservation row first: a racer that already moved it must show up
    // as a conflict rather than as a shortfall in the counters it drained.
    match reservation {
        Some(ReservationWrite::Insert(reservation)) => {
            let inserted = diesel::insert_into(reservations::table)
                .values(ReservationRow::from(&reservation))
                .on_conflict_do_nothing()
                .execute(conn)
                .await?;
            if inserted == 0 {
                let status = load_reservation(conn, reservation.order_id, product_id)
                    .await?
                    .map(|existing| existing.status)
                    .unwrap_or(ReservationStatus::Reserved);
                return Err(InventoryError::DuplicateReservation {
                    order_id: reservation.order_id,
                    product_id,
                    status,
                });
            }
        }
        Some(ReservationWrite::Transition { reservation_id, to, .. }) => {
            let changed = diesel::update(
                reservations::table
                    .filter(reservations::id.eq(reservation_id))
                    .filter(reservations::status.eq(ReservationStatus::Reserved.as_str())),
            )
            .set((
                reservations::status.eq(to.as_str()),
                reservations::updated_at.eq(at),
            ))
            .execute(conn)
            .await?;
            if changed == 0 {
                return Err(InventoryError::ConcurrentUpdate {
                    product_id,
                    expected_version,
                });
            }
        }
        None => {}
    }

    let conflict = InventoryError::ConcurrentUpdate {
        product_id,
        expected_version,
    };
    let before: ProductStock = load_product(conn, product_id)
        .await?
        .ok_or(InventoryError::ProductNotFound(product_id))?
        .into();
    if before.version != expected_version {
        return Err(conflict);
    }
    let after = before.apply(&delta, at)?;

    // The version guard makes the read above and this write one
    // compare-and-swap.
    let updated = diesel::update(
        products::table
            .filter(products::product_id.eq(product_id))
            .filter(products::version.eq(expected_version)),
    )
    .set((
        products::stock.eq(after.stock),
        products::reserved_stock.eq(after.reserved_stock),
        products::available_stock.eq(after.available_stock),
        products::version.eq(after.version),
        products::updated_at.eq(at),
    ))
    .execute(conn)
    .await?;
    if updated == 0 {
        return Err(conflict);
    }

    let record = StockRecord::capture(&entry, &before, &after);
    diesel::insert_into(stock_records::table)
        .values(StockRecordRow::from(&record))
        .execute(conn)
        .await?;

    debug!("Applied {:?} to product {} at version {}", delta, product_id, after.version);
    Ok(after)
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn insert_product(&self, product_id: Uuid, now: DateTime<Utc>) -> InventoryResult<ProductStock> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        diesel::insert_into(products::table)
            .values(NewProduct {
                product_id,
                stock: 0,
                reserved_stock: 0,
                available_stock: 0,
                version: 0,
                created_at: now,
                updated_at: now,
            })
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;

        load_product(&mut conn, product_id)
            .await?
            .map(ProductStock::from)
            .ok_or(InventoryError::ProductNotFound(product_id))
    }

    async fn fetch_stock(&self, product_id: Uuid) -> InventoryResult<Option<ProductStock>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        Ok(load_product(&mut conn, product_id).await?.map(ProductStock::from))
    }

    async fn apply(&self, mutation: StockMutation) -> InventoryResult<ProductStock> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        conn.transaction::<_, InventoryError, _>(|conn| {
            Box::pin(async move { apply_in_transaction(conn, mutation).await })
        })
        .await
    }

    async fn find_reservation(&self, order_id: Uuid, product_id: Uuid) -> InventoryResult<Option<Reservation>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        load_reservation(&mut conn, order_id, product_id).await
    }

    async fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> InventoryResult<Vec<Reservation>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        reservations::table
            .filter(reservations::status.eq(ReservationStatus::Reserved.as_str()))
            .filter(reservations::expires_at.lt(now))
            .order(reservations::expires_at.asc())
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .load::<ReservationRow>(&mut conn)
            .await?
            .into_iter()
            .map(Reservation::try_from)
            .collect()
    }

    async fn history(&self, product_id: Uuid, limit: usize) -> InventoryResult<Vec<StockRecord>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        stock_records::table
            .filter(stock_records::product_id.eq(product_id))
            .order(stock_records::version.desc())
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .load::<StockRecordRow>(&mut conn)
            .await?
            .into_iter()
            .map(StockRecord::try_from)
            .collect()
    }
}
