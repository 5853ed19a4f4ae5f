use serde::Serialize;
use sqlx::SqlitePool;

use crate::models::{STATUS_DONE, STATUS_PENDING};

#[derive(Debug, thiserror::Error)]
pub enum FulfillError {
    #[error("booking {0} not found")]
    NotFound(String),
    #[error("booking {id} is {status}; only pending bookings can be completed")]
    InvalidStateTransition { id: String, status: String },
    #[error("recipe references missing inventory item {0}")]
    MissingItem(i64),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct Deduction {
    pub inventory_id: i64,
    pub name: String,
    pub old_quantity: i64,
    pub new_quantity: i64,
    pub below_min: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeductionReport {
    pub deductions: Vec<Deduction>,
}

// One transaction for the whole completion: the status flip and every recipe
// deduction commit together or not at all. A recipe entry pointing at a
// deleted inventory item aborts before any quantity is touched, leaving the
// booking pending for a retry after the recipe is fixed.
pub async fn complete(
    pool: &SqlitePool,
    booking_id: &str,
) -> Result<DeductionReport, FulfillError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, (String, Option<i64>)>(
        "SELECT status, service_id FROM bookings WHERE id = ? LIMIT 1",
    )
    .bind(booking_id)
    .fetch_optional(&mut *tx)
    .await?;

    let (status, service_id) = row.ok_or_else(|| FulfillError::NotFound(booking_id.to_string()))?;
    if status != STATUS_PENDING {
        return Err(FulfillError::InvalidStateTransition {
            id: booking_id.to_string(),
            status,
        });
    }

    let flipped = sqlx::query("UPDATE bookings SET status = ? WHERE id = ? AND status = ?")
        .bind(STATUS_DONE)
        .bind(booking_id)
        .bind(STATUS_PENDING)
        .execute(&mut *tx)
        .await?;
    if flipped.rows_affected() != 1 {
        return Err(FulfillError::InvalidStateTransition {
            id: booking_id.to_string(),
            status,
        });
    }

    let mut report = DeductionReport::default();

    // Manual services carry no recipe; their completion is just the flip.
    if let Some(service_id) = service_id {
        let entries = sqlx::query_as::<_, (i64, i64, Option<i64>, Option<String>, Option<i64>)>(
            r#"SELECT r.inventory_id, r.quantity_used, i.quantity, i.name, i.min_level
               FROM service_recipes r
               LEFT JOIN inventory i ON r.inventory_id = i.id
               WHERE r.service_id = ?"#,
        )
        .bind(service_id)
        .fetch_all(&mut *tx)
        .await?;

        for (inventory_id, _, quantity, _, _) in &entries {
            if quantity.is_none() {
                return Err(FulfillError::MissingItem(*inventory_id));
            }
        }

        for (inventory_id, quantity_used, quantity, name, min_level) in entries {
            let old_quantity = quantity.unwrap_or(0);
            let name = name.unwrap_or_default();
            let min_level = min_level.unwrap_or(0);
            let new_quantity = old_quantity - quantity_used;

            sqlx::query("UPDATE inventory SET quantity = quantity - ? WHERE id = ?")
                .bind(quantity_used)
                .bind(inventory_id)
                .execute(&mut *tx)
                .await?;

            if new_quantity < 0 {
                log::warn!(
                    "Inventory item {name} ({inventory_id}) driven to {new_quantity} by booking {booking_id}"
                );
            }

            report.deductions.push(Deduction {
                inventory_id,
                name,
                old_quantity,
                new_quantity,
                below_min: new_quantity <= min_level,
            });
        }
    }

    tx.commit().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;
    use crate::models::STATUS_CANCELLED;

    async fn insert_service(pool: &SqlitePool, id: i64, price: i64) {
        sqlx::query(
            "INSERT INTO services (id, name, price, duration_minutes) VALUES (?, 'Gel Polish', ?, 60)",
        )
        .bind(id)
        .bind(price)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insert_item(pool: &SqlitePool, id: i64, quantity: i64, min_level: i64) {
        sqlx::query(
            "INSERT INTO inventory (id, name, quantity, unit, min_level) VALUES (?, ?, ?, 'bottle', ?)",
        )
        .bind(id)
        .bind(format!("item {id}"))
        .bind(quantity)
        .bind(min_level)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insert_recipe(pool: &SqlitePool, service_id: i64, inventory_id: i64, used: i64) {
        sqlx::query(
            "INSERT INTO service_recipes (service_id, inventory_id, quantity_used) VALUES (?, ?, ?)",
        )
        .bind(service_id)
        .bind(inventory_id)
        .bind(used)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insert_booking(pool: &SqlitePool, id: &str, service_id: Option<i64>, status: &str) {
        sqlx::query(
            r#"INSERT INTO bookings
               (id, customer_name, booking_date, start_time, duration_minutes,
                service_id, final_price, status, created_at)
               VALUES (?, 'Mai', '2024-06-01', '15:30', 60, ?, 450, ?, '')"#,
        )
        .bind(id)
        .bind(service_id)
        .bind(status)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn item_quantity(pool: &SqlitePool, id: i64) -> i64 {
        sqlx::query_scalar("SELECT quantity FROM inventory WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn booking_status(pool: &SqlitePool, id: &str) -> String {
        sqlx::query_scalar("SELECT status FROM bookings WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn deducts_each_recipe_entry_and_flips_status() {
        let pool = test_support::pool().await;
        insert_service(&pool, 1, 450).await;
        insert_item(&pool, 10, 10, 2).await;
        insert_item(&pool, 11, 5, 2).await;
        insert_recipe(&pool, 1, 10, 2).await;
        insert_recipe(&pool, 1, 11, 1).await;
        insert_booking(&pool, "b1", Some(1), STATUS_PENDING).await;

        let report = complete(&pool, "b1").await.unwrap();
        assert_eq!(report.deductions.len(), 2);
        assert_eq!(item_quantity(&pool, 10).await, 8);
        assert_eq!(item_quantity(&pool, 11).await, 4);
        assert_eq!(booking_status(&pool, "b1").await, STATUS_DONE);

        let x = &report.deductions[0];
        assert_eq!((x.old_quantity, x.new_quantity), (10, 8));
    }

    #[tokio::test]
    async fn second_complete_is_rejected_and_leaves_stock_alone() {
        let pool = test_support::pool().await;
        insert_service(&pool, 1, 450).await;
        insert_item(&pool, 10, 10, 2).await;
        insert_recipe(&pool, 1, 10, 2).await;
        insert_booking(&pool, "b1", Some(1), STATUS_PENDING).await;

        complete(&pool, "b1").await.unwrap();
        let err = complete(&pool, "b1").await.unwrap_err();
        assert!(matches!(
            err,
            FulfillError::InvalidStateTransition { ref status, .. } if status == STATUS_DONE
        ));
        assert_eq!(item_quantity(&pool, 10).await, 8);
    }

    #[tokio::test]
    async fn no_recipe_changes_only_the_status() {
        let pool = test_support::pool().await;
        insert_service(&pool, 1, 450).await;
        insert_item(&pool, 10, 10, 2).await;
        insert_booking(&pool, "b1", Some(1), STATUS_PENDING).await;

        let report = complete(&pool, "b1").await.unwrap();
        assert!(report.deductions.is_empty());
        assert_eq!(item_quantity(&pool, 10).await, 10);
        assert_eq!(booking_status(&pool, "b1").await, STATUS_DONE);
    }

    #[tokio::test]
    async fn manual_booking_completes_without_stock_effect() {
        let pool = test_support::pool().await;
        insert_item(&pool, 10, 10, 2).await;
        insert_booking(&pool, "b1", None, STATUS_PENDING).await;

        let report = complete(&pool, "b1").await.unwrap();
        assert!(report.deductions.is_empty());
        assert_eq!(item_quantity(&pool, 10).await, 10);
    }

    #[tokio::test]
    async fn dangling_recipe_entry_rolls_back_everything() {
        let pool = test_support::pool().await;
        insert_service(&pool, 1, 450).await;
        insert_item(&pool, 10, 10, 2).await;
        insert_recipe(&pool, 1, 10, 2).await;
        insert_recipe(&pool, 1, 999, 1).await;
        insert_booking(&pool, "b1", Some(1), STATUS_PENDING).await;

        let err = complete(&pool, "b1").await.unwrap_err();
        assert!(matches!(err, FulfillError::MissingItem(999)));
        assert_eq!(booking_status(&pool, "b1").await, STATUS_PENDING);
        assert_eq!(item_quantity(&pool, 10).await, 10);
    }

    #[tokio::test]
    async fn cancelled_booking_cannot_be_completed() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "b1", None, STATUS_CANCELLED).await;

        let err = complete(&pool, "b1").await.unwrap_err();
        assert!(matches!(err, FulfillError::InvalidStateTransition { .. }));
        assert_eq!(booking_status(&pool, "b1").await, STATUS_CANCELLED);
    }

    #[tokio::test]
    async fn missing_booking_is_not_found() {
        let pool = test_support::pool().await;
        let err = complete(&pool, "nope").await.unwrap_err();
        assert!(matches!(err, FulfillError::NotFound(_)));
    }

    #[tokio::test]
    async fn deduction_may_drive_quantity_negative() {
        let pool = test_support::pool().await;
        insert_service(&pool, 1, 450).await;
        insert_item(&pool, 10, 1, 2).await;
        insert_recipe(&pool, 1, 10, 3).await;
        insert_booking(&pool, "b1", Some(1), STATUS_PENDING).await;

        let report = complete(&pool, "b1").await.unwrap();
        assert_eq!(item_quantity(&pool, 10).await, -2);
        assert!(report.deductions[0].below_min);
    }
}
