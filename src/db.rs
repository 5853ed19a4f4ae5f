use std::{fs, path::Path};

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    models::{BookingRow, STATUS_CANCELLED},
    schedule::{ExistingSlot, TimeWindow},
};

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub fn ensure_sqlite_dir(db_url: &str) -> std::io::Result<()> {
    let path = if let Some(path) = db_url.strip_prefix("sqlite://") {
        Some(path)
    } else if let Some(path) = db_url.strip_prefix("sqlite:") {
        Some(path)
    } else {
        None
    };

    let Some(path) = path else {
        return Ok(());
    };

    let path = path.split('?').next().unwrap_or(path);
    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }

    let path = path.strip_prefix("file:").unwrap_or(path);
    let db_path = Path::new(path);
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub async fn seed_defaults(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let existing = sqlx::query_as::<_, (i64,)>("SELECT id FROM services LIMIT 1")
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Ok(());
    }

    let services = vec![
        ("Gel Polish", 450, 60),
        ("Gel Polish + Design", 650, 90),
        ("Acrylic Extension", 900, 120),
        ("Manicure & Spa", 350, 45),
    ];

    for (name, price, duration) in services {
        sqlx::query(
            "INSERT INTO services (name, price, duration_minutes) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(price)
        .bind(duration)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn log_activity(
    pool: &SqlitePool,
    kind: &str,
    message: &str,
    booking_id: Option<&str>,
) {
    let _ = sqlx::query(
        r#"INSERT INTO activities (id, kind, message, created_at, booking_id)
           VALUES (?, ?, ?, ?, ?)"#,
    )
    .bind(new_id())
    .bind(kind)
    .bind(message)
    .bind(Utc::now().to_rfc3339())
    .bind(booking_id)
    .execute(pool)
    .await;
}

pub async fn fetch_booking(pool: &SqlitePool, booking_id: &str) -> Option<BookingRow> {
    sqlx::query_as::<_, BookingRow>(
        r#"SELECT b.id, b.customer_name, b.customer_phone, b.booking_date, b.start_time,
                  b.duration_minutes, b.service_id, b.manual_service, b.discount,
                  b.final_price, b.status, b.is_notified, b.created_at,
                  s.name as service_name
           FROM bookings b
           LEFT JOIN services s ON b.service_id = s.id
           WHERE b.id = ?
           LIMIT 1"#,
    )
    .bind(booking_id)
    .fetch_optional(pool)
    .await
    .unwrap_or(None)
}

// Same-day conflict snapshot: cancelled rows never block a slot, and a
// reschedule must not collide with its own previous window.
pub async fn slots_for_date(
    pool: &SqlitePool,
    date: NaiveDate,
    exclude_id: Option<&str>,
) -> Result<Vec<ExistingSlot>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (String, String, String, i64)>(
        r#"SELECT id, customer_name, start_time, duration_minutes
           FROM bookings
           WHERE booking_date = ? AND status != ? AND id != ?"#,
    )
    .bind(date.format("%Y-%m-%d").to_string())
    .bind(STATUS_CANCELLED)
    .bind(exclude_id.unwrap_or(""))
    .fetch_all(pool)
    .await?;

    let mut slots = Vec::with_capacity(rows.len());
    for (id, customer_name, start_time, duration_minutes) in rows {
        match TimeWindow::from_clock(date, &start_time, duration_minutes) {
            Ok(window) => slots.push(ExistingSlot {
                id,
                customer_name,
                window,
            }),
            Err(err) => {
                log::warn!("Skipping booking {id} with unreadable window: {err}");
            }
        }
    }
    Ok(slots)
}

#[cfg(test)]
pub mod test_support {
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    // Single connection so every query sees the same in-memory database.
    pub async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations");
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{STATUS_DONE, STATUS_PENDING};
    use crate::schedule::{admit, Admission};

    async fn insert_booking(
        pool: &SqlitePool,
        id: &str,
        date: &str,
        start: &str,
        duration: i64,
        status: &str,
    ) {
        sqlx::query(
            r#"INSERT INTO bookings
               (id, customer_name, booking_date, start_time, duration_minutes,
                final_price, status, created_at)
               VALUES (?, 'Mai', ?, ?, ?, 450, ?, '')"#,
        )
        .bind(id)
        .bind(date)
        .bind(start)
        .bind(duration)
        .bind(status)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn cancelled_rows_never_conflict() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "c1", "2024-06-01", "10:00", 60, STATUS_CANCELLED).await;

        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let slots = slots_for_date(&pool, date, None).await.unwrap();
        assert!(slots.is_empty());

        let candidate = TimeWindow::from_clock(date, "10:30", 60).unwrap();
        assert_eq!(admit(&candidate, &slots), Admission::Admitted);
    }

    #[tokio::test]
    async fn reschedule_excludes_own_row() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "b1", "2024-06-01", "10:00", 60, STATUS_PENDING).await;
        insert_booking(&pool, "b2", "2024-06-01", "12:00", 60, STATUS_DONE).await;

        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let slots = slots_for_date(&pool, date, Some("b1")).await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].id, "b2");

        // moving b1 a quarter hour later only has to clear b2
        let candidate = TimeWindow::from_clock(date, "10:15", 60).unwrap();
        assert_eq!(admit(&candidate, &slots), Admission::Admitted);
    }

    #[tokio::test]
    async fn other_dates_stay_out_of_the_snapshot() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "b1", "2024-06-01", "10:00", 60, STATUS_PENDING).await;
        insert_booking(&pool, "b2", "2024-06-02", "10:00", 60, STATUS_PENDING).await;

        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let slots = slots_for_date(&pool, date, None).await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].id, "b1");
    }
}
