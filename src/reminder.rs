use async_trait::async_trait;
use chrono::{NaiveDateTime, Timelike};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::models::STATUS_PENDING;
use crate::schedule;

pub const DUE_WINDOW_MIN: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no push subscriptions registered")]
    NoSubscribers,
    #[error("push delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Reminder {
    pub booking_id: String,
    pub customer_name: String,
    pub start_clock: String,
    pub service_label: String,
    pub minutes_until: i64,
}

#[async_trait]
pub trait ReminderChannel: Send + Sync {
    async fn dispatch(&self, reminder: &Reminder) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub booking_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub dispatched: Vec<String>,
    pub failed: Vec<SweepFailure>,
    // Already past their start minute with no reminder sent: the trigger
    // cadence was coarser than the due window. Reported, not repaired.
    pub missed: Vec<String>,
}

pub fn is_due(minutes_until: i64) -> bool {
    (0..=DUE_WINDOW_MIN).contains(&minutes_until)
}

// One invocation of the reminder scanner. Safe to re-enter: the notified
// flag is claimed with a compare-and-set before dispatch, so an overlapping
// sweep skips anything already claimed; a failed dispatch releases the claim
// for the next sweep to retry. One booking failing never stops the rest.
pub async fn sweep(
    pool: &SqlitePool,
    channel: &dyn ReminderChannel,
    now: NaiveDateTime,
) -> Result<SweepReport, sqlx::Error> {
    let today = now.date().format("%Y-%m-%d").to_string();
    let now_minute = i64::from(now.time().hour()) * 60 + i64::from(now.time().minute());

    let rows = sqlx::query_as::<_, (String, String, String, Option<String>, Option<String>)>(
        r#"SELECT b.id, b.customer_name, b.start_time, b.manual_service, s.name
           FROM bookings b
           LEFT JOIN services s ON b.service_id = s.id
           WHERE b.booking_date = ? AND b.status = ? AND b.is_notified = 0"#,
    )
    .bind(&today)
    .bind(STATUS_PENDING)
    .fetch_all(pool)
    .await?;

    let mut report = SweepReport::default();

    for (id, customer_name, start_time, manual_service, service_name) in rows {
        let start_minute = match schedule::parse_clock(&start_time) {
            Ok(minute) => minute,
            Err(err) => {
                log::warn!("Skipping booking {id} with unreadable start time: {err}");
                continue;
            }
        };

        let minutes_until = start_minute - now_minute;
        if minutes_until < 0 {
            log::warn!(
                "Booking {id} passed its start {start_time} without a reminder (now {now_minute})"
            );
            report.missed.push(id);
            continue;
        }
        if !is_due(minutes_until) {
            continue;
        }

        let claimed = sqlx::query(
            "UPDATE bookings SET is_notified = 1 WHERE id = ? AND is_notified = 0",
        )
        .bind(&id)
        .execute(pool)
        .await?;
        if claimed.rows_affected() == 0 {
            continue;
        }

        let reminder = Reminder {
            booking_id: id.clone(),
            customer_name,
            start_clock: schedule::format_clock(start_minute),
            service_label: manual_service
                .filter(|label| !label.trim().is_empty())
                .or(service_name)
                .unwrap_or_else(|| "-".to_string()),
            minutes_until,
        };

        match channel.dispatch(&reminder).await {
            Ok(()) => {
                log::info!(
                    "Reminded {} ({} min before {})",
                    reminder.customer_name,
                    minutes_until,
                    reminder.start_clock
                );
                report.dispatched.push(id);
            }
            Err(err) => {
                sqlx::query("UPDATE bookings SET is_notified = 0 WHERE id = ?")
                    .bind(&id)
                    .execute(pool)
                    .await?;
                log::warn!("Reminder dispatch failed for {id}: {err}");
                report.failed.push(SweepFailure {
                    booking_id: id,
                    error: err.to_string(),
                });
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;
    use crate::models::{STATUS_CANCELLED, STATUS_DONE};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    struct RecordingChannel {
        sent: Mutex<Vec<Reminder>>,
        fail: bool,
    }

    impl RecordingChannel {
        fn new(fail: bool) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail,
            }
        }

        fn sent_ids(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.booking_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ReminderChannel for RecordingChannel {
        async fn dispatch(&self, reminder: &Reminder) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::Delivery("boom".to_string()));
            }
            self.sent.lock().unwrap().push(reminder.clone());
            Ok(())
        }
    }

    async fn insert_booking(pool: &SqlitePool, id: &str, start: &str, status: &str) {
        sqlx::query(
            r#"INSERT INTO bookings
               (id, customer_name, booking_date, start_time, duration_minutes,
                manual_service, final_price, status, created_at)
               VALUES (?, 'Mai', '2024-06-01', ?, 60, 'Gel Polish', 450, ?, '')"#,
        )
        .bind(id)
        .bind(start)
        .bind(status)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn notified(pool: &SqlitePool, id: &str) -> i64 {
        sqlx::query_scalar("SELECT is_notified FROM bookings WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn due_window_is_inclusive_both_ends() {
        assert!(is_due(0));
        assert!(is_due(25));
        assert!(is_due(30));
        assert!(!is_due(31));
        assert!(!is_due(60));
        assert!(!is_due(-1));
    }

    #[tokio::test]
    async fn dispatches_a_due_booking_once() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "b1", "15:30", STATUS_PENDING).await;
        let channel = RecordingChannel::new(false);

        // 15:05 -> 25 minutes out, due
        let report = sweep(&pool, &channel, at(15, 5)).await.unwrap();
        assert_eq!(report.dispatched, vec!["b1".to_string()]);
        assert_eq!(notified(&pool, "b1").await, 1);

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[0].start_clock, "15:30");
        assert_eq!(sent[0].service_label, "Gel Polish");
        assert_eq!(sent[0].minutes_until, 25);
    }

    #[tokio::test]
    async fn repeated_sweep_does_not_double_dispatch() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "b1", "15:30", STATUS_PENDING).await;
        let channel = RecordingChannel::new(false);

        sweep(&pool, &channel, at(15, 5)).await.unwrap();
        let second = sweep(&pool, &channel, at(15, 5)).await.unwrap();
        assert!(second.dispatched.is_empty());
        assert_eq!(channel.sent_ids(), vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn an_hour_early_is_not_due() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "b1", "15:30", STATUS_PENDING).await;
        let channel = RecordingChannel::new(false);

        // 14:30 -> 60 minutes out
        let report = sweep(&pool, &channel, at(14, 30)).await.unwrap();
        assert!(report.dispatched.is_empty());
        assert_eq!(notified(&pool, "b1").await, 0);
    }

    #[tokio::test]
    async fn failed_dispatch_releases_the_claim_for_retry() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "b1", "15:30", STATUS_PENDING).await;

        let failing = RecordingChannel::new(true);
        let report = sweep(&pool, &failing, at(15, 5)).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(notified(&pool, "b1").await, 0);

        let working = RecordingChannel::new(false);
        let report = sweep(&pool, &working, at(15, 10)).await.unwrap();
        assert_eq!(report.dispatched, vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_rest() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "b1", "15:20", STATUS_PENDING).await;
        insert_booking(&pool, "b2", "15:30", STATUS_PENDING).await;

        struct FirstFails {
            seen: Mutex<usize>,
        }

        #[async_trait]
        impl ReminderChannel for FirstFails {
            async fn dispatch(&self, _reminder: &Reminder) -> Result<(), DispatchError> {
                let mut seen = self.seen.lock().unwrap();
                *seen += 1;
                if *seen == 1 {
                    Err(DispatchError::Delivery("boom".to_string()))
                } else {
                    Ok(())
                }
            }
        }

        let channel = FirstFails {
            seen: Mutex::new(0),
        };
        let report = sweep(&pool, &channel, at(15, 5)).await.unwrap();
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn done_and_cancelled_are_ignored() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "b1", "15:30", STATUS_DONE).await;
        insert_booking(&pool, "b2", "15:30", STATUS_CANCELLED).await;
        let channel = RecordingChannel::new(false);

        let report = sweep(&pool, &channel, at(15, 5)).await.unwrap();
        assert!(report.dispatched.is_empty());
        assert!(channel.sent_ids().is_empty());
    }

    #[tokio::test]
    async fn passed_start_is_reported_missed() {
        let pool = test_support::pool().await;
        insert_booking(&pool, "b1", "08:00", STATUS_PENDING).await;
        let channel = RecordingChannel::new(false);

        let report = sweep(&pool, &channel, at(9, 0)).await.unwrap();
        assert_eq!(report.missed, vec!["b1".to_string()]);
        assert!(report.dispatched.is_empty());
        assert_eq!(notified(&pool, "b1").await, 0);
    }

    #[tokio::test]
    async fn other_days_are_out_of_scope() {
        let pool = test_support::pool().await;
        sqlx::query(
            r#"INSERT INTO bookings
               (id, customer_name, booking_date, start_time, duration_minutes,
                final_price, status, created_at)
               VALUES ('b1', 'Mai', '2024-06-02', '15:30', 60, 450, 'pending', '')"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        let channel = RecordingChannel::new(false);

        let report = sweep(&pool, &channel, at(15, 5)).await.unwrap();
        assert!(report.dispatched.is_empty());
        assert!(report.missed.is_empty());
    }
}
