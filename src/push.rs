use async_trait::async_trait;
use serde::Deserialize;
use sqlx::SqlitePool;
use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder, URL_SAFE_NO_PAD,
};

use crate::{
    db::new_id,
    models::BookingRow,
    reminder::{DispatchError, Reminder, ReminderChannel},
    state::PushConfig,
};

#[derive(Debug, Deserialize)]
pub struct PushSubscriptionInput {
    pub endpoint: String,
    pub keys: PushKeys,
}

#[derive(Debug, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PushSubscriptionRow {
    endpoint: String,
    p256dh: String,
    auth: String,
}

// Operator devices register here; reminders and shop summaries go to all of
// them.
pub async fn store_subscription(
    pool: &SqlitePool,
    subscription: &PushSubscriptionInput,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO push_subscriptions (id, endpoint, p256dh, auth, created_at)
           VALUES (?, ?, ?, ?, ?)
           ON CONFLICT(endpoint) DO UPDATE SET
             p256dh = excluded.p256dh,
             auth = excluded.auth"#,
    )
    .bind(new_id())
    .bind(&subscription.endpoint)
    .bind(&subscription.keys.p256dh)
    .bind(&subscription.keys.auth)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct WebPushChannel {
    pub db: SqlitePool,
    pub config: PushConfig,
}

impl WebPushChannel {
    pub async fn broadcast(&self, payload: &serde_json::Value) -> Result<usize, DispatchError> {
        if !self.config.enabled() {
            return Err(DispatchError::Delivery(
                "push channel not configured".to_string(),
            ));
        }

        let rows = sqlx::query_as::<_, PushSubscriptionRow>(
            "SELECT endpoint, p256dh, auth FROM push_subscriptions",
        )
        .fetch_all(&self.db)
        .await
        .map_err(|err| DispatchError::Delivery(err.to_string()))?;

        if rows.is_empty() {
            return Err(DispatchError::NoSubscribers);
        }

        let body = payload.to_string();
        let mut delivered = 0;
        for row in rows {
            match send_push(&self.config, row, &body).await {
                Ok(()) => delivered += 1,
                Err(err) => log::warn!("Push send failed: {err}"),
            }
        }

        if delivered == 0 {
            return Err(DispatchError::Delivery(
                "no subscription accepted the message".to_string(),
            ));
        }
        Ok(delivered)
    }
}

#[async_trait]
impl ReminderChannel for WebPushChannel {
    async fn dispatch(&self, reminder: &Reminder) -> Result<(), DispatchError> {
        self.broadcast(&reminder_payload(reminder)).await.map(|_| ())
    }
}

pub fn reminder_payload(reminder: &Reminder) -> serde_json::Value {
    serde_json::json!({
        "title": format!("Upcoming queue in {} min", reminder.minutes_until),
        "body": format!(
            "{} at {} — {}",
            reminder.customer_name, reminder.start_clock, reminder.service_label
        ),
        "url": format!("/api/bookings/{}", reminder.booking_id)
    })
}

pub fn open_shop_payload(
    date_label: &str,
    bookings: &[BookingRow],
    expected_income: i64,
) -> serde_json::Value {
    let lines: Vec<String> = if bookings.is_empty() {
        vec!["(no queue booked today)".to_string()]
    } else {
        bookings
            .iter()
            .map(|b| format!("{} {} — {}", b.start_time, b.customer_name, b.service_label()))
            .collect()
    };

    serde_json::json!({
        "title": format!("Today's queue · {date_label}"),
        "body": format!(
            "{}\n{} bookings, expected ฿{}",
            lines.join("\n"),
            bookings.len(),
            expected_income
        ),
        "url": "/api/bookings"
    })
}

pub fn close_shop_payload(
    date_label: &str,
    income: i64,
    done_count: i64,
    cancelled_count: i64,
) -> serde_json::Value {
    serde_json::json!({
        "title": format!("Closing summary · {date_label}"),
        "body": format!(
            "฿{income} earned · {done_count} done · {cancelled_count} cancelled"
        ),
        "url": "/api/dashboard"
    })
}

async fn send_push(
    config: &PushConfig,
    row: PushSubscriptionRow,
    payload: &str,
) -> Result<(), WebPushError> {
    let subscription = SubscriptionInfo::new(row.endpoint, row.p256dh, row.auth);
    let mut builder = WebPushMessageBuilder::new(&subscription);
    builder.set_payload(ContentEncoding::Aes128Gcm, payload.as_bytes());

    let mut vapid_builder =
        VapidSignatureBuilder::from_base64(&config.private_key, URL_SAFE_NO_PAD, &subscription)?;
    vapid_builder.add_claim("sub", config.subject.clone());

    builder.set_vapid_signature(vapid_builder.build()?);

    let client = IsahcWebPushClient::new()?;
    client.send(builder.build()?).await?;
    Ok(())
}
