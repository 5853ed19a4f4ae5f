use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex};

use crate::models::BookingRow;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub events: broadcast::Sender<ServerEvent>,
    pub push: PushConfig,
    pub sweep_key: String,
    // Held across the conflict snapshot and the insert so two concurrent
    // admissions cannot both see a free slot.
    pub booking_gate: Arc<Mutex<()>>,
}

#[derive(Clone, Debug)]
pub struct PushConfig {
    pub public_key: String,
    pub private_key: String,
    pub subject: String,
}

impl PushConfig {
    pub fn enabled(&self) -> bool {
        !(self.public_key.trim().is_empty() || self.private_key.trim().is_empty())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerEvent {
    pub kind: String,
    pub booking_id: Option<String>,
    pub status: Option<String>,
    pub customer_name: Option<String>,
    pub booking_date: Option<String>,
    pub start_time: Option<String>,
    pub service: Option<String>,
    pub final_price: Option<i64>,
}

impl ServerEvent {
    pub fn from_row(kind: &str, row: &BookingRow) -> Self {
        Self {
            kind: kind.to_string(),
            booking_id: Some(row.id.clone()),
            status: Some(row.status.clone()),
            customer_name: Some(row.customer_name.clone()),
            booking_date: Some(row.booking_date.clone()),
            start_time: Some(row.start_time.clone()),
            service: Some(row.service_label()),
            final_price: Some(row.final_price),
        }
    }
}
