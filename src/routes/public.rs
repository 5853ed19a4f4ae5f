use actix_web::{web, HttpResponse, Result};
use chrono::{Local, NaiveDate};
use serde::Deserialize;
use serde_json::json;

use crate::{db, push::WebPushChannel, reminder, state::AppState};

// Shop hours for the public availability grid.
const SHOP_OPEN_HOUR: i64 = 10;
const SHOP_CLOSE_HOUR: i64 = 20;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/api/availability").route(web::get().to(availability)))
        .service(web::resource("/api/check-queue").route(web::get().to(check_queue)));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

#[derive(Deserialize)]
struct AvailabilityQuery {
    date: Option<String>,
}

// Hourly busy/free view for customers deciding when to message the shop.
// Informational only: admission is the authority on conflicts.
async fn availability(
    state: web::Data<AppState>,
    query: web::Query<AvailabilityQuery>,
) -> Result<HttpResponse> {
    let date = match query.date.as_deref() {
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => {
                return Ok(HttpResponse::UnprocessableEntity()
                    .json(json!({ "errors": ["date must be YYYY-MM-DD"] })));
            }
        },
        None => Local::now().date_naive(),
    };

    let taken = db::slots_for_date(&state.db, date, None)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    let busy_hours: Vec<i64> = taken
        .iter()
        .map(|slot| slot.window.start_minute() / 60)
        .collect();

    let slots: Vec<serde_json::Value> = (SHOP_OPEN_HOUR..=SHOP_CLOSE_HOUR)
        .map(|hour| {
            json!({
                "time": format!("{hour:02}:00"),
                "busy": busy_hours.contains(&hour),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "date": date.format("%Y-%m-%d").to_string(),
        "slots": slots,
    })))
}

#[derive(Deserialize)]
struct SweepQuery {
    key: Option<String>,
}

// External trigger for the reminder scanner; a cron job or a manual visit.
async fn check_queue(
    state: web::Data<AppState>,
    query: web::Query<SweepQuery>,
) -> Result<HttpResponse> {
    if state.sweep_key.is_empty() || query.key.as_deref() != Some(state.sweep_key.as_str()) {
        return Ok(HttpResponse::Unauthorized().json(json!({ "error": "invalid key" })));
    }

    let channel = WebPushChannel {
        db: state.db.clone(),
        config: state.push.clone(),
    };
    let report = reminder::sweep(&state.db, &channel, Local::now().naive_local())
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("dispatched {} reminders", report.dispatched.len()),
        "report": report,
    })))
}
