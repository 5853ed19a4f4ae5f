use actix_web::{web, HttpResponse, Result};
use chrono::{Days, Local, NaiveDate};
use serde::Deserialize;
use serde_json::json;

use crate::{
    db::{fetch_booking, log_activity, new_id, slots_for_date},
    fulfill::{self, FulfillError},
    models::{
        promotion_discount, InventoryItemRow, PromotionRow, ServiceKind, ServiceRow,
        DISCOUNT_AMOUNT, DISCOUNT_PERCENT, STATUS_CANCELLED, STATUS_DONE, STATUS_PENDING,
    },
    push::{self, PushSubscriptionInput, WebPushChannel},
    schedule::{self, Admission, ConflictPolicy, TimeWindow, DEFAULT_DURATION_MIN},
    state::{AppState, ServerEvent},
};

#[derive(Deserialize)]
struct BookingCreateForm {
    customer_name: String,
    customer_phone: Option<String>,
    facebook: Option<String>,
    booking_date: String,
    start_time: String,
    service_id: Option<i64>,
    duration_adj: Option<i64>,
    manual_service: Option<String>,
    price: Option<i64>,
    duration_minutes: Option<i64>,
    discount: Option<i64>,
    promotion_id: Option<i64>,
    allow_overlap: Option<bool>,
}

#[derive(Deserialize)]
struct BookingUpdateForm {
    booking_date: Option<String>,
    start_time: Option<String>,
    duration_minutes: Option<i64>,
    manual_service: Option<String>,
    final_price: Option<i64>,
    allow_overlap: Option<bool>,
}

#[derive(Deserialize)]
struct BookingFilter {
    date: Option<String>,
    status: Option<String>,
}

#[derive(Deserialize)]
struct InventoryCreateForm {
    name: String,
    quantity: Option<i64>,
    unit: Option<String>,
    min_level: Option<i64>,
}

#[derive(Deserialize)]
struct AdjustForm {
    delta: i64,
}

#[derive(Deserialize)]
struct ServiceForm {
    name: String,
    price: i64,
    duration_minutes: Option<i64>,
}

#[derive(Deserialize)]
struct RecipeInput {
    inventory_id: i64,
    quantity_used: i64,
}

#[derive(Deserialize)]
struct PromotionCreateForm {
    name: String,
    discount_type: String,
    value: i64,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/bookings")
            .route(web::get().to(list_bookings))
            .route(web::post().to(create_booking)),
    )
    .service(
        web::resource("/api/bookings/{id}")
            .route(web::get().to(get_booking))
            .route(web::put().to(update_booking))
            .route(web::delete().to(delete_booking)),
    )
    .service(web::resource("/api/bookings/{id}/cancel").route(web::post().to(cancel_booking)))
    .service(web::resource("/api/bookings/{id}/complete").route(web::post().to(complete_booking)))
    .service(web::resource("/api/dashboard").route(web::get().to(dashboard)))
    .service(
        web::resource("/api/inventory")
            .route(web::get().to(list_inventory))
            .route(web::post().to(create_inventory_item)),
    )
    .service(web::resource("/api/inventory/{id}/adjust").route(web::post().to(adjust_inventory)))
    .service(
        web::resource("/api/services")
            .route(web::get().to(list_services))
            .route(web::post().to(create_service)),
    )
    .service(
        web::resource("/api/services/{id}")
            .route(web::put().to(update_service))
            .route(web::delete().to(delete_service)),
    )
    .service(
        web::resource("/api/services/{id}/recipes")
            .route(web::get().to(get_recipes))
            .route(web::put().to(put_recipes)),
    )
    .service(
        web::resource("/api/promotions")
            .route(web::get().to(list_promotions))
            .route(web::post().to(create_promotion)),
    )
    .service(web::resource("/api/promotions/{id}").route(web::delete().to(delete_promotion)))
    .service(web::resource("/api/promotions/{id}/toggle").route(web::post().to(toggle_promotion)))
    .service(web::resource("/api/customers").route(web::get().to(list_customers)))
    .service(web::resource("/api/shop/open").route(web::post().to(open_shop)))
    .service(web::resource("/api/shop/close").route(web::post().to(close_shop)))
    .service(web::resource("/api/subscriptions").route(web::post().to(register_subscription)));
}

fn unprocessable(errors: Vec<String>) -> HttpResponse {
    HttpResponse::UnprocessableEntity().json(json!({ "errors": errors }))
}

const BOOKING_SELECT: &str = r#"SELECT b.id, b.customer_name, b.customer_phone, b.booking_date,
       b.start_time, b.duration_minutes, b.service_id, b.manual_service, b.discount,
       b.final_price, b.status, b.is_notified, b.created_at, s.name as service_name
  FROM bookings b
  LEFT JOIN services s ON b.service_id = s.id"#;

async fn create_booking(
    state: web::Data<AppState>,
    payload: web::Json<BookingCreateForm>,
) -> Result<HttpResponse> {
    let form = payload.into_inner();
    let mut errors = Vec::new();

    if form.customer_name.trim().is_empty() {
        errors.push("Customer name is required.".to_string());
    }

    let date = match NaiveDate::parse_from_str(&form.booking_date, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(_) => {
            errors.push("Booking date must be YYYY-MM-DD.".to_string());
            None
        }
    };

    let manual_label = form
        .manual_service
        .as_deref()
        .map(str::trim)
        .filter(|label| !label.is_empty());
    let kind = if let Some(service_id) = form.service_id {
        Some(ServiceKind::Catalog { id: service_id })
    } else if let Some(label) = manual_label {
        match form.price {
            Some(price) if price >= 0 => Some(ServiceKind::Manual {
                label: label.to_string(),
                price,
                duration_minutes: form.duration_minutes.unwrap_or(DEFAULT_DURATION_MIN),
            }),
            _ => {
                errors.push("A manual service needs an explicit non-negative price.".to_string());
                None
            }
        }
    } else {
        errors.push("Pick a catalog service or enter a manual service.".to_string());
        None
    };

    if !errors.is_empty() {
        return Ok(unprocessable(errors));
    }
    let (Some(date), Some(kind)) = (date, kind) else {
        return Ok(unprocessable(vec!["Invalid booking request.".to_string()]));
    };

    let (service_id, manual_service, price, duration) = match kind {
        ServiceKind::Catalog { id } => {
            let service = sqlx::query_as::<_, ServiceRow>(
                "SELECT id, name, price, duration_minutes FROM services WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&state.db)
            .await
            .map_err(actix_web::error::ErrorInternalServerError)?;

            let Some(service) = service else {
                return Ok(unprocessable(vec![format!("Unknown service {id}.")]));
            };
            (
                Some(id),
                None,
                service.price,
                service.duration_minutes + form.duration_adj.unwrap_or(0),
            )
        }
        ServiceKind::Manual {
            label,
            price,
            duration_minutes,
        } => (None, Some(label), price, duration_minutes),
    };

    let discount = if let Some(promotion_id) = form.promotion_id {
        let promo = sqlx::query_as::<_, PromotionRow>(
            "SELECT id, name, discount_type, value, is_active FROM promotions WHERE id = ?",
        )
        .bind(promotion_id)
        .fetch_optional(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

        let Some(promo) = promo else {
            return Ok(unprocessable(vec![format!(
                "Unknown promotion {promotion_id}."
            )]));
        };
        promotion_discount(price, &promo)
    } else {
        form.discount.unwrap_or(0)
    };
    if discount < 0 {
        return Ok(unprocessable(vec!["Discount cannot be negative.".to_string()]));
    }
    let final_price = (price - discount).max(0);

    let window = match TimeWindow::from_clock(date, &form.start_time, duration) {
        Ok(window) => window,
        Err(err) => return Ok(unprocessable(vec![err.to_string()])),
    };

    let policy = if form.allow_overlap.unwrap_or(false) {
        ConflictPolicy::AllowOverlap
    } else {
        ConflictPolicy::Reject
    };

    // Snapshot and insert under the gate so parallel requests cannot both
    // claim the same slot.
    let gate = state.booking_gate.lock().await;
    let slots = slots_for_date(&state.db, date, None)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    let mut warning = None;
    if let Admission::Conflict(info) = schedule::admit(&window, &slots) {
        match policy {
            ConflictPolicy::Reject => {
                return Ok(HttpResponse::Conflict().json(json!({
                    "error": "Time window conflicts with an existing booking.",
                    "conflict": {
                        "booking_id": info.booking_id,
                        "customer_name": info.customer_name,
                        "range": info.range,
                    },
                    "hint": "Pass allow_overlap=true to book over it anyway.",
                })));
            }
            ConflictPolicy::AllowOverlap => {
                warning = Some(json!({
                    "message": "Booked over an existing appointment.",
                    "conflict": {
                        "booking_id": info.booking_id,
                        "customer_name": info.customer_name,
                        "range": info.range,
                    },
                }));
            }
        }
    }

    upsert_customer(
        &state,
        form.customer_name.trim(),
        form.customer_phone.as_deref(),
        form.facebook.as_deref(),
    )
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    let booking_id = new_id();
    sqlx::query(
        r#"INSERT INTO bookings
           (id, customer_name, customer_phone, booking_date, start_time, duration_minutes,
            service_id, manual_service, discount, final_price, status, is_notified, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)"#,
    )
    .bind(&booking_id)
    .bind(form.customer_name.trim())
    .bind(form.customer_phone.as_deref())
    .bind(date.format("%Y-%m-%d").to_string())
    .bind(window.format_start())
    .bind(duration)
    .bind(service_id)
    .bind(manual_service.as_deref())
    .bind(discount)
    .bind(final_price)
    .bind(STATUS_PENDING)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;
    drop(gate);

    log_activity(
        &state.db,
        "booking_created",
        &format!(
            "New booking for {} at {} {}.",
            form.customer_name.trim(),
            form.booking_date,
            window.format_start()
        ),
        Some(&booking_id),
    )
    .await;

    let row = fetch_booking(&state.db, &booking_id).await;
    if let Some(row) = &row {
        let _ = state.events.send(ServerEvent::from_row("booking_created", row));
    }

    Ok(HttpResponse::Created().json(json!({ "booking": row, "warning": warning })))
}

async fn list_bookings(
    state: web::Data<AppState>,
    query: web::Query<BookingFilter>,
) -> Result<HttpResponse> {
    let mut sql = format!("{BOOKING_SELECT} WHERE 1 = 1");
    if query.date.is_some() {
        sql.push_str(" AND b.booking_date = ?");
    }
    if query.status.is_some() {
        sql.push_str(" AND b.status = ?");
    }
    sql.push_str(" ORDER BY b.booking_date, b.start_time");

    let mut rows = sqlx::query_as::<_, crate::models::BookingRow>(&sql);
    if let Some(date) = &query.date {
        rows = rows.bind(date);
    }
    if let Some(status) = &query.status {
        rows = rows.bind(status);
    }
    let bookings = rows
        .fetch_all(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(json!({ "bookings": bookings })))
}

async fn get_booking(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    match fetch_booking(&state.db, &path.into_inner()).await {
        Some(row) => Ok(HttpResponse::Ok().json(json!({ "booking": row }))),
        None => Ok(HttpResponse::NotFound().json(json!({ "error": "Booking not found." }))),
    }
}

async fn update_booking(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<BookingUpdateForm>,
) -> Result<HttpResponse> {
    let booking_id = path.into_inner();
    let form = payload.into_inner();

    let Some(row) = fetch_booking(&state.db, &booking_id).await else {
        return Ok(HttpResponse::NotFound().json(json!({ "error": "Booking not found." })));
    };
    if row.status != STATUS_PENDING {
        return Ok(HttpResponse::Conflict().json(json!({
            "error": format!("Booking is {}; finished bookings are locked.", row.status),
        })));
    }

    let date_raw = form.booking_date.as_deref().unwrap_or(&row.booking_date);
    let date = match NaiveDate::parse_from_str(date_raw, "%Y-%m-%d") {
        Ok(date) => date,
        Err(_) => return Ok(unprocessable(vec!["Booking date must be YYYY-MM-DD.".to_string()])),
    };
    let start = form.start_time.as_deref().unwrap_or(&row.start_time);
    let duration = form.duration_minutes.unwrap_or(row.duration_minutes);

    let window = match TimeWindow::from_clock(date, start, duration) {
        Ok(window) => window,
        Err(err) => return Ok(unprocessable(vec![err.to_string()])),
    };

    let rescheduling = form.booking_date.is_some()
        || form.start_time.is_some()
        || form.duration_minutes.is_some();
    let policy = if form.allow_overlap.unwrap_or(false) {
        ConflictPolicy::AllowOverlap
    } else {
        ConflictPolicy::Reject
    };

    let gate = state.booking_gate.lock().await;
    let mut warning = None;
    if rescheduling {
        // The booking's own current window must not block its move.
        let slots = slots_for_date(&state.db, date, Some(&booking_id))
            .await
            .map_err(actix_web::error::ErrorInternalServerError)?;
        if let Admission::Conflict(info) = schedule::admit(&window, &slots) {
            match policy {
                ConflictPolicy::Reject => {
                    return Ok(HttpResponse::Conflict().json(json!({
                        "error": "New time window conflicts with an existing booking.",
                        "conflict": {
                            "booking_id": info.booking_id,
                            "customer_name": info.customer_name,
                            "range": info.range,
                        },
                        "hint": "Pass allow_overlap=true to move it anyway.",
                    })));
                }
                ConflictPolicy::AllowOverlap => {
                    warning = Some(json!({
                        "message": "Rescheduled over an existing appointment.",
                        "conflict": {
                            "booking_id": info.booking_id,
                            "customer_name": info.customer_name,
                            "range": info.range,
                        },
                    }));
                }
            }
        }
    }

    let manual_service = form
        .manual_service
        .as_deref()
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .or(row.manual_service.clone());
    let final_price = form.final_price.unwrap_or(row.final_price);
    if final_price < 0 {
        return Ok(unprocessable(vec!["Price cannot be negative.".to_string()]));
    }

    let updated = sqlx::query(
        r#"UPDATE bookings
           SET booking_date = ?, start_time = ?, duration_minutes = ?,
               manual_service = ?, final_price = ?
           WHERE id = ? AND status = ?"#,
    )
    .bind(date.format("%Y-%m-%d").to_string())
    .bind(window.format_start())
    .bind(duration)
    .bind(manual_service.as_deref())
    .bind(final_price)
    .bind(&booking_id)
    .bind(STATUS_PENDING)
    .execute(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;
    drop(gate);

    if updated.rows_affected() == 0 {
        return Ok(HttpResponse::Conflict().json(json!({
            "error": "Booking changed state while editing; reload and retry.",
        })));
    }

    log_activity(
        &state.db,
        "booking_updated",
        &format!("Booking {booking_id} updated."),
        Some(&booking_id),
    )
    .await;

    let row = fetch_booking(&state.db, &booking_id).await;
    if let Some(row) = &row {
        let _ = state.events.send(ServerEvent::from_row("booking_updated", row));
    }

    Ok(HttpResponse::Ok().json(json!({ "booking": row, "warning": warning })))
}

async fn cancel_booking(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let booking_id = path.into_inner();

    let cancelled = sqlx::query("UPDATE bookings SET status = ? WHERE id = ? AND status = ?")
        .bind(STATUS_CANCELLED)
        .bind(&booking_id)
        .bind(STATUS_PENDING)
        .execute(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    if cancelled.rows_affected() == 0 {
        return match fetch_booking(&state.db, &booking_id).await {
            None => Ok(HttpResponse::NotFound().json(json!({ "error": "Booking not found." }))),
            Some(row) => Ok(HttpResponse::Conflict().json(json!({
                "error": format!("Booking is {}; only pending bookings can be cancelled.", row.status),
            }))),
        };
    }

    log_activity(
        &state.db,
        "booking_cancelled",
        &format!("Booking {booking_id} cancelled."),
        Some(&booking_id),
    )
    .await;

    let row = fetch_booking(&state.db, &booking_id).await;
    if let Some(row) = &row {
        let _ = state.events.send(ServerEvent::from_row("booking_cancelled", row));
    }

    Ok(HttpResponse::Ok().json(json!({ "booking": row })))
}

async fn complete_booking(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let booking_id = path.into_inner();

    let report = match fulfill::complete(&state.db, &booking_id).await {
        Ok(report) => report,
        Err(FulfillError::NotFound(_)) => {
            return Ok(HttpResponse::NotFound().json(json!({ "error": "Booking not found." })));
        }
        Err(err @ FulfillError::InvalidStateTransition { .. }) => {
            return Ok(HttpResponse::Conflict().json(json!({ "error": err.to_string() })));
        }
        Err(err @ FulfillError::MissingItem(_)) => {
            return Ok(HttpResponse::Conflict().json(json!({
                "error": err.to_string(),
                "hint": "Fix the service recipe, nothing was deducted.",
            })));
        }
        Err(FulfillError::Db(err)) => {
            return Err(actix_web::error::ErrorInternalServerError(err));
        }
    };

    log_activity(
        &state.db,
        "booking_completed",
        &format!(
            "Booking {booking_id} completed, {} stock deductions.",
            report.deductions.len()
        ),
        Some(&booking_id),
    )
    .await;

    let row = fetch_booking(&state.db, &booking_id).await;
    if let Some(row) = &row {
        let _ = state.events.send(ServerEvent::from_row("booking_completed", row));
    }

    Ok(HttpResponse::Ok().json(json!({ "booking": row, "report": report })))
}

// Deletion is unconditional: any state, record destroyed.
async fn delete_booking(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let booking_id = path.into_inner();
    let Some(row) = fetch_booking(&state.db, &booking_id).await else {
        return Ok(HttpResponse::NotFound().json(json!({ "error": "Booking not found." })));
    };

    sqlx::query("DELETE FROM bookings WHERE id = ?")
        .bind(&booking_id)
        .execute(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    log_activity(
        &state.db,
        "booking_deleted",
        &format!("Booking {booking_id} deleted."),
        Some(&booking_id),
    )
    .await;
    let _ = state.events.send(ServerEvent::from_row("booking_deleted", &row));

    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

fn calc_growth(current: i64, previous: i64) -> i64 {
    if previous == 0 {
        return if current > 0 { 100 } else { 0 };
    }
    ((current - previous) * 100) / previous
}

async fn dashboard(state: web::Data<AppState>) -> Result<HttpResponse> {
    let today = Local::now().date_naive();
    let yesterday = today - Days::new(1);
    let today_str = today.format("%Y-%m-%d").to_string();
    let yesterday_str = yesterday.format("%Y-%m-%d").to_string();
    let month_like = format!("{}-%", today.format("%Y-%m"));

    let queue: i64 = count_where(&state, "booking_date = ?", &today_str).await;
    let completed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bookings WHERE booking_date = ? AND status = ?",
    )
    .bind(&today_str)
    .bind(STATUS_DONE)
    .fetch_one(&state.db)
    .await
    .unwrap_or(0);

    let today_income = income_for(&state, &today_str).await;
    let yesterday_queue: i64 = count_where(&state, "booking_date = ?", &yesterday_str).await;
    let yesterday_income = income_for(&state, &yesterday_str).await;

    let month_income: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(final_price), 0) FROM bookings WHERE booking_date LIKE ? AND status = ?",
    )
    .bind(&month_like)
    .bind(STATUS_DONE)
    .fetch_one(&state.db)
    .await
    .unwrap_or(0);

    Ok(HttpResponse::Ok().json(json!({
        "date": today_str,
        "today_queue": queue,
        "completed": completed,
        "today_income": today_income,
        "month_income": month_income,
        "queue_growth": calc_growth(queue, yesterday_queue),
        "income_growth": calc_growth(today_income, yesterday_income),
    })))
}

async fn count_where(state: &web::Data<AppState>, clause: &str, param: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM bookings WHERE {clause}");
    sqlx::query_scalar(&sql)
        .bind(param)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0)
}

async fn income_for(state: &web::Data<AppState>, date: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(final_price), 0) FROM bookings WHERE booking_date = ? AND status = ?",
    )
    .bind(date)
    .bind(STATUS_DONE)
    .fetch_one(&state.db)
    .await
    .unwrap_or(0)
}

async fn list_inventory(state: web::Data<AppState>) -> Result<HttpResponse> {
    let items = sqlx::query_as::<_, InventoryItemRow>(
        "SELECT id, name, quantity, unit, min_level FROM inventory ORDER BY quantity ASC",
    )
    .fetch_all(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    let low_stock_count = items.iter().filter(|item| item.low_stock()).count();
    let items: Vec<serde_json::Value> = items
        .into_iter()
        .map(|item| {
            let low = item.low_stock();
            json!({
                "id": item.id,
                "name": item.name,
                "quantity": item.quantity,
                "unit": item.unit,
                "min_level": item.min_level,
                "low_stock": low,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "items": items,
        "low_stock_count": low_stock_count,
    })))
}

async fn create_inventory_item(
    state: web::Data<AppState>,
    payload: web::Json<InventoryCreateForm>,
) -> Result<HttpResponse> {
    let form = payload.into_inner();
    if form.name.trim().is_empty() {
        return Ok(unprocessable(vec!["Item name is required.".to_string()]));
    }

    let result = sqlx::query(
        "INSERT INTO inventory (name, quantity, unit, min_level) VALUES (?, ?, ?, ?)",
    )
    .bind(form.name.trim())
    .bind(form.quantity.unwrap_or(0))
    .bind(form.unit.as_deref().unwrap_or(""))
    .bind(form.min_level.unwrap_or(5))
    .execute(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    let item = sqlx::query_as::<_, InventoryItemRow>(
        "SELECT id, name, quantity, unit, min_level FROM inventory WHERE id = ?",
    )
    .bind(result.last_insert_rowid())
    .fetch_one(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Created().json(json!({ "item": item })))
}

// Manual stock moves are floor-clamped; only fulfillment may go negative.
async fn adjust_inventory(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    payload: web::Json<AdjustForm>,
) -> Result<HttpResponse> {
    let item_id = path.into_inner();
    let delta = payload.delta;

    let adjusted = sqlx::query(
        "UPDATE inventory SET quantity = quantity + ? WHERE id = ? AND quantity + ? >= 0",
    )
    .bind(delta)
    .bind(item_id)
    .bind(delta)
    .execute(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    if adjusted.rows_affected() == 0 {
        let current: Option<i64> = sqlx::query_scalar("SELECT quantity FROM inventory WHERE id = ?")
            .bind(item_id)
            .fetch_optional(&state.db)
            .await
            .map_err(actix_web::error::ErrorInternalServerError)?;
        return match current {
            None => Ok(HttpResponse::NotFound().json(json!({ "error": "Item not found." }))),
            Some(quantity) => Ok(unprocessable(vec![format!(
                "Adjustment of {delta} would take quantity {quantity} below zero."
            )])),
        };
    }

    log_activity(
        &state.db,
        "stock_adjusted",
        &format!("Inventory item {item_id} adjusted by {delta}."),
        None,
    )
    .await;

    let item = sqlx::query_as::<_, InventoryItemRow>(
        "SELECT id, name, quantity, unit, min_level FROM inventory WHERE id = ?",
    )
    .bind(item_id)
    .fetch_one(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(json!({ "item": item })))
}

async fn list_services(state: web::Data<AppState>) -> Result<HttpResponse> {
    let services = sqlx::query_as::<_, ServiceRow>(
        "SELECT id, name, price, duration_minutes FROM services ORDER BY id",
    )
    .fetch_all(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(json!({ "services": services })))
}

fn validate_service(form: &ServiceForm) -> Vec<String> {
    let mut errors = Vec::new();
    if form.name.trim().is_empty() {
        errors.push("Service name is required.".to_string());
    }
    if form.price < 0 {
        errors.push("Price cannot be negative.".to_string());
    }
    if form.duration_minutes.unwrap_or(DEFAULT_DURATION_MIN) <= 0 {
        errors.push("Duration must be positive.".to_string());
    }
    errors
}

async fn create_service(
    state: web::Data<AppState>,
    payload: web::Json<ServiceForm>,
) -> Result<HttpResponse> {
    let form = payload.into_inner();
    let errors = validate_service(&form);
    if !errors.is_empty() {
        return Ok(unprocessable(errors));
    }

    let result = sqlx::query("INSERT INTO services (name, price, duration_minutes) VALUES (?, ?, ?)")
        .bind(form.name.trim())
        .bind(form.price)
        .bind(form.duration_minutes.unwrap_or(DEFAULT_DURATION_MIN))
        .execute(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    let service = sqlx::query_as::<_, ServiceRow>(
        "SELECT id, name, price, duration_minutes FROM services WHERE id = ?",
    )
    .bind(result.last_insert_rowid())
    .fetch_one(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Created().json(json!({ "service": service })))
}

async fn update_service(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    payload: web::Json<ServiceForm>,
) -> Result<HttpResponse> {
    let service_id = path.into_inner();
    let form = payload.into_inner();
    let errors = validate_service(&form);
    if !errors.is_empty() {
        return Ok(unprocessable(errors));
    }

    let updated = sqlx::query("UPDATE services SET name = ?, price = ?, duration_minutes = ? WHERE id = ?")
        .bind(form.name.trim())
        .bind(form.price)
        .bind(form.duration_minutes.unwrap_or(DEFAULT_DURATION_MIN))
        .bind(service_id)
        .execute(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    if updated.rows_affected() == 0 {
        return Ok(HttpResponse::NotFound().json(json!({ "error": "Service not found." })));
    }

    let service = sqlx::query_as::<_, ServiceRow>(
        "SELECT id, name, price, duration_minutes FROM services WHERE id = ?",
    )
    .bind(service_id)
    .fetch_one(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(json!({ "service": service })))
}

async fn delete_service(state: web::Data<AppState>, path: web::Path<i64>) -> Result<HttpResponse> {
    let deleted = sqlx::query("DELETE FROM services WHERE id = ?")
        .bind(path.into_inner())
        .execute(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    if deleted.rows_affected() == 0 {
        return Ok(HttpResponse::NotFound().json(json!({ "error": "Service not found." })));
    }
    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

async fn get_recipes(state: web::Data<AppState>, path: web::Path<i64>) -> Result<HttpResponse> {
    let service_id = path.into_inner();
    let rows = sqlx::query_as::<_, (i64, i64, String, i64)>(
        r#"SELECT r.id, r.inventory_id, i.name, r.quantity_used
           FROM service_recipes r
           JOIN inventory i ON r.inventory_id = i.id
           WHERE r.service_id = ?
           ORDER BY r.id"#,
    )
    .bind(service_id)
    .fetch_all(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    let recipes: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, inventory_id, item_name, quantity_used)| {
            json!({
                "id": id,
                "inventory_id": inventory_id,
                "item_name": item_name,
                "quantity_used": quantity_used,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({ "recipes": recipes })))
}

// Replace-all semantics: the submitted list becomes the service's recipe.
async fn put_recipes(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    payload: web::Json<Vec<RecipeInput>>,
) -> Result<HttpResponse> {
    let service_id = path.into_inner();
    let entries = payload.into_inner();

    let service: Option<(i64,)> = sqlx::query_as("SELECT id FROM services WHERE id = ?")
        .bind(service_id)
        .fetch_optional(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    if service.is_none() {
        return Ok(HttpResponse::NotFound().json(json!({ "error": "Service not found." })));
    }

    let mut errors = Vec::new();
    for entry in &entries {
        if entry.quantity_used <= 0 {
            errors.push(format!(
                "Quantity for item {} must be positive.",
                entry.inventory_id
            ));
            continue;
        }
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM inventory WHERE id = ?")
            .bind(entry.inventory_id)
            .fetch_optional(&state.db)
            .await
            .map_err(actix_web::error::ErrorInternalServerError)?;
        if exists.is_none() {
            errors.push(format!("Unknown inventory item {}.", entry.inventory_id));
        }
    }
    if !errors.is_empty() {
        return Ok(unprocessable(errors));
    }

    let mut tx = state
        .db
        .begin()
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    sqlx::query("DELETE FROM service_recipes WHERE service_id = ?")
        .bind(service_id)
        .execute(&mut *tx)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    for entry in &entries {
        sqlx::query(
            "INSERT INTO service_recipes (service_id, inventory_id, quantity_used) VALUES (?, ?, ?)",
        )
        .bind(service_id)
        .bind(entry.inventory_id)
        .bind(entry.quantity_used)
        .execute(&mut *tx)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    }
    tx.commit()
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(json!({ "ok": true, "entries": entries.len() })))
}

async fn list_promotions(state: web::Data<AppState>) -> Result<HttpResponse> {
    let promotions = sqlx::query_as::<_, PromotionRow>(
        "SELECT id, name, discount_type, value, is_active FROM promotions ORDER BY id",
    )
    .fetch_all(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(json!({ "promotions": promotions })))
}

async fn create_promotion(
    state: web::Data<AppState>,
    payload: web::Json<PromotionCreateForm>,
) -> Result<HttpResponse> {
    let form = payload.into_inner();
    let mut errors = Vec::new();
    if form.name.trim().is_empty() {
        errors.push("Promotion name is required.".to_string());
    }
    if form.discount_type != DISCOUNT_PERCENT && form.discount_type != DISCOUNT_AMOUNT {
        errors.push(format!(
            "Discount type must be {DISCOUNT_PERCENT:?} or {DISCOUNT_AMOUNT:?}."
        ));
    }
    if form.value < 0 {
        errors.push("Discount value cannot be negative.".to_string());
    }
    if !errors.is_empty() {
        return Ok(unprocessable(errors));
    }

    let result = sqlx::query(
        "INSERT INTO promotions (name, discount_type, value, is_active) VALUES (?, ?, ?, 1)",
    )
    .bind(form.name.trim())
    .bind(&form.discount_type)
    .bind(form.value)
    .execute(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    let promotion = sqlx::query_as::<_, PromotionRow>(
        "SELECT id, name, discount_type, value, is_active FROM promotions WHERE id = ?",
    )
    .bind(result.last_insert_rowid())
    .fetch_one(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Created().json(json!({ "promotion": promotion })))
}

async fn toggle_promotion(state: web::Data<AppState>, path: web::Path<i64>) -> Result<HttpResponse> {
    let promotion_id = path.into_inner();
    let toggled = sqlx::query("UPDATE promotions SET is_active = 1 - is_active WHERE id = ?")
        .bind(promotion_id)
        .execute(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    if toggled.rows_affected() == 0 {
        return Ok(HttpResponse::NotFound().json(json!({ "error": "Promotion not found." })));
    }

    let promotion = sqlx::query_as::<_, PromotionRow>(
        "SELECT id, name, discount_type, value, is_active FROM promotions WHERE id = ?",
    )
    .bind(promotion_id)
    .fetch_one(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(json!({ "promotion": promotion })))
}

async fn delete_promotion(state: web::Data<AppState>, path: web::Path<i64>) -> Result<HttpResponse> {
    let deleted = sqlx::query("DELETE FROM promotions WHERE id = ?")
        .bind(path.into_inner())
        .execute(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    if deleted.rows_affected() == 0 {
        return Ok(HttpResponse::NotFound().json(json!({ "error": "Promotion not found." })));
    }
    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

async fn list_customers(state: web::Data<AppState>) -> Result<HttpResponse> {
    let customers = sqlx::query_as::<_, crate::models::CustomerRow>(
        r#"SELECT id, name, phone, facebook, visit_count, total_spent, last_visit
           FROM customers ORDER BY total_spent DESC, name"#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(actix_web::error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(json!({ "customers": customers })))
}

async fn upsert_customer(
    state: &web::Data<AppState>,
    name: &str,
    phone: Option<&str>,
    facebook: Option<&str>,
) -> Result<(), sqlx::Error> {
    let phone = phone.map(str::trim).filter(|p| !p.is_empty());
    let existing: Option<(i64,)> = match phone {
        Some(phone) => {
            sqlx::query_as("SELECT id FROM customers WHERE name = ? OR phone = ? LIMIT 1")
                .bind(name)
                .bind(phone)
                .fetch_optional(&state.db)
                .await?
        }
        None => {
            sqlx::query_as("SELECT id FROM customers WHERE name = ? LIMIT 1")
                .bind(name)
                .fetch_optional(&state.db)
                .await?
        }
    };

    let now = chrono::Utc::now().to_rfc3339();
    match existing {
        Some((id,)) => {
            sqlx::query("UPDATE customers SET last_visit = ? WHERE id = ?")
                .bind(&now)
                .bind(id)
                .execute(&state.db)
                .await?;
        }
        None => {
            sqlx::query(
                r#"INSERT INTO customers (name, phone, facebook, visit_count, total_spent, last_visit)
                   VALUES (?, ?, ?, 1, 0, ?)"#,
            )
            .bind(name)
            .bind(phone)
            .bind(facebook)
            .bind(&now)
            .execute(&state.db)
            .await?;
        }
    }
    Ok(())
}

async fn open_shop(state: web::Data<AppState>) -> Result<HttpResponse> {
    let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
    let sql = format!(
        "{BOOKING_SELECT} WHERE b.booking_date = ? AND b.status != ? ORDER BY b.start_time"
    );
    let bookings = sqlx::query_as::<_, crate::models::BookingRow>(&sql)
        .bind(&today)
        .bind(STATUS_CANCELLED)
        .fetch_all(&state.db)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    let expected_income: i64 = bookings.iter().map(|b| b.final_price).sum();

    let channel = WebPushChannel {
        db: state.db.clone(),
        config: state.push.clone(),
    };
    let payload = push::open_shop_payload(&today, &bookings, expected_income);
    match channel.broadcast(&payload).await {
        Ok(delivered) => {
            log_activity(&state.db, "shop_opened", "Shop opened, queue announced.", None).await;
            Ok(HttpResponse::Ok().json(json!({
                "ok": true,
                "delivered": delivered,
                "bookings": bookings.len(),
                "expected_income": expected_income,
            })))
        }
        Err(err) => Ok(HttpResponse::BadGateway().json(json!({ "error": err.to_string() }))),
    }
}

async fn close_shop(state: web::Data<AppState>) -> Result<HttpResponse> {
    let today = Local::now().date_naive().format("%Y-%m-%d").to_string();

    let done_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bookings WHERE booking_date = ? AND status = ?",
    )
    .bind(&today)
    .bind(STATUS_DONE)
    .fetch_one(&state.db)
    .await
    .unwrap_or(0);
    let cancelled_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bookings WHERE booking_date = ? AND status = ?",
    )
    .bind(&today)
    .bind(STATUS_CANCELLED)
    .fetch_one(&state.db)
    .await
    .unwrap_or(0);
    let income = income_for(&state, &today).await;

    let channel = WebPushChannel {
        db: state.db.clone(),
        config: state.push.clone(),
    };
    let payload = push::close_shop_payload(&today, income, done_count, cancelled_count);
    match channel.broadcast(&payload).await {
        Ok(delivered) => {
            log_activity(&state.db, "shop_closed", "Shop closed, summary sent.", None).await;
            Ok(HttpResponse::Ok().json(json!({
                "ok": true,
                "delivered": delivered,
                "income": income,
                "done": done_count,
                "cancelled": cancelled_count,
            })))
        }
        Err(err) => Ok(HttpResponse::BadGateway().json(json!({ "error": err.to_string() }))),
    }
}

async fn register_subscription(
    state: web::Data<AppState>,
    payload: web::Json<PushSubscriptionInput>,
) -> Result<HttpResponse> {
    push::store_subscription(&state.db, &payload.into_inner())
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}
