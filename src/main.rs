mod db;
mod fulfill;
mod models;
mod push;
mod reminder;
mod routes;
mod schedule;
mod state;

use std::env;
use std::str::FromStr;
use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::{broadcast, Mutex};

use crate::state::{AppState, PushConfig};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    if let Err(err) = run().await {
        eprintln!("Startup error: {err}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let db_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./data/salonq.db".to_string());
    db::ensure_sqlite_dir(&db_url)?;

    let connect_options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options)
        .await?;

    db::run_migrations(&pool).await?;
    db::seed_defaults(&pool).await?;

    let (events, _) = broadcast::channel(64);
    let push = PushConfig {
        public_key: env::var("VAPID_PUBLIC_KEY").unwrap_or_default(),
        private_key: env::var("VAPID_PRIVATE_KEY").unwrap_or_default(),
        subject: env::var("PUSH_SUBJECT").unwrap_or_else(|_| "mailto:owner@example.com".to_string()),
    };
    if !push.enabled() {
        log::warn!("VAPID keys not set. Push delivery is disabled until they are configured.");
    }

    let sweep_key = env::var("SWEEP_KEY").unwrap_or_default();
    if sweep_key.is_empty() {
        log::warn!("SWEEP_KEY not set. The reminder sweep endpoint will reject every call.");
    }

    let state = AppState {
        db: pool.clone(),
        events,
        push,
        sweep_key,
        booking_gate: Arc::new(Mutex::new(())),
    };

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8080);

    let address = format!("0.0.0.0:{port}");
    log::info!("Starting SalonQ on http://{address}");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(middleware::Logger::default())
            .configure(routes::public::configure)
            .configure(routes::admin::configure)
            .configure(routes::events::configure)
    })
    .bind(address)?
    .run()
    .await?;

    Ok(())
}
