use std::sync::Arc;

use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use x402::OracleClient;
use x402_stage_server::{
    catalog::CatalogSeed, config::ServerConfig, db::Database, error::SeedError,
    metrics::register_metrics, routes, state::AppState,
};

fn load_catalog(db: &Database, path: &str) -> Result<usize, SeedError> {
    let json = std::fs::read_to_string(path).map_err(|source| SeedError::Read {
        path: path.to_string(),
        source,
    })?;
    db.seed(&CatalogSeed::from_json(&json)?)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ServerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let port = config.port;
    let allowed_origins = config.allowed_origins.clone();
    let rate_limit_rpm = config.rate_limit_rpm;

    tracing::info!("Starting x402-stage-server on port {}", port);
    tracing::info!("Oracle URL: {}", config.oracle_url);
    tracing::info!(
        "Oracle request signing: {}",
        if config.oracle_secret.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );

    let db = match Database::new(&config.db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to initialize database at {}: {e}", config.db_path);
            std::process::exit(1);
        }
    };
    tracing::info!("Database initialized at: {}", config.db_path);

    if let Some(ref path) = config.catalog_path {
        match load_catalog(&db, path) {
            Ok(n) => tracing::info!("Seeded {n} resources from {path}"),
            Err(e) => {
                tracing::error!("Failed to load catalog: {e}");
                std::process::exit(1);
            }
        }
    }

    register_metrics();

    let http_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(std::io::Error::other)?;
    let oracle = OracleClient::new(http_client, &config.oracle_url)
        .with_hmac_secret(config.oracle_secret.clone())
        .with_timeouts(config.verify_timeout, config.settle_timeout);

    let keepalive = config.sse_keepalive;
    let state = AppState::new(config, db, Arc::new(oracle));
    let keepalive_task = state.broker.spawn_keepalive(keepalive);
    let state_data = web::Data::new(state);

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(rate_limit_rpm as u64)
        .finish()
        .ok_or_else(|| std::io::Error::other("invalid rate limiter config"))?;

    let result = HttpServer::new(move || {
        let cors = x402_stage_server::cors::build_cors(&allowed_origins);

        App::new()
            .app_data(state_data.clone())
            .app_data(web::JsonConfig::default().limit(16 * 1024))
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Governor::new(&governor_conf))
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    keepalive_task.abort();
    result
}
