mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tribunal_common::config::{JudgeSettings, LanguageConfigManager};
use tribunal_engine::JudgeService;

pub struct AppState {
    pub service: JudgeService,
    /// `None` when Redis was unreachable at boot; batch endpoints answer 503
    pub redis: Option<ConnectionManager>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new().merge(routes::routes()).with_state(state)
}

async fn connect_redis(redis_url: &str) -> Option<ConnectionManager> {
    let client = match redis::Client::open(redis_url) {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Invalid REDIS_URL, batch endpoints disabled");
            return None;
        }
    };
    match ConnectionManager::new(client).await {
        Ok(conn) => {
            info!("Connected to Redis: {}", redis_url);
            Some(conn)
        }
        Err(e) => {
            warn!(error = %e, "Redis unavailable, batch endpoints disabled");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Tribunal API booting...");

    let settings = JudgeSettings::from_env()?;
    let languages = LanguageConfigManager::load(&settings.languages_path)?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    let redis = connect_redis(&settings.redis_url).await;
    let addr = settings.bind_addr.clone();
    let service = JudgeService::from_settings(settings, &languages)?;

    let state = Arc::new(AppState { service, redis });

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            warn!("Received shutdown signal");
        })
        .await
        .context("Server error")?;

    Ok(())
}
