use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conveyor_core::consumers::ColdAgentEnroller;
use conveyor_core::{ConsumerRegistry, Processor, TracingRunLogger};
use conveyor_postgres::{PgCrmStore, PgEventStore};
use conveyor_server::{router, AppState};

struct ServerConfig {
    database_url: String,
    host: String,
    port: u16,
    stale_after_secs: i64,
    maintenance_interval_secs: u64,
}

impl ServerConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8787".to_string())
                .parse()
                .context("PORT must be a number")?,
            stale_after_secs: std::env::var("STALE_AFTER_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .context("STALE_AFTER_SECS must be a number")?,
            maintenance_interval_secs: std::env::var("MAINTENANCE_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("MAINTENANCE_INTERVAL_SECS must be a number")?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("conveyor=info".parse()?))
        .init();

    let config = ServerConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")?;

    let store = Arc::new(PgEventStore::new(pool.clone()));
    let crm = Arc::new(PgCrmStore::new(pool));

    let mut registry = ConsumerRegistry::new();
    registry.register(Arc::new(ColdAgentEnroller::new(store.clone(), crm)));

    let processor = Processor::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(TracingRunLogger),
    );

    // Maintenance sweep: reclaim stale claims, return due retries. This is
    // the recovery path for crashed runs and failed releases.
    let maintenance = store.clone();
    let stale_after = chrono::Duration::seconds(config.stale_after_secs);
    let interval = Duration::from_secs(config.maintenance_interval_secs);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            match maintenance.reclaim_stale(stale_after).await {
                Ok(n) if n > 0 => info!(reclaimed = n, "stale claims returned to pending"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "stale reclaim failed"),
            }
            match maintenance.retry_due().await {
                Ok(n) if n > 0 => info!(retried = n, "failed events returned to pending"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "retry sweep failed"),
            }
        }
    });

    let state = Arc::new(AppState {
        processor,
        store: store.as_ref().clone(),
    });
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "event processor listening");

    axum::serve(listener, app).await?;
    Ok(())
}
