// Main entry point for the fleet server.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_core::auth::jwt::hash_password;
use fleet_core::auth::JwtService;
use fleet_core::kernel::jobs::WorkerPool;
use fleet_core::kernel::schedulers::{RecoveryScheduler, ScanScheduler};
use fleet_core::kernel::settings::SettingsService;
use fleet_core::kernel::upstream::agent::BrowserAgent;
use fleet_core::kernel::upstream::api::HttpUpstreamClient;
use fleet_core::kernel::upstream::watermark::HttpWatermarkRewriter;
use fleet_core::kernel::Kernel;
use fleet_core::server::build_app;
use fleet_core::store::Store;
use fleet_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleet_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Sora fleet server");

    let config = Config::from_env().context("Failed to load configuration")?;

    let store = Arc::new(
        Store::connect(&config.db_path)
            .await
            .context("Failed to open database")?,
    );
    tracing::info!(db_path = %config.db_path, "Database ready");

    seed_admin_user(&store, &config).await?;

    let settings = Arc::new(
        SettingsService::load(Arc::clone(&store))
            .await
            .context("Failed to load settings")?,
    );
    let system = settings.system();

    let browser = Arc::new(
        BrowserAgent::new(&system.browser).context("Failed to build browser agent client")?,
    );
    let upstream = Arc::new(HttpUpstreamClient::new(
        "https://sora.chatgpt.com/backend/video_gen",
        system.browser.request_timeout_ms,
    ));
    let watermark = Arc::new(
        HttpWatermarkRewriter::new(settings.watermark())
            .context("Failed to build watermark client")?,
    );

    let kernel = Arc::new(Kernel::new(
        Arc::clone(&store),
        Arc::clone(&settings),
        browser,
        upstream,
        watermark,
    ));

    // Background machinery: worker pool (with its stale sweeper) and the
    // two scan schedulers.
    let worker = Arc::new(WorkerPool::new(Arc::clone(&kernel)));
    worker.start().await;
    let scan_scheduler = Arc::new(ScanScheduler::new(Arc::clone(&kernel)));
    scan_scheduler.start().await;
    let recovery_scheduler = Arc::new(RecoveryScheduler::new(Arc::clone(&kernel)));
    recovery_scheduler.start().await;

    let jwt = Arc::new(JwtService::new(&config.secret_key));
    let app = build_app(Arc::clone(&kernel), jwt);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(addr = %addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("Server error")?;

    // Unwind background work before exiting.
    recovery_scheduler.stop().await;
    scan_scheduler.stop().await;
    worker.stop().await;
    tracing::info!("clean shutdown");

    Ok(())
}

/// Seed the first admin account when the users table is empty.
async fn seed_admin_user(store: &Store, config: &Config) -> Result<()> {
    if store.count_users().await? > 0 {
        return Ok(());
    }
    let hash = hash_password(&config.admin_password)?;
    store.create_user("admin", &hash, "admin").await?;
    tracing::info!("seeded default admin user");
    Ok(())
}
