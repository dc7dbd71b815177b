// Main entry point for the answer engine API

use std::sync::Arc;

use anyhow::{Context, Result};
use assistant_core::domains::admission::{AdmissionController, PgQuotaStore};
use assistant_core::kernel::{
    HttpRetrievalClient, PassthroughSanitizer, PgConnectionManager, ResourcePool, ServerDeps,
    StripeBillingClient, SubscriptionRefreshTask,
};
use assistant_core::server::{build_app, AppState};
use assistant_core::Config;
use completion_client::{OpenAIClient, StructuredCompletionClient};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,assistant_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Belastingwijzer answer engine");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!(max_size = config.pool_max_size, "Opening connection pool...");
    let pool = ResourcePool::connect(
        PgConnectionManager::new(config.database_url.clone()),
        config.pool_config(),
    )
    .await
    .context("Failed to connect to database")?;

    // Run migrations
    tracing::info!("Running database migrations...");
    {
        let mut conn = pool
            .acquire()
            .await
            .context("Failed to lease a connection for migrations")?;
        sqlx::migrate!("./migrations")
            .run(&mut *conn)
            .await
            .context("Failed to run migrations")?;
    }
    tracing::info!("Migrations complete");

    // External collaborators
    let mut openai = OpenAIClient::new(config.openai_api_key.clone());
    if let Some(base_url) = &config.openai_base_url {
        openai = openai.with_base_url(base_url.clone());
    }
    let completions = StructuredCompletionClient::new(Arc::new(openai), config.openai_model.clone())
        .with_timeout(config.completion_timeout)
        .with_retry_policy(config.retry_policy());

    let retrieval = Arc::new(
        HttpRetrievalClient::new(config.retrieval_url.clone())
            .context("Failed to create retrieval client")?,
    );
    let billing = Arc::new(
        StripeBillingClient::new(
            config.stripe_secret_key.clone(),
            config.stripe_meter_event.clone(),
        )
        .context("Failed to create billing client")?,
    );

    let admission = Arc::new(AdmissionController::new(
        Arc::new(PgQuotaStore::new(pool.clone())),
        billing.clone(),
        config.admission_policy(),
    ));

    let deps = ServerDeps::new(
        admission.clone(),
        completions,
        retrieval,
        Arc::new(PassthroughSanitizer::new()),
        billing,
    );

    // Background subscription refresh
    let shutdown = CancellationToken::new();
    let refresh_handle = SubscriptionRefreshTask::spawn(
        admission,
        config.subscription_refresh_interval,
        shutdown.clone(),
    );

    if config.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN not set, admin routes are disabled");
    }

    // Build application
    let app = build_app(AppState::new(
        deps,
        Arc::new(pool),
        config.admin_token.clone(),
    ));

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    refresh_handle
        .await
        .context("Subscription refresh task panicked")?;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }
}
