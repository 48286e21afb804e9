use std::sync::Arc;

use anyhow::Context;
use credit_ledger_backend::{
    catalog::PlanCatalog,
    config::Config,
    db::{billing_store::BillingStore, postgres_billing_store::PostgresBillingStore},
    routes,
    services::{
        billing::{
            BillingReconciler, LemonSqueezyAdapter, ProviderAdapter, StripeWebhookAdapter,
        },
        ledger::CreditLedger,
        stripe::{LiveStripeService, StripeService},
    },
    AppState,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Keep the guard alive so buffered events flush on shutdown.
    let _sentry_guard = std::env::var("SENTRY_DSN")
        .ok()
        .filter(|dsn| !dsn.is_empty())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });

    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(sentry_tracing::layer())
        .with(json_logs.then(|| fmt::layer().json()))
        .with((!json_logs).then(fmt::layer))
        .init();

    let config = Config::from_env()?;

    let pg_pool = establish_connection(&config.database_url).await?;
    let store = Arc::new(PostgresBillingStore { pool: pg_pool }) as Arc<dyn BillingStore>;
    let catalog = Arc::new(PlanCatalog::from_settings(&config.catalog));
    let ledger = CreditLedger::new(store.clone(), catalog);

    let stripe_service = match LiveStripeService::from_settings(&config.stripe) {
        Some(service) => Some(Arc::new(service) as Arc<dyn StripeService>),
        None => {
            warn!("STRIPE_SECRET_KEY not set; card metadata will not be recorded on purchases");
            None
        }
    };

    let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
        Arc::new(StripeWebhookAdapter::from_settings(&config.stripe)),
        Arc::new(LemonSqueezyAdapter::from_settings(&config.lemonsqueezy)),
    ];
    let reconciler = BillingReconciler::new(store, ledger.clone(), adapters, stripe_service);

    let state = AppState {
        ledger: Arc::new(ledger),
        reconciler: Arc::new(reconciler),
    };

    let app = routes::app(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("Listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn establish_connection(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPool::connect(database_url)
        .await
        .context("Failed to connect to the database")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("Failed to verify database connection")?;

    info!("Successfully connected to the database");
    Ok(pool)
}
