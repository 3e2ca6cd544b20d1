//! Turnstile - subscription entitlement verification server

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use turnstile::{
    config::Args,
    db::MongoClient,
    server,
    services::{HttpPurchaseValidator, VerificationConfig, VerificationService},
    store::{InMemorySubscriptionStore, MongoSubscriptionStore, SubscriptionStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    init_tracing(&args);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let catalog = args.product_catalog();

    info!("======================================");
    info!("  Turnstile - Subscription Verification");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("MongoDB: {}", args.mongodb_uri);
    info!("Trial length: {} day(s)", args.trial_days);
    info!("Products: {}", catalog.valid_ids().collect::<Vec<_>>().join(", "));
    info!(
        "Purchase verification: {}",
        if args.billing_verify_url.is_some() { "enabled" } else { "disabled" }
    );
    info!("======================================");

    // MongoDB is optional in dev mode only
    let store: Arc<dyn SubscriptionStore> = match connect_store(&args).await {
        Ok(store) => {
            info!("MongoDB connected successfully");
            Arc::new(store)
        }
        Err(e) => {
            if args.dev_mode {
                warn!("MongoDB connection failed (dev mode, using in-memory store): {}", e);
                Arc::new(InMemorySubscriptionStore::new())
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let mut verification = VerificationService::new(
        store,
        VerificationConfig {
            trial_days: args.trial_days,
            catalog,
        },
    );

    if let (Some(url), Some(key)) = (&args.billing_verify_url, &args.billing_api_key) {
        let validator = HttpPurchaseValidator::new(url, key, args.request_timeout())?;
        verification = verification.with_validator(Arc::new(validator));
        info!("Billing provider configured at {}", url);
    }

    let state = Arc::new(server::AppState::new(args, Arc::new(verification))?);

    server::run(state).await?;

    Ok(())
}

fn init_tracing(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("turnstile={},info", args.log_level).into());

    if args.json_logs() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn connect_store(args: &Args) -> turnstile::Result<MongoSubscriptionStore> {
    let client = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
    MongoSubscriptionStore::new(&client).await
}
