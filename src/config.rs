//! Configuration for the Turnstile verification server
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::types::ProductCatalog;

/// Turnstile - subscription entitlement verification server
#[derive(Parser, Debug, Clone)]
#[command(name = "turnstile")]
#[command(about = "Subscription entitlement verification server")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Enable development mode (dev JWT secret, in-memory store fallback, test routes)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "turnstile")]
    pub mongodb_db: String,

    /// JWT secret for token verification (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Lifetime in seconds of tokens minted with
    /// `JwtValidator::generate_token`. Verification only checks `exp`, so this
    /// matters to an issuer sharing the secret, such as an account service or
    /// the integration tests.
    #[arg(long, env = "JWT_EXPIRY_SECONDS", default_value = "3600")]
    pub jwt_expiry_seconds: u64,

    /// Length of the free trial in days
    #[arg(long, env = "TRIAL_DAYS", default_value = "7")]
    pub trial_days: i64,

    /// Comma-separated product identifiers currently on sale
    #[arg(
        long,
        env = "VALID_PRODUCT_IDS",
        default_value = "premium_monthly,premium_yearly"
    )]
    pub valid_product_ids: String,

    /// Comma-separated retired product identifiers (recognised, never valid)
    #[arg(long, env = "LEGACY_PRODUCT_IDS", default_value = "")]
    pub legacy_product_ids: String,

    /// Suffix that marks a test account derived from a real identity
    #[arg(long, env = "TEST_ACCOUNT_SUFFIX", default_value = "_test")]
    pub test_account_suffix: String,

    /// Expose /test/* routes outside dev mode
    #[arg(long, env = "ENABLE_TEST_ROUTES", default_value = "false")]
    pub enable_test_routes: bool,

    /// Billing provider endpoint for purchase token verification
    #[arg(long, env = "BILLING_VERIFY_URL")]
    pub billing_verify_url: Option<String>,

    /// Billing provider API key
    #[arg(long, env = "BILLING_API_KEY")]
    pub billing_api_key: Option<String>,

    /// Outbound request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl Args {
    /// Get effective JWT secret (uses default in dev mode)
    pub fn jwt_secret(&self) -> Option<String> {
        match &self.jwt_secret {
            Some(secret) => Some(secret.clone()),
            None if self.dev_mode => Some("dev-only-insecure-secret-for-turnstile-0000".to_string()),
            None => None,
        }
    }

    /// Product allow-list built from the env lists
    pub fn product_catalog(&self) -> ProductCatalog {
        ProductCatalog::from_lists(&self.valid_product_ids, &self.legacy_product_ids)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Whether reset/force-expire routes are reachable
    pub fn test_routes_enabled(&self) -> bool {
        self.dev_mode || self.enable_test_routes
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.jwt_secret.is_none() {
            return Err("JWT_SECRET is required in production mode".to_string());
        }

        if self.product_catalog().is_empty() {
            return Err("VALID_PRODUCT_IDS must name at least one product".to_string());
        }

        if self.trial_days <= 0 {
            return Err("TRIAL_DAYS must be positive".to_string());
        }

        if self.billing_verify_url.is_some() && self.billing_api_key.is_none() {
            return Err("BILLING_API_KEY is required when BILLING_VERIFY_URL is set".to_string());
        }

        Ok(())
    }
}
