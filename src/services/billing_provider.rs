//! Billing provider purchase-token checks
//!
//! The provider is the only authority for purchase tokens. Anything it says
//! that is not a clean "active with a future expiry" must leave the stored
//! record untouched, so the raw answer is classified into a [`ProviderVerdict`]
//! before the verification service sees it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::TurnstileError;

// =============================================================================
// Types
// =============================================================================

/// Classified provider answer
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderVerdict {
    Active {
        started_at: Option<DateTime<Utc>>,
        expires_at: DateTime<Utc>,
    },
    Pending,
    Expired,
    Invalid,
    /// Provider answered but not in a shape we can act on
    Ambiguous(String),
}

impl ProviderVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active { .. } => "active",
            Self::Pending => "pending",
            Self::Expired => "expired",
            Self::Invalid => "invalid",
            Self::Ambiguous(_) => "ambiguous",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderRequest<'a> {
    product_id: &'a str,
    purchase_token: &'a str,
}

/// Raw provider response body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub status: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProviderResponse {
    /// Classify against the product the client claimed and the current time
    pub fn classify(&self, claimed_product: &str, now: DateTime<Utc>) -> ProviderVerdict {
        if let Some(product) = &self.product_id {
            if product != claimed_product {
                return ProviderVerdict::Invalid;
            }
        }

        match self.status.to_ascii_lowercase().as_str() {
            "active" => match self.expires_at {
                Some(expires_at) if expires_at > now => ProviderVerdict::Active {
                    started_at: self.started_at,
                    expires_at,
                },
                Some(_) => ProviderVerdict::Ambiguous("active with past expiry".into()),
                None => ProviderVerdict::Ambiguous("active without expiry".into()),
            },
            "pending" => ProviderVerdict::Pending,
            "expired" => ProviderVerdict::Expired,
            "invalid" | "revoked" | "refunded" => ProviderVerdict::Invalid,
            other => ProviderVerdict::Ambiguous(format!("unknown status '{}'", other)),
        }
    }
}

// =============================================================================
// Validator trait
// =============================================================================

#[async_trait]
pub trait PurchaseValidator: Send + Sync {
    async fn validate(
        &self,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<ProviderVerdict, TurnstileError>;
}

/// Provider reached over HTTP with an API key
pub struct HttpPurchaseValidator {
    client: reqwest::Client,
    verify_url: String,
    api_key: String,
}

impl HttpPurchaseValidator {
    pub fn new(
        verify_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TurnstileError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TurnstileError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            verify_url: verify_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl PurchaseValidator for HttpPurchaseValidator {
    async fn validate(
        &self,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<ProviderVerdict, TurnstileError> {
        let resp = self
            .client
            .post(&self.verify_url)
            .header("X-Api-Key", &self.api_key)
            .json(&ProviderRequest {
                product_id,
                purchase_token,
            })
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "Billing provider returned error status");
            return Err(TurnstileError::Provider(format!(
                "provider status={} body={}",
                status.as_u16(),
                body
            )));
        }

        let parsed: ProviderResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(ProviderVerdict::Ambiguous(format!(
                    "unparseable provider body: {}",
                    e
                )))
            }
        };

        let verdict = parsed.classify(product_id, Utc::now());
        debug!(product_id = %product_id, verdict = verdict.label(), "Billing provider verdict");
        Ok(verdict)
    }
}
