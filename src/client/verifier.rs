//! Remote verification calls

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::error::VerifyCallError;
use crate::types::{
    SyncRequest, SyncResponse, TrialConflictResponse, TrialStartRequest, TrialStartResponse,
    TrialStatusResponse, VerificationResult, VerifyRequest, VerifyResponse,
};

/// The one call the resolver needs
#[async_trait]
pub trait VerificationClient: Send + Sync {
    async fn verify(&self, user_id: &str, auth_token: &str)
        -> Result<VerificationResult, VerifyCallError>;
}

/// Outcome of a client-side trial start
#[derive(Debug, Clone)]
pub enum TrialStartReply {
    Started(TrialStartResponse),
    /// 409; informational, carries the original start
    Conflict(TrialConflictResponse),
}

/// reqwest client for the verification server
#[derive(Clone)]
pub struct HttpVerificationClient {
    client: reqwest::Client,
    base_url: String,
    device_id: Option<String>,
}

impl HttpVerificationClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, VerifyCallError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerifyCallError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            device_id: None,
        })
    }

    /// Send this device id with every verify call
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_json<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, VerifyCallError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(VerifyCallError::Status(status.as_u16()));
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| VerifyCallError::Decode(e.to_string()))
    }

    /// POST /trial-start
    pub async fn start_trial(
        &self,
        user_id: &str,
        device_id: &str,
        auth_token: &str,
    ) -> Result<TrialStartReply, VerifyCallError> {
        let resp = self
            .client
            .post(self.url("/trial-start"))
            .bearer_auth(auth_token)
            .json(&TrialStartRequest {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
            })
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            let body = resp.bytes().await?;
            return serde_json::from_slice(&body)
                .map(TrialStartReply::Conflict)
                .map_err(|e| VerifyCallError::Decode(e.to_string()));
        }
        Self::read_json(resp).await.map(TrialStartReply::Started)
    }

    /// GET /trial-status/{userId}
    pub async fn trial_status(
        &self,
        user_id: &str,
        auth_token: &str,
    ) -> Result<TrialStatusResponse, VerifyCallError> {
        let mut request = self
            .client
            .get(self.url(&format!("/trial-status/{}", user_id)))
            .bearer_auth(auth_token);
        if let Some(device_id) = &self.device_id {
            request = request.query(&[("deviceId", device_id)]);
        }
        Self::read_json(request.send().await?).await
    }

    /// POST /sync
    pub async fn sync(
        &self,
        request: &SyncRequest,
        auth_token: &str,
    ) -> Result<SyncResponse, VerifyCallError> {
        let resp = self
            .client
            .post(self.url("/sync"))
            .bearer_auth(auth_token)
            .json(request)
            .send()
            .await?;
        Self::read_json(resp).await
    }
}

#[async_trait]
impl VerificationClient for HttpVerificationClient {
    async fn verify(
        &self,
        user_id: &str,
        auth_token: &str,
    ) -> Result<VerificationResult, VerifyCallError> {
        let resp = self
            .client
            .post(self.url("/verify"))
            .bearer_auth(auth_token)
            .json(&VerifyRequest {
                user_id: user_id.to_string(),
                device_id: self.device_id.clone(),
            })
            .send()
            .await?;

        let envelope: VerifyResponse = Self::read_json(resp).await?;
        debug!(success = envelope.success, "Verification response");

        match envelope.data {
            Some(mut result) => {
                // The envelope can report failure even when data is present
                result.success = result.success && envelope.success;
                Ok(result)
            }
            None => Err(VerifyCallError::Decode(
                envelope
                    .error
                    .unwrap_or_else(|| "response carried no data".to_string()),
            )),
        }
    }
}
