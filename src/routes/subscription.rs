//! Subscription endpoints
//!
//! - `POST /verify` - entitlement verification
//! - `POST /trial-start` - set-once trial start (201 / 409)
//! - `GET /trial-status/{userId}` - trial eligibility
//! - `POST /sync` - client status snapshot, audit only
//! - `POST /verify-purchase` - billing provider token check
//!
//! Every endpoint requires a bearer token whose subject matches the target
//! user, exactly or through the test-account derivation.

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::{
    authenticate, authorize_user, error_response, get_auth_header, json_response, parse_json_body,
};
use crate::routes::BoxError;
use crate::server::AppState;
use crate::services::TrialStartOutcome;
use crate::types::{
    PurchaseVerificationRequest, SyncRequest, TrialConflictResponse, TrialStartRequest,
    TrialStartResponse, TurnstileError, VerifyRequest, VerifyResponse,
};

/// POST /verify
pub async fn handle_verify<B>(req: Request<B>, state: Arc<AppState>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let auth = get_auth_header(&req);
    let body: VerifyRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };

    let claims = match authorize_user(&state, auth.as_deref(), &body.user_id) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };

    let device_id = body.device_id.or(claims.device_id);
    match state
        .verification
        .verify(&body.user_id, device_id.as_deref())
        .await
    {
        Ok(result) => json_response(
            StatusCode::OK,
            &VerifyResponse {
                success: true,
                data: Some(result),
                error: None,
            },
        ),
        Err(e) => error_response(e),
    }
}

/// POST /trial-start
pub async fn handle_trial_start<B>(req: Request<B>, state: Arc<AppState>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let auth = get_auth_header(&req);
    let body: TrialStartRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };

    if let Err(e) = authorize_user(&state, auth.as_deref(), &body.user_id) {
        return error_response(e);
    }

    let outcome = match state
        .verification
        .start_trial(&body.user_id, &body.device_id)
        .await
    {
        Ok(o) => o,
        Err(e) => return error_response(e),
    };

    let server_time = Utc::now();
    match outcome {
        TrialStartOutcome::Started { trial_started_at } => json_response(
            StatusCode::CREATED,
            &TrialStartResponse {
                trial_started_at,
                server_time,
            },
        ),
        TrialStartOutcome::AlreadyUsed { trial_started_at } => json_response(
            StatusCode::CONFLICT,
            &TrialConflictResponse {
                error: "Trial already used".to_string(),
                code: "TrialAlreadyUsed".to_string(),
                trial_started_at,
                server_time,
            },
        ),
        TrialStartOutcome::DeviceTrialUsed { trial_started_at } => json_response(
            StatusCode::CONFLICT,
            &TrialConflictResponse {
                error: "Trial already used on this device".to_string(),
                code: "DEVICE_TRIAL_USED".to_string(),
                trial_started_at,
                server_time,
            },
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrialStatusQuery {
    #[serde(default)]
    device_id: Option<String>,
}

/// GET /trial-status/{userId}?deviceId=...
pub async fn handle_trial_status<B>(
    req: Request<B>,
    state: Arc<AppState>,
    user_id: &str,
) -> Response<Full<Bytes>> {
    if user_id.is_empty() || user_id.contains('/') {
        return error_response(TurnstileError::BadRequest("Invalid userId in path".into()));
    }

    let auth = get_auth_header(&req);
    if let Err(e) = authorize_user(&state, auth.as_deref(), user_id) {
        return error_response(e);
    }

    let query: TrialStatusQuery = match req.uri().query() {
        Some(q) => match serde_urlencoded::from_str(q) {
            Ok(q) => q,
            Err(e) => {
                return error_response(TurnstileError::BadRequest(format!(
                    "Invalid query: {}",
                    e
                )))
            }
        },
        None => TrialStatusQuery::default(),
    };

    match state
        .verification
        .trial_status(user_id, query.device_id.as_deref())
        .await
    {
        Ok(status) => json_response(StatusCode::OK, &status),
        Err(e) => error_response(e),
    }
}

/// POST /sync
///
/// The user is the token subject; the body carries no identity.
pub async fn handle_sync<B>(req: Request<B>, state: Arc<AppState>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let claims = match authenticate(&state, get_auth_header(&req).as_deref()) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };

    let body: SyncRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };

    debug!(user_id = %claims.sub, status = %body.status, "Sync request");
    match state.verification.sync(&claims.sub, body).await {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(e) => error_response(e),
    }
}

/// POST /verify-purchase
pub async fn handle_verify_purchase<B>(
    req: Request<B>,
    state: Arc<AppState>,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let auth = get_auth_header(&req);
    let body: PurchaseVerificationRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };

    if let Err(e) = authorize_user(&state, auth.as_deref(), &body.user_id) {
        return error_response(e);
    }

    match state.verification.verify_purchase(body).await {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{bearer, body_json, request, state};
    use serde_json::json;

    #[tokio::test]
    async fn test_verify_requires_token() {
        let state = state();
        let req = request("POST", "/verify", None, json!({ "userId": "alice" }));
        let response = handle_verify(req, state).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_verify_rejects_identity_mismatch() {
        let state = state();
        let auth = bearer(&state, "alice");
        let req = request("POST", "/verify", Some(&auth), json!({ "userId": "bob" }));
        let response = handle_verify(req, state).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_verify_accepts_test_account() {
        let state = state();
        let auth = bearer(&state, "alice");
        let req = request(
            "POST",
            "/verify",
            Some(&auth),
            json!({ "userId": "alice_test" }),
        );
        let response = handle_verify(req, state).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["hasUsedTrial"], false);
        assert_eq!(body["data"]["source"], "server");
    }

    #[tokio::test]
    async fn test_trial_start_then_conflict() {
        let state = state();
        let auth = bearer(&state, "alice");
        let body = json!({ "userId": "alice", "deviceId": "dev-1" });

        let first = handle_trial_start(
            request("POST", "/trial-start", Some(&auth), body.clone()),
            state.clone(),
        )
        .await;
        assert_eq!(first.status(), StatusCode::CREATED);
        let first = body_json(first).await;

        let second = handle_trial_start(
            request("POST", "/trial-start", Some(&auth), body),
            state.clone(),
        )
        .await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let second = body_json(second).await;
        assert_eq!(second["code"], "TrialAlreadyUsed");
        assert_eq!(second["trialStartedAt"], first["trialStartedAt"]);
    }

    #[tokio::test]
    async fn test_trial_start_device_reuse() {
        let state = state();
        let alice = bearer(&state, "alice");
        let bob = bearer(&state, "bob");

        handle_trial_start(
            request(
                "POST",
                "/trial-start",
                Some(&alice),
                json!({ "userId": "alice", "deviceId": "shared" }),
            ),
            state.clone(),
        )
        .await;

        let response = handle_trial_start(
            request(
                "POST",
                "/trial-start",
                Some(&bob),
                json!({ "userId": "bob", "deviceId": "shared" }),
            ),
            state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "DEVICE_TRIAL_USED");

        let status = handle_trial_status(
            request(
                "GET",
                "/trial-status/bob?deviceId=shared",
                Some(&bob),
                json!(null),
            ),
            state,
            "bob",
        )
        .await;
        assert_eq!(status.status(), StatusCode::OK);
        let status = body_json(status).await;
        assert_eq!(status["hasUsedTrial"], false);
        assert_eq!(status["deviceBasedTrialAvailable"], false);
        assert!(status["deviceTrialInfo"]["trialStartedAt"].is_string());
    }

    #[tokio::test]
    async fn test_sync_uses_token_subject() {
        let state = state();
        let auth = bearer(&state, "alice");
        let response = handle_sync(
            request(
                "POST",
                "/sync",
                Some(&auth),
                json!({ "deviceId": "dev-1", "status": "expired" }),
            ),
            state.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["statusChanged"], true);

        let events = state.verification.list_events("alice").await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_bad_status() {
        let state = state();
        let auth = bearer(&state, "alice");
        let response = handle_sync(
            request(
                "POST",
                "/sync",
                Some(&auth),
                json!({ "deviceId": "dev-1", "status": "gold" }),
            ),
            state,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_verify_purchase_without_provider() {
        let state = state();
        let auth = bearer(&state, "alice");
        let response = handle_verify_purchase(
            request(
                "POST",
                "/verify-purchase",
                Some(&auth),
                json!({ "userId": "alice", "productId": "premium_monthly", "purchaseToken": "t" }),
            ),
            state,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body_json(response).await["code"], "NOT_CONFIGURED");
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let state = state();
        let auth = bearer(&state, "alice");
        let req = hyper::Request::builder()
            .method("POST")
            .uri("/verify")
            .header(hyper::header::AUTHORIZATION, auth)
            .body(Full::new(Bytes::from_static(b"{not json")))
            .unwrap();
        let response = handle_verify(req, state).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let state = state();
        let auth = bearer(&state, "alice");
        let padding = "x".repeat(11 * 1024);
        let req = request(
            "POST",
            "/sync",
            Some(&auth),
            json!({ "deviceId": "dev-1", "status": "trial", "padding": padding }),
        );
        let response = handle_sync(req, state.clone()).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(response).await["code"], "PAYLOAD_TOO_LARGE");

        // nothing was written
        let result = state.verification.verify("alice", None).await.unwrap();
        assert!(!result.has_used_trial);
        assert!(state.verification.list_events("alice").await.unwrap().is_empty());
    }
}
