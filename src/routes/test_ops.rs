//! Test/ops endpoints, mounted only in dev mode or with ENABLE_TEST_ROUTES
//!
//! - `POST /test/reset` - hard delete a subscription record
//! - `POST /test/force-expire` - toggle the force-expired override

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{authorize_user, error_response, get_auth_header, json_response, parse_json_body};
use crate::routes::BoxError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub success: bool,
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceExpireRequest {
    pub user_id: String,
    #[serde(default = "default_true")]
    pub force_expired: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceExpireResponse {
    pub success: bool,
    pub force_expired: bool,
}

/// POST /test/reset
pub async fn handle_test_reset<B>(req: Request<B>, state: Arc<AppState>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let auth = get_auth_header(&req);
    let body: ResetRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };
    if let Err(e) = authorize_user(&state, auth.as_deref(), &body.user_id) {
        return error_response(e);
    }

    match state.verification.reset(&body.user_id).await {
        Ok(deleted) => json_response(
            StatusCode::OK,
            &ResetResponse {
                success: true,
                deleted,
            },
        ),
        Err(e) => error_response(e),
    }
}

/// POST /test/force-expire
pub async fn handle_force_expire<B>(req: Request<B>, state: Arc<AppState>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let auth = get_auth_header(&req);
    let body: ForceExpireRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };
    if let Err(e) = authorize_user(&state, auth.as_deref(), &body.user_id) {
        return error_response(e);
    }

    match state
        .verification
        .set_force_expired(&body.user_id, body.force_expired)
        .await
    {
        Ok(()) => json_response(
            StatusCode::OK,
            &ForceExpireResponse {
                success: true,
                force_expired: body.force_expired,
            },
        ),
        Err(e) => error_response(e),
    }
}
