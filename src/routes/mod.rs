//! HTTP routes for Turnstile
//!
//! Handlers take the request and shared state and always return a response;
//! failures become JSON `{ success: false, error, code }` bodies.

pub mod health;
pub mod subscription;
pub mod test_ops;

pub use health::health_check;
pub use subscription::{
    handle_sync, handle_trial_start, handle_trial_status, handle_verify, handle_verify_purchase,
};
pub use test_ops::{handle_force_expire, handle_test_reset};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::{extract_token_from_header, identity_matches, Claims};
use crate::server::AppState;
use crate::types::TurnstileError;

/// Largest accepted JSON body
const MAX_BODY_BYTES: usize = 10 * 1024;

/// Error type of a size-limited request body
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());

    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

pub fn error_response(err: TurnstileError) -> Response<Full<Bytes>> {
    let status = err.status_code();
    if status.is_server_error() {
        error!(code = err.code(), "{}", err);
    }
    json_response(
        status,
        &ErrorResponse {
            success: false,
            error: err.to_string(),
            code: Some(err.code().to_string()),
        },
    )
}

pub fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &ErrorResponse {
            success: false,
            error: format!("No route for {}", path),
            code: Some("NOT_FOUND".to_string()),
        },
    )
}

pub fn cors_preflight() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}

pub(crate) async fn parse_json_body<T, B>(req: Request<B>) -> Result<T, TurnstileError>
where
    T: for<'de> Deserialize<'de>,
    B: Body,
    B::Error: Into<BoxError>,
{
    // Stops reading once the limit is crossed
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                TurnstileError::PayloadTooLarge(format!(
                    "Request body exceeds {} bytes",
                    MAX_BODY_BYTES
                ))
            } else {
                TurnstileError::Http(format!("Failed to read body: {}", e))
            }
        })?;
    let bytes = body.to_bytes();

    serde_json::from_slice(&bytes)
        .map_err(|e| TurnstileError::BadRequest(format!("Invalid JSON: {}", e)))
}

pub(crate) fn get_auth_header<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Validate the bearer token
pub(crate) fn authenticate(
    state: &AppState,
    auth_header: Option<&str>,
) -> Result<Claims, TurnstileError> {
    let token = extract_token_from_header(auth_header)
        .ok_or_else(|| TurnstileError::Unauthorized("Missing bearer token".into()))?;

    let result = state.jwt.verify_token(token);
    match result.claims {
        Some(claims) if result.valid => Ok(claims),
        _ => Err(TurnstileError::Unauthorized(
            result.error.unwrap_or_else(|| "Invalid token".to_string()),
        )),
    }
}

/// Validate the bearer token and check it may act for `claimed_user`
pub(crate) fn authorize_user(
    state: &AppState,
    auth_header: Option<&str>,
    claimed_user: &str,
) -> Result<Claims, TurnstileError> {
    let claims = authenticate(state, auth_header)?;
    if !identity_matches(&claims.sub, claimed_user, &state.args.test_account_suffix) {
        return Err(TurnstileError::Forbidden(
            "userId does not match the authenticated identity".into(),
        ));
    }
    Ok(claims)
}
