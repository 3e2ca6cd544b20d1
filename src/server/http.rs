//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::JwtValidator;
use crate::config::Args;
use crate::routes::{self, BoxError};
use crate::services::VerificationService;
use crate::types::TurnstileError;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub verification: Arc<VerificationService>,
    pub jwt: JwtValidator,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(args: Args, verification: Arc<VerificationService>) -> Result<Self, TurnstileError> {
        let secret = args.jwt_secret().ok_or_else(|| {
            TurnstileError::Config("JWT_SECRET is required in production mode".into())
        })?;
        let jwt = JwtValidator::new(secret, args.jwt_expiry_seconds)?;

        Ok(Self {
            args,
            verification,
            jwt,
            started_at: Instant::now(),
        })
    }
}

/// Bind the configured address and serve forever
pub async fn run(state: Arc<AppState>) -> Result<(), TurnstileError> {
    let listener = TcpListener::bind(state.args.listen).await?;
    serve(listener, state).await
}

/// Serve connections from an already-bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<(), TurnstileError> {
    info!(
        "Turnstile listening on {} (store: {})",
        listener.local_addr()?,
        state.verification.store_kind()
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - dev JWT secret in use");
    }
    if state.args.test_routes_enabled() {
        warn!("Test routes enabled at /test/*");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(handle_request(state, req).await) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
pub async fn handle_request<B>(state: Arc<AppState>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let span = info_span!("request", id = %Uuid::new_v4(), %method, path = %path);

    async move {
        let response = route(state, req, method, &path).await;
        debug!(status = response.status().as_u16(), "Request complete");
        response
    }
    .instrument(span)
    .await
}

async fn route<B>(
    state: Arc<AppState>,
    req: Request<B>,
    method: Method,
    path: &str,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    match (method, path) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => routes::health_check(&state),

        (Method::POST, "/verify") => routes::handle_verify(req, state).await,

        (Method::POST, "/trial-start") => routes::handle_trial_start(req, state).await,

        (Method::GET, p) if p.starts_with("/trial-status/") => {
            let user_id = &p["/trial-status/".len()..];
            routes::handle_trial_status(req, state, user_id).await
        }

        (Method::POST, "/sync") => routes::handle_sync(req, state).await,

        (Method::POST, "/verify-purchase") => routes::handle_verify_purchase(req, state).await,

        (Method::POST, "/test/reset") if state.args.test_routes_enabled() => {
            routes::handle_test_reset(req, state).await
        }

        (Method::POST, "/test/force-expire") if state.args.test_routes_enabled() => {
            routes::handle_force_expire(req, state).await
        }

        (Method::OPTIONS, _) => routes::cors_preflight(),

        _ => routes::not_found_response(path),
    }
}
