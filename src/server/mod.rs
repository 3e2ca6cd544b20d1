//! HTTP server for the verification endpoints

mod http;

pub use http::{handle_request, run, serve, AppState};
