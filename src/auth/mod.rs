//! Caller authentication for the verification server
//!
//! Bearer JWTs identify the caller; body identities must match the token.

pub mod jwt;

pub use jwt::{
    extract_token_from_header, identity_matches, Claims, JwtValidator, TokenInput,
    TokenValidationResult,
};
