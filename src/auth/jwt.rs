//! JWT bearer tokens for verification callers
//!
//! Tokens are signed with HS256 (HMAC-SHA256). The subject claim is the
//! caller's user identity; every endpoint that takes a `userId` checks it
//! against the subject before touching the store.
//!
//! The server only verifies. Tokens are minted by whoever holds the shared
//! secret; [`JwtValidator::generate_token`] is the issuing side for that
//! service and for the test harness.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::TurnstileError;

/// Payload stored in JWT token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// User identity
    pub sub: String,
    /// Device the token was issued to, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// Input for creating a new token
#[derive(Debug, Clone)]
pub struct TokenInput {
    pub user_id: String,
    pub device_id: Option<String>,
}

impl TokenInput {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: None,
        }
    }
}

/// Result of token validation
#[derive(Debug)]
pub struct TokenValidationResult {
    pub valid: bool,
    pub claims: Option<Claims>,
    pub error: Option<String>,
}

impl TokenValidationResult {
    pub fn valid(claims: Claims) -> Self {
        Self {
            valid: true,
            claims: Some(claims),
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            claims: None,
            error: Some(error.into()),
        }
    }
}

/// JWT validator and generator
#[derive(Clone)]
pub struct JwtValidator {
    secret: String,
    expiry_seconds: u64,
}

impl JwtValidator {
    /// Create a new JWT validator
    ///
    /// Returns an error if the secret is empty or too short
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self, TurnstileError> {
        if secret.is_empty() {
            return Err(TurnstileError::Config(
                "JWT_SECRET is required in production mode".into(),
            ));
        }

        if secret.len() < 32 {
            return Err(TurnstileError::Config(
                "JWT_SECRET must be at least 32 characters".into(),
            ));
        }

        Ok(Self {
            secret,
            expiry_seconds,
        })
    }

    /// Mint a signed token for a user, valid for the configured expiry.
    ///
    /// Not called by any route. Exposed for an external issuer linking this
    /// crate, and for tests that need real bearer tokens.
    pub fn generate_token(&self, input: TokenInput) -> Result<String, TurnstileError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TurnstileError::Auth(format!("System time error: {}", e)))?
            .as_secs();

        let claims = Claims {
            sub: input.user_id,
            device_id: input.device_id,
            iat: now,
            exp: now + self.expiry_seconds,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| TurnstileError::Auth(format!("Failed to generate token: {}", e)))
    }

    /// Verify and decode a JWT token
    pub fn verify_token(&self, token: &str) -> TokenValidationResult {
        let validation = Validation::default();

        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        ) {
            Ok(token_data) => TokenValidationResult::valid(token_data.claims),
            Err(err) => {
                use jsonwebtoken::errors::ErrorKind;
                let error_msg = match err.kind() {
                    ErrorKind::ExpiredSignature => "Token expired",
                    ErrorKind::InvalidToken => "Invalid token",
                    ErrorKind::InvalidSignature => "Invalid signature",
                    _ => "Token validation failed",
                };
                TokenValidationResult::invalid(error_msg)
            }
        }
    }
}

/// Extract token from Authorization header.
/// Supports "Bearer <token>" format and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    if !header.contains(' ') {
        let token = header.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    None
}

/// Check a body-claimed identity against the token subject.
///
/// Accepts an exact match, or a test account derived from the subject as
/// `<subject><suffix>` followed by an optional tag (e.g. `alice_test`,
/// `alice_test2`). An empty suffix disables the derivation.
pub fn identity_matches(token_subject: &str, claimed: &str, test_suffix: &str) -> bool {
    if token_subject.is_empty() || claimed.is_empty() {
        return false;
    }
    if token_subject == claimed {
        return true;
    }
    if test_suffix.is_empty() {
        return false;
    }
    claimed
        .strip_prefix(token_subject)
        .map(|rest| rest.starts_with(test_suffix))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_validator() -> JwtValidator {
        JwtValidator::new(
            "test-secret-that-is-at-least-32-characters-long".into(),
            3600,
        )
        .unwrap()
    }

    #[test]
    fn test_generate_and_verify_token() {
        let validator = test_validator();

        let token = validator
            .generate_token(TokenInput {
                user_id: "user-123".into(),
                device_id: Some("device-9".into()),
            })
            .unwrap();

        let result = validator.verify_token(&token);
        assert!(result.valid);

        let claims = result.claims.unwrap();
        assert_eq!(claims.sub, "user-123");
        assert_eq!(claims.device_id.as_deref(), Some("device-9"));
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_issued_lifetime_follows_expiry() {
        let validator = JwtValidator::new(
            "test-secret-that-is-at-least-32-characters-long".into(),
            60,
        )
        .unwrap();
        let token = validator.generate_token(TokenInput::new("alice")).unwrap();
        let claims = validator.verify_token(&token).claims.unwrap();
        assert_eq!(claims.exp - claims.iat, 60);
    }

    #[test]
    fn test_wrong_secret() {
        let validator2 = JwtValidator::new(
            "different-secret-that-is-at-least-32-characters".into(),
            3600,
        )
        .unwrap();

        let token = test_validator()
            .generate_token(TokenInput::new("user-123"))
            .unwrap();

        let result = validator2.verify_token(&token);
        assert!(!result.valid);
        assert_eq!(result.error.as_deref(), Some("Invalid signature"));
    }

    #[test]
    fn test_invalid_token() {
        let result = test_validator().verify_token("invalid-token");
        assert!(!result.valid);
        assert!(result.claims.is_none());
    }

    #[test]
    fn test_secret_validation() {
        assert!(JwtValidator::new("short".into(), 3600).is_err());
        assert!(JwtValidator::new("".into(), 3600).is_err());
        assert!(JwtValidator::new("this-secret-is-at-least-32-chars-long".into(), 3600).is_ok());
    }

    #[test]
    fn test_extract_token_from_header() {
        assert_eq!(
            extract_token_from_header(Some("Bearer abc123")),
            Some("abc123")
        );
        assert_eq!(extract_token_from_header(Some("abc123")), Some("abc123"));
        assert_eq!(extract_token_from_header(None), None);
        assert_eq!(extract_token_from_header(Some("Bearer ")), None);
        assert_eq!(extract_token_from_header(Some("Basic abc123")), None);
    }

    #[test]
    fn test_identity_matches() {
        assert!(identity_matches("alice", "alice", "_test"));
        assert!(identity_matches("alice", "alice_test", "_test"));
        assert!(identity_matches("alice", "alice_test2", "_test"));
        assert!(!identity_matches("alice", "bob", "_test"));
        assert!(!identity_matches("alice", "alicex", "_test"));
        assert!(!identity_matches("alice", "alice_test", ""));
        assert!(!identity_matches("", "", "_test"));
        // derivation is one-way
        assert!(!identity_matches("alice_test", "alice", "_test"));
    }
}
