//! API token authentication.
//!
//! Authentication is optional: a server configured without a token accepts
//! every request. When a token is configured, mutating endpoints must carry
//! it verbatim in the `Authorization` header. Tokens are compared in
//! constant time to prevent timing attacks.

use std::fmt;

use crate::error::CipherError;

/// Authentication configuration for the API surface.
///
/// # Example
///
/// ```
/// use ytcipher_common::auth::AuthConfig;
///
/// let auth = AuthConfig::with_token("secret");
/// assert!(auth.requires_auth());
/// assert!(auth.check(Some("secret")).is_ok());
///
/// let open = AuthConfig::disabled();
/// assert!(open.check(None).is_ok());
/// ```
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    token: Option<String>,
}

impl AuthConfig {
    /// Creates an `AuthConfig` that requires the given token.
    ///
    /// An empty token disables authentication, matching the behavior of an
    /// unset `API_TOKEN` environment variable.
    pub fn with_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            token: (!token.is_empty()).then_some(token),
        }
    }

    /// Creates an `AuthConfig` that accepts every request.
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn requires_auth(&self) -> bool {
        self.token.is_some()
    }

    /// Validates the `Authorization` header value against the configured
    /// token.
    ///
    /// # Errors
    ///
    /// Returns `CipherError::MissingToken` when auth is required and no
    /// header was sent, `CipherError::InvalidToken` on mismatch.
    pub fn check(&self, header: Option<&str>) -> Result<(), CipherError> {
        let Some(expected) = &self.token else {
            return Ok(());
        };
        match header {
            None => Err(CipherError::MissingToken),
            Some(provided) if constant_time_eq(expected, provided) => Ok(()),
            Some(_) => Err(CipherError::InvalidToken),
        }
    }
}

impl fmt::Display for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(_) => write!(f, "Token(*****)"),
            None => write!(f, "Disabled"),
        }
    }
}

/// Constant-time string comparison.
///
/// Always iterates the full strings so the comparison time does not leak
/// the position of the first differing byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_accepts_everything() {
        let auth = AuthConfig::disabled();
        assert!(!auth.requires_auth());
        assert!(auth.check(None).is_ok());
        assert!(auth.check(Some("anything")).is_ok());
    }

    #[test]
    fn test_empty_token_disables_auth() {
        let auth = AuthConfig::with_token("");
        assert!(!auth.requires_auth());
        assert!(auth.check(None).is_ok());
    }

    #[test]
    fn test_missing_header_rejected() {
        let auth = AuthConfig::with_token("secret");
        assert!(matches!(auth.check(None), Err(CipherError::MissingToken)));
    }

    #[test]
    fn test_wrong_token_rejected() {
        let auth = AuthConfig::with_token("secret");
        assert!(matches!(
            auth.check(Some("wrong")),
            Err(CipherError::InvalidToken)
        ));
    }

    #[test]
    fn test_exact_token_accepted() {
        let auth = AuthConfig::with_token("secret");
        assert!(auth.check(Some("secret")).is_ok());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("hello", "hello"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("hello", "world"));
        assert!(!constant_time_eq("short", "longer"));
    }

    #[test]
    fn test_display_masks_token() {
        assert_eq!(AuthConfig::with_token("secret").to_string(), "Token(*****)");
        assert_eq!(AuthConfig::disabled().to_string(), "Disabled");
    }
}
